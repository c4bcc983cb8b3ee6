//! JSON API and server-sent events over `axum`.
//!
//! Errors map onto status codes in one place ([`ApiError`]); handlers return
//! `Result<Json<_>, ApiError>` and use `?` on gateway operations.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use log::{debug, info};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;

use crate::error::GatewayError;
use crate::gateway::{DeviceSummary, Gateway};
use crate::mesh::messages::MessageRecord;
use crate::mesh::registry::NodeSnapshot;
use crate::mesh::telemetry::{TelemetrySample, TelemetrySummary};
use crate::mesh::topology::TopologySnapshot;
use crate::mesh::traceroute::TracerouteRecord;
use crate::meshtastic::crypto::DEFAULT_CHANNEL_NAME;
use crate::meshtastic::mqtt::{FeedRecord, MqttStatus};
use crate::meshtastic::session::{ChannelInfo, ConfigUpdate, DeviceConfig};
use crate::meshtastic::BROADCAST_MARKER;
use crate::metrics;

/// A gateway error on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            GatewayError::NotConnected { .. } => StatusCode::CONFLICT,
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UnknownDevice(_) | GatewayError::UnknownTraceroute(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            GatewayError::Rejected(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        debug!("API error {}: {}", status, self.0);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

fn default_destination() -> String {
    BROADCAST_MARKER.to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub device: String,
    #[serde(default = "default_destination")]
    pub destination: String,
    #[serde(default)]
    pub channel_index: u32,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct TracerouteRequest {
    pub device: String,
    pub destination: String,
}

#[derive(Debug, Deserialize)]
pub struct ChannelMqttRequest {
    pub index: i32,
    pub uplink: bool,
    pub downlink: bool,
}

fn default_channel() -> String {
    DEFAULT_CHANNEL_NAME.to_string()
}

#[derive(Debug, Deserialize)]
pub struct MqttSendRequest {
    pub text: String,
    #[serde(default = "default_channel")]
    pub channel: String,
}

pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{name}", get(get_device))
        .route("/api/devices/{name}/connect", post(connect_device))
        .route("/api/devices/{name}/disconnect", post(disconnect_device))
        .route("/api/devices/{name}/reconnect", post(reconnect_device))
        .route("/api/devices/{name}/reboot", post(reboot_device))
        .route("/api/nodes", get(list_nodes))
        .route("/api/messages", get(list_messages))
        .route("/api/send", post(send_text))
        .route("/api/topology", get(topology))
        .route("/api/traceroute", get(list_traceroutes).post(start_traceroute))
        .route("/api/traceroute/{id}", get(get_traceroute))
        .route("/api/stats", get(stats))
        .route("/api/stats/summary", get(stats_summary))
        .route("/api/stats/{node}", get(node_stats))
        .route("/api/config/{device}", get(get_config))
        .route("/api/config/{device}/set", post(set_config))
        .route("/api/channels/{device}/mqtt", get(get_channel_mqtt).post(set_channel_mqtt))
        .route("/api/mqtt/status", get(mqtt_status))
        .route("/api/mqtt/feed", get(mqtt_feed))
        .route("/api/mqtt/connect", post(mqtt_connect))
        .route("/api/mqtt/disconnect", post(mqtt_disconnect))
        .route("/api/mqtt/send", post(mqtt_send))
        .route("/api/metrics", get(metrics_snapshot))
        .route("/api/events", get(events))
        .with_state(gateway)
}

/// Serve the API on `addr` until `shutdown` resolves.
pub async fn serve(
    gateway: Gateway,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn list_devices(State(g): State<Gateway>) -> Json<Vec<DeviceSummary>> {
    Json(g.list_devices())
}

async fn get_device(State(g): State<Gateway>, Path(name): Path<String>) -> ApiResult<DeviceSummary> {
    Ok(Json(g.device(&name)?))
}

async fn connect_device(State(g): State<Gateway>, Path(name): Path<String>) -> ApiResult<DeviceSummary> {
    Ok(Json(g.connect_device(&name).await?))
}

async fn disconnect_device(State(g): State<Gateway>, Path(name): Path<String>) -> ApiResult<DeviceSummary> {
    Ok(Json(g.disconnect_device(&name).await?))
}

async fn reconnect_device(State(g): State<Gateway>, Path(name): Path<String>) -> ApiResult<DeviceSummary> {
    Ok(Json(g.reconnect_device(&name).await?))
}

async fn reboot_device(State(g): State<Gateway>, Path(name): Path<String>) -> ApiResult<Value> {
    g.reboot_device(&name).await?;
    Ok(Json(json!({ "status": "rebooting" })))
}

async fn list_nodes(State(g): State<Gateway>) -> Json<Vec<NodeSnapshot>> {
    Json(g.nodes())
}

async fn list_messages(State(g): State<Gateway>, Query(q): Query<LimitQuery>) -> Json<Vec<MessageRecord>> {
    Json(g.messages(q.limit))
}

async fn send_text(State(g): State<Gateway>, Json(req): Json<SendRequest>) -> ApiResult<MessageRecord> {
    Ok(Json(
        g.send_text(&req.device, &req.destination, req.channel_index, &req.text)
            .await?,
    ))
}

async fn topology(State(g): State<Gateway>) -> Json<TopologySnapshot> {
    Json(g.topology())
}

async fn start_traceroute(State(g): State<Gateway>, Json(req): Json<TracerouteRequest>) -> ApiResult<Value> {
    let id = g.start_traceroute(&req.device, &req.destination).await?;
    Ok(Json(json!({ "id": id, "status": "pending" })))
}

async fn list_traceroutes(State(g): State<Gateway>) -> Json<Vec<TracerouteRecord>> {
    Json(g.traceroutes())
}

async fn get_traceroute(State(g): State<Gateway>, Path(id): Path<String>) -> ApiResult<TracerouteRecord> {
    Ok(Json(g.traceroute(&id)?))
}

async fn stats(State(g): State<Gateway>) -> Json<BTreeMap<String, Vec<TelemetrySample>>> {
    Json(g.stats())
}

async fn stats_summary(State(g): State<Gateway>) -> Json<TelemetrySummary> {
    Json(g.stats_summary())
}

async fn node_stats(State(g): State<Gateway>, Path(node): Path<String>) -> ApiResult<Vec<TelemetrySample>> {
    Ok(Json(g.node_stats(&node)?))
}

async fn get_config(State(g): State<Gateway>, Path(device): Path<String>) -> ApiResult<DeviceConfig> {
    Ok(Json(g.get_config(&device)?))
}

async fn set_config(
    State(g): State<Gateway>,
    Path(device): Path<String>,
    Json(update): Json<ConfigUpdate>,
) -> ApiResult<Value> {
    let applied = g.set_config(&device, &update).await?;
    Ok(Json(json!({ "status": "ok", "applied": applied })))
}

async fn get_channel_mqtt(State(g): State<Gateway>, Path(device): Path<String>) -> ApiResult<Vec<ChannelInfo>> {
    Ok(Json(g.get_channel_mqtt(&device)?))
}

async fn set_channel_mqtt(
    State(g): State<Gateway>,
    Path(device): Path<String>,
    Json(req): Json<ChannelMqttRequest>,
) -> ApiResult<ChannelInfo> {
    Ok(Json(
        g.set_channel_mqtt(&device, req.index, req.uplink, req.downlink)
            .await?,
    ))
}

async fn mqtt_status(State(g): State<Gateway>) -> Json<MqttStatus> {
    Json(g.mqtt_status())
}

async fn mqtt_feed(State(g): State<Gateway>, Query(q): Query<LimitQuery>) -> Json<Vec<FeedRecord>> {
    Json(g.mqtt_feed(q.limit))
}

async fn mqtt_connect(State(g): State<Gateway>) -> ApiResult<MqttStatus> {
    Ok(Json(g.mqtt_connect()?))
}

async fn mqtt_disconnect(State(g): State<Gateway>) -> ApiResult<MqttStatus> {
    Ok(Json(g.mqtt_disconnect().await?))
}

async fn mqtt_send(State(g): State<Gateway>, Json(req): Json<MqttSendRequest>) -> ApiResult<MessageRecord> {
    Ok(Json(g.mqtt_send(&req.text, &req.channel).await?))
}

async fn metrics_snapshot() -> Json<metrics::Snapshot> {
    Json(metrics::snapshot())
}

/// One SSE event per gateway event; a lagging client skips what it missed.
async fn events(State(g): State<Gateway>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = g.events().subscribe();
    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    let data = ev.data_json().to_string();
                    let event = Event::default().event(ev.name()).data(data);
                    return Some((Ok(event), rx));
                }
                Err(RecvError::Lagged(n)) => debug!("SSE client lagged, {} event(s) skipped", n),
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (GatewayError::not_connected("base"), StatusCode::CONFLICT),
            (GatewayError::timeout("ack"), StatusCode::GATEWAY_TIMEOUT),
            (GatewayError::UnknownDevice("x".into()), StatusCode::NOT_FOUND),
            (GatewayError::UnknownTraceroute("tr-1-0".into()), StatusCode::NOT_FOUND),
            (GatewayError::InvalidArgument("bad".into()), StatusCode::BAD_REQUEST),
            (GatewayError::Rejected("NO_ROUTE".into()), StatusCode::BAD_GATEWAY),
            (GatewayError::Undecryptable, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }

    #[test]
    fn send_request_defaults_to_broadcast() {
        let req: SendRequest = serde_json::from_str(r#"{"device":"base","text":"hi"}"#).unwrap();
        assert_eq!(req.destination, "^all");
        assert_eq!(req.channel_index, 0);
        let req: SendRequest =
            serde_json::from_str(r#"{"device":"base","text":"hi","destination":"!0000002a","channelIndex":2}"#)
                .unwrap();
        assert_eq!(req.channel_index, 2);
    }
}
