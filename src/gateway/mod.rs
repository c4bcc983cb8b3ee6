//! # Gateway
//!
//! Wires device sessions, the MQTT bridge and the shared mesh collections together
//! and exposes the operations the HTTP boundary calls.
//!
//! ```text
//! DeviceSession ─┐ SessionEvent
//!                ├──────────────► dispatch task ──► Pipeline ──► registry / topology /
//! MqttBridge ────┘ MqttInbound                                  telemetry / messages
//!                                                         └────► EventBus ──► /api/events
//! ```
//!
//! A single dispatch task drains both channels with `tokio::select!`, so packets from
//! one source are applied in the order they were received. A maintenance task prunes
//! stale nodes and edges on an interval.

pub mod api;
pub mod events;
pub mod pipeline;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{Config, GatewaySettings};
use crate::error::{GatewayError, GatewayResult};
use crate::mesh::messages::{MessageLog, MessageRecord};
use crate::mesh::registry::{NodeRegistry, NodeSnapshot};
use crate::mesh::telemetry::{TelemetryHistory, TelemetrySample, TelemetrySummary};
use crate::mesh::topology::{TopologyGraph, TopologySnapshot};
use crate::mesh::traceroute::{TracerouteCoordinator, TracerouteRecord};
use crate::meshtastic::crypto::{ChannelKey, KeyRing};
use crate::meshtastic::mqtt::{FeedRecord, MqttBridge, MqttInbound, MqttStatus};
use crate::meshtastic::session::{
    ChannelInfo, ConfigUpdate, DeviceConfig, DeviceSession, SessionEvent, SessionState,
};
use crate::meshtastic::{format_destination, format_node_id, parse_destination, parse_node_id};
use events::EventBus;
use pipeline::Pipeline;

/// Device entry for the device list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub state: SessionState,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub my_node_id: Option<String>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub firmware_version: Option<String>,
    pub node_count: usize,
    pub channels: Vec<ChannelInfo>,
    pub nodes: Vec<NodeSnapshot>,
}

struct Inner {
    settings: GatewaySettings,
    devices: BTreeMap<String, DeviceSession>,
    configured_keys: Vec<ChannelKey>,
    pipeline: Arc<Pipeline>,
    mqtt: MqttBridge,
    mqtt_enabled: bool,
}

/// Cheap to clone; every clone drives the same gateway.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

/// Background tasks owned by a running gateway.
pub struct GatewayTasks {
    pub dispatch: JoinHandle<()>,
    pub maintenance: JoinHandle<()>,
}

impl GatewayTasks {
    pub fn abort(&self) {
        self.dispatch.abort();
        self.maintenance.abort();
    }
}

impl Gateway {
    /// Build the gateway and spawn its dispatch and maintenance tasks. Devices and the
    /// broker are not contacted until [`Gateway::connect_on_start`] or an explicit call.
    pub fn start(config: &Config) -> Result<(Self, GatewayTasks)> {
        config.validate()?;
        let g = &config.gateway;
        let events = EventBus::new(config.server.event_buffer);

        let registry = Arc::new(NodeRegistry::new());
        let topology = Arc::new(TopologyGraph::new(Arc::clone(&registry)));
        let configured_keys = config.channel_keys()?;
        let keys = Arc::new(RwLock::new(KeyRing::with_keys(configured_keys.clone())));
        let traceroutes = TracerouteCoordinator::new(
            Duration::from_secs(g.traceroute_timeout_secs),
            g.traceroute_retention,
            Arc::clone(&topology),
            events.clone(),
        );
        let pipeline = Arc::new(Pipeline {
            registry,
            topology,
            telemetry: Arc::new(TelemetryHistory::new(g.telemetry_capacity)),
            messages: Arc::new(MessageLog::new(g.message_history)),
            traceroutes,
            keys: Arc::clone(&keys),
            events: events.clone(),
        });

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let devices = config
            .devices
            .iter()
            .map(|d| {
                (
                    d.name.clone(),
                    DeviceSession::new(config.session_config(d), session_tx.clone()),
                )
            })
            .collect();

        let (mqtt_tx, mqtt_rx) = mpsc::unbounded_channel();
        let mqtt = MqttBridge::new(config.mqtt_settings(), keys, events, mqtt_tx);

        let gateway = Gateway {
            inner: Arc::new(Inner {
                settings: g.clone(),
                devices,
                configured_keys,
                pipeline,
                mqtt,
                mqtt_enabled: config.mqtt.enabled,
            }),
        };
        let tasks = GatewayTasks {
            dispatch: tokio::spawn(gateway.clone().dispatch(session_rx, mqtt_rx)),
            maintenance: tokio::spawn(gateway.clone().maintenance_loop()),
        };
        info!(
            "Gateway started: {} device(s), {} configured channel key(s), MQTT {}",
            gateway.inner.devices.len(),
            gateway.inner.configured_keys.len(),
            if config.mqtt.enabled { "enabled" } else { "disabled" }
        );
        Ok((gateway, tasks))
    }

    /// Connect devices and the broker as configured. Failures are logged; the sessions
    /// stay in `error` until reconnected.
    pub fn connect_on_start(&self, config: &Config) {
        if config.session.connect_on_start {
            for session in self.inner.devices.values() {
                let session = session.clone();
                tokio::spawn(async move {
                    if let Err(e) = session.connect().await {
                        warn!("[{}] initial connect failed: {}", session.name(), e);
                    }
                });
            }
        }
        if self.inner.mqtt_enabled && config.mqtt.connect_on_start {
            if let Err(e) = self.inner.mqtt.connect() {
                warn!("MQTT bridge failed to start: {}", e);
            }
        }
    }

    async fn dispatch(
        self,
        mut sessions: mpsc::UnboundedReceiver<SessionEvent>,
        mut mqtt: mpsc::UnboundedReceiver<MqttInbound>,
    ) {
        loop {
            tokio::select! {
                Some(ev) = sessions.recv() => self.handle_session_event(ev),
                Some(inbound) = mqtt.recv() => self.inner.pipeline.on_mqtt_packet(&inbound),
                else => break,
            }
        }
        debug!("Gateway dispatch loop finished");
    }

    fn handle_session_event(&self, ev: SessionEvent) {
        let p = &self.inner.pipeline;
        match ev {
            SessionEvent::StateChanged { device, state, error } => p.on_state(&device, state, error),
            SessionEvent::MyInfo { device, my_node_num } => {
                debug!("[{}] local node {}", device, format_node_id(my_node_num));
            }
            SessionEvent::NodeInfo { device, my_node_num, info } => {
                p.on_node_info(&device, my_node_num, &info)
            }
            SessionEvent::Packet { device, my_node_num, packet } => {
                p.on_device_packet(&device, my_node_num, &packet)
            }
            SessionEvent::Configured { device } => {
                let added = self.rebuild_keys();
                debug!("[{}] key ring rebuilt ({} keys)", device, added);
            }
        }
    }

    /// Configured keys first, then every device's channel keys in device order.
    fn rebuild_keys(&self) -> usize {
        let mut ring = KeyRing::with_keys(self.inner.configured_keys.iter().cloned());
        for session in self.inner.devices.values() {
            for key in session.channel_keys() {
                ring.add(key);
            }
        }
        let len = ring.len();
        *self.inner.pipeline.keys.write() = ring;
        len
    }

    async fn maintenance_loop(self) {
        let period = Duration::from_secs(self.inner.settings.maintenance_interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.run_maintenance();
        }
    }

    /// Remove stale nodes (and their telemetry) and aged-out edges. Returns the counts.
    pub fn run_maintenance(&self) -> (usize, usize) {
        let now = Utc::now();
        let s = &self.inner.settings;
        let p = &self.inner.pipeline;
        let stale = p
            .registry
            .remove_stale(now - ChronoDuration::hours(s.node_stale_hours as i64));
        p.telemetry.forget(&stale);
        let edges = p
            .topology
            .prune(now - ChronoDuration::seconds(s.edge_max_age_secs as i64));
        if !stale.is_empty() || edges > 0 {
            info!("Maintenance: removed {} stale node(s), {} edge(s)", stale.len(), edges);
        }
        (stale.len(), edges)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.pipeline.events
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.pipeline.registry
    }

    fn session(&self, name: &str) -> GatewayResult<&DeviceSession> {
        self.inner
            .devices
            .get(name)
            .ok_or_else(|| GatewayError::UnknownDevice(name.to_string()))
    }

    pub fn device_names(&self) -> Vec<String> {
        self.inner.devices.keys().cloned().collect()
    }

    pub fn list_devices(&self) -> Vec<DeviceSummary> {
        self.inner
            .devices
            .values()
            .map(|s| self.summarize(s))
            .collect()
    }

    pub fn device(&self, name: &str) -> GatewayResult<DeviceSummary> {
        Ok(self.summarize(self.session(name)?))
    }

    fn summarize(&self, session: &DeviceSession) -> DeviceSummary {
        let status = session.status();
        let registry = &self.inner.pipeline.registry;
        let own = status.my_node_num.and_then(|n| registry.get(n));
        let nodes = registry.select(status.owned_nodes.iter().copied());
        DeviceSummary {
            connected: status.state == SessionState::Connected,
            name: status.name,
            host: status.host,
            port: status.port,
            state: status.state,
            error: status.last_error,
            my_node_id: status.my_node_num.map(format_node_id),
            long_name: own
                .as_ref()
                .and_then(|n| n.long_name.clone())
                .or_else(|| status.owner.as_ref().map(|u| u.long_name.clone())),
            short_name: own
                .as_ref()
                .and_then(|n| n.short_name.clone())
                .or_else(|| status.owner.as_ref().map(|u| u.short_name.clone())),
            firmware_version: status.firmware_version,
            node_count: nodes.len(),
            channels: status.channels,
            nodes,
        }
    }

    pub async fn connect_device(&self, name: &str) -> GatewayResult<DeviceSummary> {
        let session = self.session(name)?;
        session.connect().await?;
        Ok(self.summarize(session))
    }

    pub async fn disconnect_device(&self, name: &str) -> GatewayResult<DeviceSummary> {
        let session = self.session(name)?;
        session.disconnect().await?;
        Ok(self.summarize(session))
    }

    pub async fn reconnect_device(&self, name: &str) -> GatewayResult<DeviceSummary> {
        let session = self.session(name)?;
        session.reconnect().await?;
        Ok(self.summarize(session))
    }

    pub async fn reboot_device(&self, name: &str) -> GatewayResult<()> {
        self.session(name)?.reboot().await
    }

    pub fn nodes(&self) -> Vec<NodeSnapshot> {
        self.inner.pipeline.registry.list()
    }

    pub fn messages(&self, limit: Option<usize>) -> Vec<MessageRecord> {
        self.inner.pipeline.messages.list(limit)
    }

    /// Send a text through `device`; the sent message is added to the history.
    pub async fn send_text(
        &self,
        device: &str,
        destination: &str,
        channel: u32,
        text: &str,
    ) -> GatewayResult<MessageRecord> {
        let session = self.session(device)?;
        let to = parse_destination(destination)?;
        let id = session.send_text(to, channel, text).await?;
        let record = MessageRecord {
            id,
            from: session
                .my_node_num()
                .map(format_node_id)
                .unwrap_or_else(|| "local".to_string()),
            to: format_destination(to),
            text: text.to_string(),
            timestamp: Utc::now(),
            rx_snr: None,
            rx_rssi: None,
            hop_start: 0,
            hop_limit: 0,
            device: device.to_string(),
            channel,
            sent: true,
        };
        self.inner.pipeline.record_message(record.clone());
        Ok(record)
    }

    pub fn topology(&self) -> TopologySnapshot {
        self.inner.pipeline.topology.snapshot()
    }

    pub async fn start_traceroute(&self, device: &str, destination: &str) -> GatewayResult<String> {
        let session = self.session(device)?.clone();
        let dest = parse_destination(destination)?;
        if dest == crate::protobuf::BROADCAST_ADDR {
            return Err(GatewayError::InvalidArgument(
                "traceroute needs a single destination node".into(),
            ));
        }
        if session.state() != SessionState::Connected {
            return Err(GatewayError::not_connected(device));
        }
        self.inner
            .pipeline
            .traceroutes
            .start(device, dest, move |packet_id| async move {
                session.request_traceroute_with_id(dest, packet_id).await
            })
            .await
    }

    pub fn traceroute(&self, id: &str) -> GatewayResult<TracerouteRecord> {
        self.inner
            .pipeline
            .traceroutes
            .query(id)
            .ok_or_else(|| GatewayError::UnknownTraceroute(id.to_string()))
    }

    pub fn traceroutes(&self) -> Vec<TracerouteRecord> {
        self.inner.pipeline.traceroutes.list()
    }

    /// History of every node that has samples, keyed by node ID.
    pub fn stats(&self) -> BTreeMap<String, Vec<TelemetrySample>> {
        let p = &self.inner.pipeline;
        p.registry
            .list()
            .into_iter()
            .filter_map(|n| {
                let h = p.telemetry.history(n.num);
                (!h.is_empty()).then_some((n.id, h))
            })
            .collect()
    }

    pub fn node_stats(&self, node: &str) -> GatewayResult<Vec<TelemetrySample>> {
        let num = parse_node_id(node)
            .or_else(|| parse_node_id(&format!("!{}", node)))
            .ok_or_else(|| GatewayError::InvalidArgument(format!("bad node id '{}'", node)))?;
        Ok(self.inner.pipeline.telemetry.history(num))
    }

    pub fn stats_summary(&self) -> TelemetrySummary {
        let p = &self.inner.pipeline;
        p.telemetry.summary(
            &p.registry.list(),
            Utc::now(),
            ChronoDuration::seconds(self.inner.settings.online_window_secs as i64),
        )
    }

    pub fn get_config(&self, device: &str) -> GatewayResult<DeviceConfig> {
        self.session(device)?.get_config()
    }

    pub async fn set_config(&self, device: &str, update: &ConfigUpdate) -> GatewayResult<Vec<String>> {
        self.session(device)?.set_config(update).await
    }

    pub fn get_channel_mqtt(&self, device: &str) -> GatewayResult<Vec<ChannelInfo>> {
        self.session(device)?.get_channel_mqtt()
    }

    pub async fn set_channel_mqtt(
        &self,
        device: &str,
        index: i32,
        uplink: bool,
        downlink: bool,
    ) -> GatewayResult<ChannelInfo> {
        self.session(device)?
            .set_channel_mqtt(index, uplink, downlink)
            .await
    }

    pub fn mqtt_status(&self) -> MqttStatus {
        self.inner.mqtt.status()
    }

    pub fn mqtt_feed(&self, limit: Option<usize>) -> Vec<FeedRecord> {
        self.inner.mqtt.feed(limit)
    }

    pub fn mqtt_connect(&self) -> GatewayResult<MqttStatus> {
        self.inner.mqtt.connect()?;
        Ok(self.inner.mqtt.status())
    }

    pub async fn mqtt_disconnect(&self) -> GatewayResult<MqttStatus> {
        self.inner.mqtt.disconnect().await?;
        Ok(self.inner.mqtt.status())
    }

    /// Publish `text` on `channel` through the broker; recorded as a sent message.
    pub async fn mqtt_send(&self, text: &str, channel: &str) -> GatewayResult<MessageRecord> {
        let id = self.inner.mqtt.publish(text, channel).await?;
        let record = MessageRecord {
            id,
            from: format_node_id(self.inner.mqtt.settings().gateway_node),
            to: format_destination(crate::protobuf::BROADCAST_ADDR),
            text: text.to_string(),
            timestamp: Utc::now(),
            rx_snr: None,
            rx_rssi: None,
            hop_start: crate::meshtastic::mqtt::MQTT_HOP_LIMIT,
            hop_limit: crate::meshtastic::mqtt::MQTT_HOP_LIMIT,
            device: pipeline::MQTT_SOURCE.to_string(),
            channel: 0,
            sent: true,
        };
        self.inner.pipeline.record_message(record.clone());
        Ok(record)
    }

    /// Disconnect every device and the broker.
    pub async fn shutdown(&self) {
        for session in self.inner.devices.values() {
            if let Err(e) = session.disconnect().await {
                debug!("[{}] disconnect during shutdown failed: {}", session.name(), e);
            }
        }
        let _ = self.inner.mqtt.disconnect().await;
        info!("Gateway shut down");
    }
}
