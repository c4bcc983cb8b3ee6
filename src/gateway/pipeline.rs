//! Packet pipeline.
//!
//! Applies what device sessions and the MQTT bridge hear to the shared collections:
//! registry merges, topology observations, telemetry samples, message history and
//! traceroute completion, publishing the matching events as it goes. Each handler runs
//! to completion without awaiting, so packets from one source are applied in order.

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, trace};
use parking_lot::RwLock;
use std::sync::Arc;

use crate::gateway::events::{DeviceStatusChange, EventBus, GatewayEvent, PositionUpdate, TelemetryUpdate};
use crate::logutil::{escape_log, preview};
use crate::mesh::messages::{MessageLog, MessageRecord};
use crate::mesh::registry::{NodeObservation, NodeRegistry};
use crate::mesh::telemetry::{TelemetryHistory, TelemetrySample};
use crate::mesh::topology::{EdgeSource, TopologyGraph};
use crate::mesh::traceroute::TracerouteCoordinator;
use crate::mesh::GeoPosition;
use crate::meshtastic::codec::{routing_error_name, DecodedPacket, Payload};
use crate::meshtastic::crypto::KeyRing;
use crate::meshtastic::format_destination;
use crate::meshtastic::format_node_id;
use crate::meshtastic::mqtt::MqttInbound;
use crate::meshtastic::session::SessionState;
use crate::metrics;
use crate::protobuf::{self as proto, mesh_packet, routing, telemetry, MeshPacket, NodeInfo, User};

/// Source tag used for broker traffic in registry entries and message history.
pub const MQTT_SOURCE: &str = "mqtt";

pub struct Pipeline {
    pub registry: Arc<NodeRegistry>,
    pub topology: Arc<TopologyGraph>,
    pub telemetry: Arc<TelemetryHistory>,
    pub messages: Arc<MessageLog>,
    pub traceroutes: TracerouteCoordinator,
    pub keys: Arc<RwLock<KeyRing>>,
    pub events: EventBus,
}

impl Pipeline {
    pub fn on_state(&self, device: &str, state: SessionState, error: Option<String>) {
        self.events
            .publish(GatewayEvent::DeviceStatusChange(DeviceStatusChange {
                device: device.to_string(),
                state,
                error,
            }));
    }

    /// Node DB entry streamed during a device handshake.
    pub fn on_node_info(&self, device: &str, my_node_num: Option<u32>, info: &NodeInfo) {
        if info.num == 0 {
            return;
        }
        // the radio's clock may run ahead; never stamp a field in the future
        let now = Utc::now();
        let at = if info.last_heard > 0 {
            from_unix(info.last_heard).min(now)
        } else {
            now
        };
        let mut obs = NodeObservation {
            snr: Some(info.snr).filter(|s| *s != 0.0),
            hops_away: info.hops_away,
            via_mqtt: Some(info.via_mqtt),
            position: info.position.as_ref().and_then(GeoPosition::from_proto),
            ..Default::default()
        };
        if let Some(user) = &info.user {
            apply_user(&mut obs, user);
        }
        if let Some(m) = &info.device_metrics {
            apply_device_metrics(&mut obs, m);
        }
        let (node, _) = self.registry.upsert(info.num, obs, device, at);

        if let Some(me) = my_node_num {
            if info.hops_away == Some(0) && info.snr != 0.0 && info.num != me {
                self.topology
                    .add_observation(info.num, me, Some(info.snr), None, at, EdgeSource::NodeDb);
            }
        }

        if let Some(m) = &info.device_metrics {
            let mut sample = TelemetrySample::at(at).with_device_metrics(m);
            sample.snr = node.snr;
            sample.position = node.position;
            self.telemetry.record(info.num, sample);
        }
    }

    /// Packet received by a local device. Encrypted packets are tried against the key ring.
    pub fn on_device_packet(&self, device: &str, my_node_num: Option<u32>, packet: &MeshPacket) {
        let decoded = match &packet.payload_variant {
            Some(mesh_packet::PayloadVariant::Decoded(_)) => match DecodedPacket::from_packet(packet) {
                Ok(d) => d,
                Err(e) => {
                    metrics::inc_format_errors();
                    debug!(
                        "[{}] packet 0x{:08x} from {} dropped: {}",
                        device,
                        packet.id,
                        format_node_id(packet.from),
                        e
                    );
                    return;
                }
            },
            Some(mesh_packet::PayloadVariant::Encrypted(bytes)) => {
                let hash = u8::try_from(packet.channel).ok();
                let result = self.keys.read().decrypt(bytes, packet.id, packet.from, None, hash);
                match result {
                    Ok(dec) => {
                        metrics::inc_decrypted();
                        DecodedPacket::with_payload(packet, &dec.data, dec.payload)
                    }
                    Err(_) => {
                        metrics::inc_undecryptable();
                        trace!("[{}] packet 0x{:08x} is undecryptable", device, packet.id);
                        return;
                    }
                }
            }
            None => return,
        };
        self.ingest(device, my_node_num, &decoded, Some(device));
    }

    pub fn on_mqtt_packet(&self, inbound: &MqttInbound) {
        let mut packet = inbound.packet.clone();
        packet.via_mqtt = true;
        self.ingest(MQTT_SOURCE, inbound.gateway, &packet, None);
    }

    /// Apply one decoded packet. `receiver` is the node that heard it (device node or
    /// MQTT gateway); `device` is set for local radios, whose traceroutes we own.
    fn ingest(&self, source: &str, receiver: Option<u32>, p: &DecodedPacket, device: Option<&str>) {
        if p.from == 0 {
            return;
        }
        let at = Utc::now();
        let mut obs = NodeObservation {
            hops_away: p.hops_away(),
            via_mqtt: Some(p.via_mqtt),
            ..Default::default()
        };
        if p.has_signal() && !p.via_mqtt {
            obs.snr = Some(p.rx_snr);
            obs.rssi = Some(p.rx_rssi).filter(|r| *r != 0);
        }

        let mut position = None;
        let mut metrics_sample = None;
        match &p.payload {
            Payload::Position(pos) => {
                position = GeoPosition::from_proto(pos);
                obs.position = position;
            }
            Payload::User(user) => apply_user(&mut obs, user),
            Payload::Telemetry(t) => {
                if let Some(telemetry::Variant::DeviceMetrics(m)) = &t.variant {
                    apply_device_metrics(&mut obs, m);
                    metrics_sample = Some(TelemetrySample::at(at).with_device_metrics(m));
                }
            }
            _ => {}
        }

        let (node, created) = self.registry.upsert(p.from, obs, source, at);
        if created {
            debug!("New node {} via {}", node.id, source);
        }

        if let Some(r) = receiver {
            if p.is_direct() && r != p.from {
                let snr = Some(p.rx_snr).filter(|_| p.has_signal());
                let rssi = Some(p.rx_rssi).filter(|v| *v != 0);
                self.topology
                    .add_observation(p.from, r, snr, rssi, at, EdgeSource::Direct);
            }
        }

        match &p.payload {
            Payload::Text(text) => self.on_text(source, p, text, at),
            Payload::Position(_) => {
                if let Some(position) = position {
                    self.events.publish(GatewayEvent::PositionUpdate(PositionUpdate {
                        node: node.id.clone(),
                        position,
                        source: source.to_string(),
                    }));
                }
            }
            Payload::Telemetry(_) => {
                if let Some(mut sample) = metrics_sample {
                    sample.snr = node.snr;
                    sample.position = node.position;
                    self.telemetry.record(p.from, sample.clone());
                    self.events.publish(GatewayEvent::TelemetryUpdate(TelemetryUpdate {
                        node: node.id.clone(),
                        source: source.to_string(),
                        sample,
                    }));
                }
            }
            Payload::NeighborInfo(n) => {
                let reporter = if n.node_id != 0 { n.node_id } else { p.from };
                let mut added = 0;
                for nb in &n.neighbors {
                    let snr = Some(nb.snr).filter(|s| *s != 0.0);
                    if self
                        .topology
                        .add_observation(reporter, nb.node_id, snr, None, at, EdgeSource::Neighbor)
                    {
                        added += 1;
                    }
                }
                trace!(
                    "Neighbor report from {}: {}/{} edges applied",
                    format_node_id(reporter),
                    added,
                    n.neighbors.len()
                );
            }
            Payload::Traceroute(route) => {
                // requests from other nodes carry want_response and no request id
                let is_reply = p.request_id != 0 || !p.want_response;
                if let (Some(device), Some(me), true) = (device, receiver, is_reply) {
                    if let Some(id) =
                        self.traceroutes
                            .resolve_response(device, me, p.from, p.request_id, route)
                    {
                        debug!("Traceroute reply from {} completed {}", node.id, id);
                    }
                }
            }
            Payload::Routing(r) => {
                if let (Some(device), Some(routing::Variant::ErrorReason(code))) = (device, &r.variant) {
                    if *code != routing::Error::None as i32 {
                        let reason = routing_error_name(*code);
                        if let Some(id) = self.traceroutes.fail_by_packet(device, p.request_id, &reason) {
                            debug!("Traceroute {} failed with {}", id, reason);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn on_text(&self, source: &str, p: &DecodedPacket, text: &str, at: DateTime<Utc>) {
        info!(
            "[{}] Text from {} to {}: {}",
            source,
            format_node_id(p.from),
            format_destination(p.to),
            escape_log(&preview(text, 120))
        );
        let timestamp = if p.rx_time > 0 { from_unix(p.rx_time) } else { at };
        let record = MessageRecord {
            id: p.id,
            from: format_node_id(p.from),
            to: format_destination(p.to),
            text: text.to_string(),
            timestamp,
            rx_snr: Some(p.rx_snr).filter(|_| p.has_signal()),
            rx_rssi: Some(p.rx_rssi).filter(|v| *v != 0),
            hop_start: p.hop_start,
            hop_limit: p.hop_limit,
            device: source.to_string(),
            channel: p.channel,
            sent: false,
        };
        self.record_message(record);
    }

    /// Append to history and announce. Also used for messages sent through the gateway.
    pub fn record_message(&self, record: MessageRecord) {
        self.messages.push(record.clone());
        self.events.publish(GatewayEvent::MessageReceived(record));
    }
}

fn from_unix(secs: u32) -> DateTime<Utc> {
    Utc.timestamp_opt(i64::from(secs), 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn apply_user(obs: &mut NodeObservation, user: &User) {
    obs.long_name = Some(user.long_name.clone()).filter(|s| !s.is_empty());
    obs.short_name = Some(user.short_name.clone()).filter(|s| !s.is_empty());
    obs.hw_model = Some(proto::hardware_model_name(user.hw_model));
    obs.role = Some(proto::role_name(user.role));
}

fn apply_device_metrics(obs: &mut NodeObservation, m: &proto::DeviceMetrics) {
    obs.battery_level = m.battery_level;
    obs.voltage = m.voltage;
    obs.channel_utilization = m.channel_utilization;
    obs.air_util_tx = m.air_util_tx;
    obs.uptime_seconds = m.uptime_seconds;
}
