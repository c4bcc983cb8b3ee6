//! Push events for the boundary.
//!
//! Delivery is best effort: events go out on a `tokio::sync::broadcast` channel and a
//! subscriber that is absent (or lagging past the buffer) simply misses them. Clients
//! recover by re-reading state through the query API.

use log::trace;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::mesh::messages::MessageRecord;
use crate::mesh::telemetry::TelemetrySample;
use crate::mesh::traceroute::TracerouteRecord;
use crate::mesh::GeoPosition;
use crate::meshtastic::mqtt::{FeedRecord, MqttStatus};
use crate::meshtastic::session::SessionState;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionUpdate {
    pub node: String,
    pub position: GeoPosition,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryUpdate {
    pub node: String,
    pub source: String,
    pub sample: TelemetrySample,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatusChange {
    pub device: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum GatewayEvent {
    MessageReceived(MessageRecord),
    PositionUpdate(PositionUpdate),
    TelemetryUpdate(TelemetryUpdate),
    TracerouteResolved(TracerouteRecord),
    MqttPacket(FeedRecord),
    MqttStatusChange(MqttStatus),
    DeviceStatusChange(DeviceStatusChange),
}

impl GatewayEvent {
    /// Event name as used on the wire (SSE `event:` field).
    pub fn name(&self) -> &'static str {
        match self {
            GatewayEvent::MessageReceived(_) => "message-received",
            GatewayEvent::PositionUpdate(_) => "position-update",
            GatewayEvent::TelemetryUpdate(_) => "telemetry-update",
            GatewayEvent::TracerouteResolved(_) => "traceroute-resolved",
            GatewayEvent::MqttPacket(_) => "mqtt-packet",
            GatewayEvent::MqttStatusChange(_) => "mqtt-status-change",
            GatewayEvent::DeviceStatusChange(_) => "device-status-change",
        }
    }

    /// The event payload alone, without the tag wrapper.
    pub fn data_json(&self) -> serde_json::Value {
        let result = match self {
            GatewayEvent::MessageReceived(m) => serde_json::to_value(m),
            GatewayEvent::PositionUpdate(p) => serde_json::to_value(p),
            GatewayEvent::TelemetryUpdate(t) => serde_json::to_value(t),
            GatewayEvent::TracerouteResolved(r) => serde_json::to_value(r),
            GatewayEvent::MqttPacket(f) => serde_json::to_value(f),
            GatewayEvent::MqttStatusChange(s) => serde_json::to_value(s),
            GatewayEvent::DeviceStatusChange(d) => serde_json::to_value(d),
        };
        result.unwrap_or(serde_json::Value::Null)
    }
}

/// Cloneable handle onto the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: GatewayEvent) {
        let name = event.name();
        // Err only means nobody is listening right now
        if self.tx.send(event).is_err() {
            trace!("event {} dropped: no subscribers", name);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_kebab_tags() {
        let ev = GatewayEvent::PositionUpdate(PositionUpdate {
            node: "!00000001".into(),
            position: GeoPosition {
                latitude: 1.5,
                longitude: 2.5,
                altitude: None,
            },
            source: "base".into(),
        });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "position-update");
        assert_eq!(v["data"]["node"], "!00000001");
        assert_eq!(ev.name(), "position-update");
        assert_eq!(ev.data_json()["position"]["latitude"], 1.5);
    }

    #[tokio::test]
    async fn absent_subscribers_miss_events() {
        let bus = EventBus::new(8);
        let mqtt = GatewayEvent::MqttStatusChange(MqttStatus::default());
        bus.publish(mqtt.clone());
        let mut rx = bus.subscribe();
        bus.publish(mqtt.clone());
        assert_eq!(rx.recv().await.unwrap(), mqtt);
        assert!(rx.try_recv().is_err());
    }
}
