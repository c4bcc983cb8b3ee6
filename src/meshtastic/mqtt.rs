//! MQTT broker bridge.
//!
//! Subscribes to `<root>/#` on the configured broker and turns the protobuf
//! `ServiceEnvelope`s published by mesh gateways into decoded packets. Every envelope
//! lands in a bounded live feed (oldest first out); packets that decode, either in the
//! clear or with a key from the shared key ring, are also handed to the packet pipeline.
//!
//! Topic layout (segments after the root, regional sub-roots allowed):
//!
//! ```text
//! 2/e/<channel>/<gateway>     encrypted ServiceEnvelope
//! 2/c/<channel>/<gateway>     ServiceEnvelope (legacy)
//! 2/json/...  2/map/...       counted, ignored
//! 2/stat/<gateway>            ignored
//! ```

use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use prost::Message;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::events::{EventBus, GatewayEvent};
use crate::logutil::preview;
use crate::meshtastic::codec::{decode_payload, DecodedPacket, Payload};
use crate::meshtastic::crypto::{encrypt_data, KeyRing};
use crate::meshtastic::{format_destination, format_node_id, parse_node_id, random_packet_id};
use crate::metrics;
use crate::protobuf::{mesh_packet, MeshPacket, PortNum, ServiceEnvelope, BROADCAST_ADDR};

pub const MQTT_HOP_LIMIT: u32 = 3;
const RATE_WINDOW: Duration = Duration::from_secs(60);
const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub root_topic: String,
    /// Node number used as sender and gateway id when publishing.
    pub gateway_node: u32,
    pub feed_capacity: usize,
    pub keep_alive: Duration,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "mqtt.meshtastic.org".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: format!("meshgate-{:08x}", rand::random::<u32>()),
            root_topic: "msh/US".to_string(),
            gateway_node: 0,
            feed_capacity: 200,
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// How a topic below the root is handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    Envelope { channel: String, gateway: String },
    Json,
    Map,
    Stat,
    Unknown,
}

/// Classify `topic` relative to `root`.
pub fn classify_topic(root: &str, topic: &str) -> TopicKind {
    let Some(rest) = topic
        .strip_prefix(root.trim_end_matches('/'))
        .and_then(|r| r.strip_prefix('/'))
    else {
        return TopicKind::Unknown;
    };
    let segments: Vec<&str> = rest.split('/').collect();
    let Some(pos) = segments.iter().position(|s| *s == "2") else {
        return TopicKind::Unknown;
    };
    match &segments[pos + 1..] {
        ["e" | "c", channel, gateway, ..] => TopicKind::Envelope {
            channel: channel.to_string(),
            gateway: gateway.to_string(),
        },
        ["json", ..] => TopicKind::Json,
        ["map", ..] => TopicKind::Map,
        ["stat", ..] => TopicKind::Stat,
        _ => TopicKind::Unknown,
    }
}

/// Topic a text message for `channel` is published on.
pub fn publish_topic(root: &str, channel: &str, gateway_node: u32) -> String {
    format!(
        "{}/2/e/{}/{}",
        root.trim_end_matches('/'),
        channel,
        format_node_id(gateway_node)
    )
}

/// One envelope as seen on the live feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedRecord {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub channel: String,
    pub gateway: Option<String>,
    pub id: u32,
    pub from: String,
    pub to: String,
    pub port: Option<String>,
    pub payload: Option<Value>,
    /// Arrived encrypted on the wire.
    pub encrypted: bool,
    pub undecryptable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttStatus {
    pub connected: bool,
    pub host: String,
    pub port: u16,
    pub root_topic: String,
    pub messages: u64,
    pub messages_per_minute: usize,
    pub decoded: u64,
    pub undecryptable: u64,
    pub ignored: u64,
    pub feed_size: usize,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub last_message: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A packet from the broker that decoded, for the packet pipeline.
#[derive(Debug, Clone)]
pub struct MqttInbound {
    /// Gateway node that uplinked the packet, when its id parses.
    pub gateway: Option<u32>,
    pub channel: String,
    pub packet: DecodedPacket,
}

#[derive(Default)]
struct Link {
    client: Option<AsyncClient>,
    task: Option<AbortHandle>,
    connected: bool,
    last_error: Option<String>,
    last_message: Option<DateTime<Utc>>,
}

struct Shared {
    settings: MqttSettings,
    keys: Arc<RwLock<KeyRing>>,
    link: Mutex<Link>,
    feed: Mutex<VecDeque<FeedRecord>>,
    recent: Mutex<VecDeque<Instant>>,
    messages: AtomicU64,
    decoded: AtomicU64,
    undecryptable: AtomicU64,
    ignored: AtomicU64,
    events: EventBus,
    sink: mpsc::UnboundedSender<MqttInbound>,
}

/// Handle to the broker bridge. Clones share one connection.
#[derive(Clone)]
pub struct MqttBridge {
    shared: Arc<Shared>,
}

impl MqttBridge {
    pub fn new(
        settings: MqttSettings,
        keys: Arc<RwLock<KeyRing>>,
        events: EventBus,
        sink: mpsc::UnboundedSender<MqttInbound>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                keys,
                link: Mutex::new(Link::default()),
                feed: Mutex::new(VecDeque::new()),
                recent: Mutex::new(VecDeque::new()),
                messages: AtomicU64::new(0),
                decoded: AtomicU64::new(0),
                undecryptable: AtomicU64::new(0),
                ignored: AtomicU64::new(0),
                events,
                sink,
            }),
        }
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.shared.settings
    }

    pub fn is_connected(&self) -> bool {
        self.shared.link.lock().connected
    }

    /// Start the event loop. Broker membership is confirmed asynchronously through
    /// `mqtt-status-change` events.
    pub fn connect(&self) -> GatewayResult<()> {
        let mut link = self.shared.link.lock();
        if link.client.is_some() {
            debug!("MQTT bridge already running");
            return Ok(());
        }
        let s = &self.shared.settings;
        let mut opts = MqttOptions::new(s.client_id.clone(), s.host.clone(), s.port);
        opts.set_keep_alive(s.keep_alive);
        opts.set_max_packet_size(64 * 1024, 64 * 1024);
        if let (Some(user), Some(pass)) = (&s.username, &s.password) {
            opts.set_credentials(user.clone(), pass.clone());
        }
        let (client, eventloop) = AsyncClient::new(opts, 64);
        let task = tokio::spawn(event_loop(Arc::clone(&self.shared), client.clone(), eventloop));
        link.client = Some(client);
        link.task = Some(task.abort_handle());
        link.last_error = None;
        info!("MQTT bridge connecting to {}:{} (root {})", s.host, s.port, s.root_topic);
        Ok(())
    }

    pub async fn disconnect(&self) -> GatewayResult<()> {
        let (client, task) = {
            let mut link = self.shared.link.lock();
            link.connected = false;
            (link.client.take(), link.task.take())
        };
        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                debug!("MQTT disconnect request failed: {}", e);
            }
        }
        if let Some(task) = task {
            task.abort();
            info!("MQTT bridge disconnected");
        }
        self.shared.emit_status();
        Ok(())
    }

    /// Encrypt `text` under `channel`'s key and publish it. Returns the packet id.
    pub async fn publish(&self, text: &str, channel: &str) -> GatewayResult<u32> {
        let client = {
            let link = self.shared.link.lock();
            match (&link.client, link.connected) {
                (Some(c), true) => c.clone(),
                _ => return Err(GatewayError::not_connected("mqtt")),
            }
        };
        if text.is_empty() {
            return Err(GatewayError::InvalidArgument("message text is empty".into()));
        }
        if text.len() > crate::meshtastic::session::MAX_TEXT_BYTES {
            return Err(GatewayError::InvalidArgument(format!(
                "message is {} bytes; the limit is {}",
                text.len(),
                crate::meshtastic::session::MAX_TEXT_BYTES
            )));
        }
        let s = &self.shared.settings;
        let id = random_packet_id();
        let data = Payload::Text(text.to_string()).into_data();
        let (ciphertext, hash) = {
            let keys = self.shared.keys.read();
            let key = keys.key_for_channel(channel);
            (encrypt_data(&data, id, s.gateway_node, &key.key), key.hash)
        };
        let envelope = ServiceEnvelope {
            packet: Some(MeshPacket {
                from: s.gateway_node,
                to: BROADCAST_ADDR,
                channel: hash as u32,
                id,
                hop_limit: MQTT_HOP_LIMIT,
                hop_start: MQTT_HOP_LIMIT,
                via_mqtt: true,
                payload_variant: Some(mesh_packet::PayloadVariant::Encrypted(ciphertext)),
                ..Default::default()
            }),
            channel_id: channel.to_string(),
            gateway_id: format_node_id(s.gateway_node),
        };
        let topic = publish_topic(&s.root_topic, channel, s.gateway_node);
        client
            .publish(topic.clone(), QoS::AtMostOnce, false, envelope.encode_to_vec())
            .await
            .map_err(|e| GatewayError::Mqtt(e.to_string()))?;
        info!("MQTT publish on {}: {}", topic, preview(text, 80));
        Ok(id)
    }

    /// Process one broker message. Returns the feed record when it was an envelope.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) -> Option<FeedRecord> {
        self.shared.handle_message(topic, payload)
    }

    /// Feed records, oldest first; the newest `limit` when given.
    pub fn feed(&self, limit: Option<usize>) -> Vec<FeedRecord> {
        let feed = self.shared.feed.lock();
        let skip = limit.map_or(0, |l| feed.len().saturating_sub(l));
        feed.iter().skip(skip).cloned().collect()
    }

    pub fn status(&self) -> MqttStatus {
        self.shared.status()
    }
}

impl Shared {
    fn status(&self) -> MqttStatus {
        let link = self.link.lock();
        MqttStatus {
            connected: link.connected,
            host: self.settings.host.clone(),
            port: self.settings.port,
            root_topic: self.settings.root_topic.clone(),
            messages: self.messages.load(Ordering::Relaxed),
            messages_per_minute: self.rate(),
            decoded: self.decoded.load(Ordering::Relaxed),
            undecryptable: self.undecryptable.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            feed_size: self.feed.lock().len(),
            last_message: link.last_message,
            last_error: link.last_error.clone(),
        }
    }

    fn emit_status(&self) {
        self.events.publish(GatewayEvent::MqttStatusChange(self.status()));
    }

    fn set_connected(&self, connected: bool, error: Option<String>) {
        {
            let mut link = self.link.lock();
            if link.connected == connected && error.is_none() {
                return;
            }
            link.connected = connected;
            if error.is_some() || connected {
                link.last_error = error;
            }
        }
        self.emit_status();
    }

    /// Messages seen in the last minute.
    fn rate(&self) -> usize {
        let mut recent = self.recent.lock();
        let now = Instant::now();
        while recent
            .front()
            .is_some_and(|t| now.duration_since(*t) > RATE_WINDOW)
        {
            recent.pop_front();
        }
        recent.len()
    }

    fn count_message(&self) {
        metrics::inc_mqtt_messages();
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.recent.lock().push_back(Instant::now());
        self.link.lock().last_message = Some(Utc::now());
        self.rate();
    }

    fn handle_message(&self, topic: &str, payload: &[u8]) -> Option<FeedRecord> {
        self.count_message();
        let (channel, gateway) = match classify_topic(&self.settings.root_topic, topic) {
            TopicKind::Envelope { channel, gateway } => (channel, gateway),
            other => {
                metrics::inc_mqtt_ignored();
                self.ignored.fetch_add(1, Ordering::Relaxed);
                trace!("MQTT {:?} message on {} ignored", other, topic);
                return None;
            }
        };

        let envelope = match ServiceEnvelope::decode(payload) {
            Ok(env) => env,
            Err(e) => {
                metrics::inc_format_errors();
                debug!("MQTT envelope on {} does not decode: {}", topic, e);
                return None;
            }
        };
        let Some(mut packet) = envelope.packet else {
            debug!("MQTT envelope on {} carries no packet", topic);
            return None;
        };
        let channel = if envelope.channel_id.is_empty() {
            channel
        } else {
            envelope.channel_id
        };
        let gateway_id = if envelope.gateway_id.is_empty() {
            gateway
        } else {
            envelope.gateway_id
        };

        let mut record = FeedRecord {
            timestamp: Utc::now(),
            topic: topic.to_string(),
            channel: channel.clone(),
            gateway: Some(gateway_id.clone()).filter(|g| !g.is_empty()),
            id: packet.id,
            from: format_node_id(packet.from),
            to: format_destination(packet.to),
            port: None,
            payload: None,
            encrypted: false,
            undecryptable: false,
        };

        let decoded = match packet.payload_variant.take() {
            Some(mesh_packet::PayloadVariant::Decoded(data)) => {
                match decode_payload(data.portnum, &data.payload) {
                    Ok(p) => {
                        let d = DecodedPacket::with_payload(&packet, &data, p);
                        Some(d)
                    }
                    Err(e) => {
                        metrics::inc_format_errors();
                        record.port = Some(port_label(data.portnum));
                        debug!("MQTT packet 0x{:08x} payload rejected: {}", packet.id, e);
                        None
                    }
                }
            }
            Some(mesh_packet::PayloadVariant::Encrypted(bytes)) => {
                record.encrypted = true;
                let hash = u8::try_from(packet.channel).ok();
                let result = self
                    .keys
                    .read()
                    .decrypt(&bytes, packet.id, packet.from, Some(&channel), hash);
                match result {
                    Ok(dec) => {
                        metrics::inc_decrypted();
                        Some(DecodedPacket::with_payload(&packet, &dec.data, dec.payload))
                    }
                    Err(_) => {
                        metrics::inc_undecryptable();
                        self.undecryptable.fetch_add(1, Ordering::Relaxed);
                        record.undecryptable = true;
                        trace!(
                            "MQTT packet 0x{:08x} from {} on {} is undecryptable",
                            packet.id,
                            record.from,
                            channel
                        );
                        None
                    }
                }
            }
            None => None,
        };

        if let Some(d) = &decoded {
            self.decoded.fetch_add(1, Ordering::Relaxed);
            record.port = Some(d.port().as_str_name().to_string());
            record.payload = Some(d.payload.to_json());
        }

        {
            let mut feed = self.feed.lock();
            while feed.len() >= self.settings.feed_capacity.max(1) {
                feed.pop_front();
            }
            feed.push_back(record.clone());
        }
        self.events.publish(GatewayEvent::MqttPacket(record.clone()));

        if let Some(packet) = decoded {
            let _ = self.sink.send(MqttInbound {
                gateway: parse_node_id(&gateway_id),
                channel,
                packet,
            });
        }
        Some(record)
    }
}

fn port_label(portnum: i32) -> String {
    PortNum::try_from(portnum)
        .map(|p| p.as_str_name().to_string())
        .unwrap_or_else(|_| portnum.to_string())
}

async fn event_loop(shared: Arc<Shared>, client: AsyncClient, mut eventloop: rumqttc::EventLoop) {
    let filter = format!("{}/#", shared.settings.root_topic.trim_end_matches('/'));
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("MQTT connected, subscribing to {}", filter);
                // the request queue is drained by this loop, so never await here
                if let Err(e) = client.try_subscribe(filter.clone(), QoS::AtMostOnce) {
                    warn!("MQTT subscribe failed: {}", e);
                }
                shared.set_connected(true, None);
            }
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                shared.handle_message(&p.topic, &p.payload);
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                shared.set_connected(false, Some("broker closed the session".into()));
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT error: {}", e);
                shared.set_connected(false, Some(e.to_string()));
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_classified() {
        let root = "msh/US";
        assert_eq!(
            classify_topic(root, "msh/US/2/e/LongFast/!aabbccdd"),
            TopicKind::Envelope {
                channel: "LongFast".into(),
                gateway: "!aabbccdd".into()
            }
        );
        assert!(matches!(
            classify_topic(root, "msh/US/bayarea/2/c/Ops/!00000001"),
            TopicKind::Envelope { .. }
        ));
        assert_eq!(classify_topic(root, "msh/US/2/json/LongFast/!1"), TopicKind::Json);
        assert_eq!(classify_topic(root, "msh/US/2/map/"), TopicKind::Map);
        assert_eq!(classify_topic(root, "msh/US/2/stat/!1"), TopicKind::Stat);
        assert_eq!(classify_topic(root, "msh/EU/2/e/LongFast/!1"), TopicKind::Unknown);
        assert_eq!(classify_topic(root, "msh/US/1/e/x"), TopicKind::Unknown);
    }

    #[test]
    fn publish_topic_uses_gateway_id() {
        assert_eq!(
            publish_topic("msh/US/", "LongFast", 0xaabbccdd),
            "msh/US/2/e/LongFast/!aabbccdd"
        );
    }

    #[tokio::test]
    async fn feed_is_bounded_and_ignored_topics_counted() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let settings = MqttSettings {
            feed_capacity: 2,
            ..Default::default()
        };
        let bridge = MqttBridge::new(
            settings,
            Arc::new(RwLock::new(KeyRing::new())),
            EventBus::new(16),
            tx,
        );
        for id in 1..=3u32 {
            let env = ServiceEnvelope {
                packet: Some(MeshPacket {
                    from: 1,
                    to: BROADCAST_ADDR,
                    id,
                    payload_variant: Some(mesh_packet::PayloadVariant::Decoded(
                        Payload::Text(format!("m{}", id)).into_data(),
                    )),
                    ..Default::default()
                }),
                channel_id: "LongFast".into(),
                gateway_id: "!00000009".into(),
            };
            assert!(bridge
                .handle_message("msh/US/2/e/LongFast/!00000009", &env.encode_to_vec())
                .is_some());
        }
        assert!(bridge.handle_message("msh/US/2/json/LongFast/!1", b"{}").is_none());
        let ids: Vec<u32> = bridge.feed(None).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 3]);
        let status = bridge.status();
        assert_eq!(status.messages, 4);
        assert_eq!(status.ignored, 1);
        assert_eq!(status.messages_per_minute, 4);
        assert!(!status.connected);
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let bridge = MqttBridge::new(
            MqttSettings::default(),
            Arc::new(RwLock::new(KeyRing::new())),
            EventBus::new(4),
            tx,
        );
        assert!(matches!(
            bridge.publish("hi", "LongFast").await,
            Err(GatewayError::NotConnected { .. })
        ));
    }
}
