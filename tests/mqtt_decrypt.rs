//! Broker envelopes are decrypted with whichever key in the shared ring fits, and
//! stay on the feed as undecryptable when none does.
use parking_lot::RwLock;
use prost::Message;
use std::sync::Arc;
use tokio::sync::mpsc;

use meshgate::gateway::events::{EventBus, GatewayEvent};
use meshgate::meshtastic::codec::Payload;
use meshgate::meshtastic::crypto::{encrypt_data, ChannelKey, KeyMaterial, KeyRing};
use meshgate::meshtastic::mqtt::{MqttBridge, MqttSettings};
use meshgate::protobuf::{mesh_packet, MeshPacket, ServiceEnvelope, BROADCAST_ADDR};

const SENDER: u32 = 0xaabb_ccdd;
const PACKET_ID: u32 = 0x1234;
const TOPIC: &str = "msh/US/2/e/Ops/!00000009";

fn k1() -> ChannelKey {
    ChannelKey::from_base64("Alpha", "AQIDBAUGBwgJCgsMDQ4PEA==")
        .unwrap()
        .unwrap()
}

fn k2() -> ChannelKey {
    ChannelKey::from_base64("Ops", "ICEiIyQlJicoKSorLC0uLw==")
        .unwrap()
        .unwrap()
}

fn envelope(key: &KeyMaterial) -> Vec<u8> {
    let data = Payload::Text("hello mesh".into()).into_data();
    let packet = MeshPacket {
        from: SENDER,
        to: BROADCAST_ADDR,
        id: PACKET_ID,
        hop_limit: 3,
        hop_start: 3,
        payload_variant: Some(mesh_packet::PayloadVariant::Encrypted(encrypt_data(
            &data, PACKET_ID, SENDER, key,
        ))),
        ..Default::default()
    };
    ServiceEnvelope {
        packet: Some(packet),
        channel_id: "Ops".into(),
        gateway_id: "!00000009".into(),
    }
    .encode_to_vec()
}

#[tokio::test]
async fn envelope_decrypts_only_once_its_key_is_in_the_ring() {
    let keys = Arc::new(RwLock::new(KeyRing::with_keys([k1()])));
    let events = EventBus::new(16);
    let mut event_rx = events.subscribe();
    let (tx, mut inbound) = mpsc::unbounded_channel();
    let bridge = MqttBridge::new(MqttSettings::default(), Arc::clone(&keys), events, tx);
    let payload = envelope(&k2().key);

    let record = bridge.handle_message(TOPIC, &payload).expect("envelope");
    assert!(record.encrypted);
    assert!(record.undecryptable);
    assert_eq!(record.payload, None);
    assert_eq!(record.from, "!aabbccdd");
    assert_eq!(record.channel, "Ops");
    assert!(inbound.try_recv().is_err());
    assert!(matches!(event_rx.try_recv(), Ok(GatewayEvent::MqttPacket(r)) if r.undecryptable));

    keys.write().add(k2());
    let record = bridge.handle_message(TOPIC, &payload).expect("envelope");
    assert!(record.encrypted);
    assert!(!record.undecryptable);
    assert_eq!(record.port.as_deref(), Some("TEXT_MESSAGE_APP"));
    assert_eq!(record.payload, Some(serde_json::json!({ "text": "hello mesh" })));

    let msg = inbound.try_recv().expect("decoded packet forwarded");
    assert_eq!(msg.gateway, Some(9));
    assert_eq!(msg.channel, "Ops");
    assert_eq!(msg.packet.from, SENDER);
    assert_eq!(msg.packet.payload, Payload::Text("hello mesh".into()));
    assert_eq!(msg.packet.hops_away(), Some(0));

    let status = bridge.status();
    assert_eq!(status.messages, 2);
    assert_eq!(status.decoded, 1);
    assert_eq!(status.undecryptable, 1);
    assert_eq!(status.feed_size, 2);
}

#[tokio::test]
async fn default_channel_traffic_needs_no_configured_key() {
    let keys = Arc::new(RwLock::new(KeyRing::new()));
    let (tx, mut inbound) = mpsc::unbounded_channel();
    let bridge = MqttBridge::new(MqttSettings::default(), keys, EventBus::new(4), tx);
    let fallback = ChannelKey::fallback();

    let record = bridge
        .handle_message("msh/US/2/e/LongFast/!00000009", &envelope(&fallback.key))
        .expect("envelope");
    assert!(!record.undecryptable);
    assert!(inbound.try_recv().is_ok());
}
