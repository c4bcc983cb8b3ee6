//! End-to-end device session against a scripted radio on a local TCP socket.
//!
//! The fake radio answers the configuration handshake, streams a text message from a
//! remote node, acknowledges every packet it is given with a `QueueStatus` and answers
//! traceroute requests. Variants of the script cover silent, noisy and flaky radios.
use prost::Message;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};

use meshgate::config::{Config, DeviceConfig};
use meshgate::gateway::events::GatewayEvent;
use meshgate::gateway::Gateway;
use meshgate::mesh::traceroute::TracerouteStatus;
use meshgate::meshtastic::codec::{decode_to_radio_body, encode_from_radio, Payload};
use meshgate::meshtastic::framer::StreamFramer;
use meshgate::meshtastic::session::{DeviceSession, SessionConfig, SessionEvent, SessionState};
use meshgate::metrics;
use meshgate::protobuf::{
    config, from_radio, mesh_packet, to_radio, Channel, ChannelSettings, Data, FromRadio, LoRaConfig,
    MeshPacket, MyNodeInfo, NodeInfo, PortNum, QueueStatus, RouteDiscovery, User, BROADCAST_ADDR,
};
use meshgate::GatewayError;

const ME: u32 = 0x0000_abcd;
const REMOTE: u32 = 0xaabb_ccdd;
const RELAY: u32 = 0x0000_1111;
const FAR: u32 = 0x0000_2222;

fn from_radio(variant: from_radio::PayloadVariant) -> FromRadio {
    FromRadio {
        id: 0,
        payload_variant: Some(variant),
    }
}

fn node_info(num: u32, long_name: &str, short_name: &str) -> NodeInfo {
    NodeInfo {
        num,
        user: Some(User {
            id: format!("!{:08x}", num),
            long_name: long_name.into(),
            short_name: short_name.into(),
            ..Default::default()
        }),
        snr: if num == ME { 0.0 } else { 5.0 },
        hops_away: Some(0),
        ..Default::default()
    }
}

fn handshake(nonce: u32) -> Vec<FromRadio> {
    vec![
        from_radio(from_radio::PayloadVariant::MyInfo(MyNodeInfo {
            my_node_num: ME,
            ..Default::default()
        })),
        from_radio(from_radio::PayloadVariant::NodeInfo(node_info(ME, "Base Station", "BASE"))),
        from_radio(from_radio::PayloadVariant::NodeInfo(node_info(REMOTE, "Remote", "RMT"))),
        from_radio(from_radio::PayloadVariant::Channel(Channel {
            index: 0,
            role: 1,
            settings: Some(ChannelSettings {
                psk: vec![1],
                ..Default::default()
            }),
        })),
        from_radio(from_radio::PayloadVariant::Config(meshgate::protobuf::Config {
            payload_variant: Some(config::PayloadVariant::Lora(LoRaConfig {
                use_preset: true,
                hop_limit: 5,
                tx_enabled: true,
                ..Default::default()
            })),
        })),
        from_radio(from_radio::PayloadVariant::ConfigCompleteId(nonce)),
        text_packet(77, "hello base"),
    ]
}

/// Text from a node two hops out that the radio never listed in its node DB.
fn relayed_packet() -> FromRadio {
    from_radio(from_radio::PayloadVariant::Packet(MeshPacket {
        from: FAR,
        to: BROADCAST_ADDR,
        id: 79,
        hop_limit: 1,
        hop_start: 3,
        payload_variant: Some(mesh_packet::PayloadVariant::Decoded(
            Payload::Text("from afar".into()).into_data(),
        )),
        ..Default::default()
    }))
}

fn text_packet(id: u32, text: &str) -> FromRadio {
    from_radio(from_radio::PayloadVariant::Packet(MeshPacket {
        from: REMOTE,
        to: BROADCAST_ADDR,
        id,
        rx_snr: 6.5,
        rx_rssi: -90,
        hop_limit: 3,
        hop_start: 3,
        payload_variant: Some(mesh_packet::PayloadVariant::Decoded(
            Payload::Text(text.into()).into_data(),
        )),
        ..Default::default()
    }))
}

/// Reply to a traceroute request as the destination would, via one relay.
fn traceroute_reply(request: &MeshPacket) -> FromRadio {
    let route = RouteDiscovery {
        route: vec![RELAY],
        snr_towards: vec![20, 12],
        ..Default::default()
    };
    from_radio(from_radio::PayloadVariant::Packet(MeshPacket {
        from: request.to,
        to: ME,
        id: 900,
        hop_limit: 5,
        hop_start: 7,
        payload_variant: Some(mesh_packet::PayloadVariant::Decoded(Data {
            portnum: PortNum::TracerouteApp as i32,
            payload: route.encode_to_vec(),
            request_id: request.id,
            ..Default::default()
        })),
        ..Default::default()
    }))
}

async fn send(sock: &mut TcpStream, msgs: &[FromRadio]) {
    for m in msgs {
        sock.write_all(&encode_from_radio(m).unwrap()).await.unwrap();
    }
}

/// How the fake radio misbehaves. The default is a well-behaved radio.
#[derive(Clone, Copy, Default)]
struct Script {
    /// Close every connection as soon as it is accepted.
    hang_up: bool,
    /// Never answer `want_config_id`.
    mute: bool,
    /// Accept packets without ever acknowledging them.
    no_acks: bool,
    /// Follow the handshake with a malformed frame, an oversize header and one more text.
    noisy: bool,
    /// Drop the first connection shortly after the handshake.
    drop_first: bool,
}

struct Radio {
    port: u16,
    accepts: Arc<AtomicUsize>,
    packets: mpsc::UnboundedReceiver<MeshPacket>,
}

/// Serve every connection on a local port; each mesh packet the gateway sends is
/// forwarded to the test.
async fn spawn_radio_with(script: Script) -> Radio {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepts = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::unbounded_channel();
    let counter = Arc::clone(&accepts);
    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else { return };
            let nth = counter.fetch_add(1, Ordering::SeqCst);
            if script.hang_up {
                drop(sock);
                continue;
            }
            tokio::spawn(serve(sock, nth, script, tx.clone()));
        }
    });
    Radio {
        port,
        accepts,
        packets: rx,
    }
}

async fn spawn_radio() -> (u16, mpsc::UnboundedReceiver<MeshPacket>) {
    let radio = spawn_radio_with(Script::default()).await;
    (radio.port, radio.packets)
}

async fn serve(mut sock: TcpStream, nth: usize, script: Script, tx: mpsc::UnboundedSender<MeshPacket>) {
    let mut framer = StreamFramer::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = match sock.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        framer.push(&buf[..n]);
        while let Some(body) = framer.next_frame() {
            let msg = decode_to_radio_body(&body).unwrap();
            match msg.payload_variant {
                Some(to_radio::PayloadVariant::WantConfigId(_)) if script.mute => {}
                Some(to_radio::PayloadVariant::WantConfigId(nonce)) => {
                    send(&mut sock, &handshake(nonce)).await;
                    if script.noisy {
                        // body is not a valid FromRadio, then a header claiming 65535 bytes
                        sock.write_all(&[0x94, 0xc3, 0x00, 0x03, 0xff, 0xff, 0xff]).await.unwrap();
                        sock.write_all(&[0x94, 0xc3, 0xff, 0xff]).await.unwrap();
                        send(&mut sock, &[relayed_packet(), text_packet(78, "after the noise")]).await;
                    }
                    if script.drop_first && nth == 0 {
                        sleep(Duration::from_millis(200)).await;
                        return;
                    }
                }
                Some(to_radio::PayloadVariant::Packet(p)) => {
                    if !script.no_acks {
                        let mut replies = vec![from_radio(from_radio::PayloadVariant::QueueStatus(
                            QueueStatus {
                                res: 0,
                                free: 15,
                                maxlen: 16,
                                mesh_packet_id: p.id,
                            },
                        ))];
                        if let Some(mesh_packet::PayloadVariant::Decoded(d)) = &p.payload_variant {
                            if d.portnum == PortNum::TracerouteApp as i32 {
                                replies.push(traceroute_reply(&p));
                            }
                        }
                        send(&mut sock, &replies).await;
                    }
                    let _ = tx.send(p);
                }
                Some(to_radio::PayloadVariant::Disconnect(_)) => return,
                _ => {}
            }
        }
    }
}

fn session_config(port: u16) -> SessionConfig {
    let mut config = SessionConfig::new("base", "127.0.0.1", port);
    config.connect_timeout = Duration::from_secs(2);
    config.handshake_timeout = Duration::from_secs(5);
    config.command_timeout = Duration::from_secs(5);
    config
}

/// Next session event matching `pred`, within five seconds.
async fn next_session_event<F>(rx: &mut mpsc::UnboundedReceiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(ev) if pred(&ev) => return ev,
                Some(_) => continue,
                None => panic!("session event stream closed"),
            }
        }
    })
    .await
    .expect("session event within deadline")
}

fn is_state(ev: &SessionEvent, want: SessionState) -> bool {
    matches!(ev, SessionEvent::StateChanged { state, .. } if *state == want)
}

fn gateway_config(port: u16) -> Config {
    let mut config = Config::default();
    config.devices = vec![DeviceConfig {
        name: "base".into(),
        host: "127.0.0.1".into(),
        port,
    }];
    config.session.connect_on_start = false;
    config.session.reconnect_interval_secs = None;
    config.logging.file = None;
    config
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<GatewayEvent>, mut pred: F) -> GatewayEvent
where
    F: FnMut(&GatewayEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(ev) if pred(&ev) => return ev,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("event within deadline")
}

#[tokio::test]
async fn handshake_packets_and_commands_flow_through_the_gateway() {
    let (port, mut radio_rx) = spawn_radio().await;
    let config = gateway_config(port);
    let (gateway, tasks) = Gateway::start(&config).unwrap();
    let mut events = gateway.events().subscribe();

    let summary = gateway.connect_device("base").await.unwrap();
    assert_eq!(summary.state, SessionState::Connected);
    assert!(summary.connected);
    assert_eq!(summary.my_node_id.as_deref(), Some("!0000abcd"));

    let ev = wait_for(&mut events, |e| matches!(e, GatewayEvent::MessageReceived(_))).await;
    let GatewayEvent::MessageReceived(msg) = ev else { unreachable!() };
    assert_eq!(msg.text, "hello base");
    assert_eq!(msg.from, "!aabbccdd");
    assert_eq!(msg.to, "^all");
    assert_eq!(msg.device, "base");
    assert_eq!(msg.rx_snr, Some(6.5));
    assert!(!msg.sent);

    // node DB entries and the packet itself reached the registry
    let remote = gateway.registry().get(REMOTE).expect("remote node");
    assert_eq!(remote.long_name.as_deref(), Some("Remote"));
    assert_eq!(remote.rssi, Some(-90));
    assert_eq!(remote.source, "base");

    let device = gateway.device("base").unwrap();
    assert_eq!(device.long_name.as_deref(), Some("Base Station"));
    assert_eq!(device.node_count, 2);
    assert_eq!(device.channels.len(), 1);
    assert_eq!(device.channels[0].role, "PRIMARY");

    let topology = gateway.topology();
    assert!(topology
        .edges
        .iter()
        .any(|e| [e.from.as_str(), e.to.as_str()] == ["!aabbccdd", "!0000abcd"]
            || [e.from.as_str(), e.to.as_str()] == ["!0000abcd", "!aabbccdd"]));

    let config_view = gateway.get_config("base").unwrap();
    assert_eq!(config_view.lora.as_ref().map(|l| l.hop_limit), Some(5));

    // outbound text is acknowledged through QueueStatus and recorded as sent
    let record = gateway.send_text("base", "!aabbccdd", 0, "hi remote").await.unwrap();
    assert!(record.sent);
    assert_eq!(record.from, "!0000abcd");
    assert_eq!(record.to, "!aabbccdd");
    let sent = radio_rx.recv().await.unwrap();
    assert_eq!(sent.id, record.id);
    assert_eq!(sent.to, REMOTE);
    assert!(sent.want_ack);
    assert_eq!(sent.hop_limit, 5);
    match sent.payload_variant {
        Some(mesh_packet::PayloadVariant::Decoded(d)) => {
            assert_eq!(d.portnum, PortNum::TextMessageApp as i32);
            assert_eq!(d.payload, b"hi remote".to_vec());
        }
        other => panic!("unexpected payload {:?}", other),
    }
    assert_eq!(gateway.messages(None).len(), 2);

    // traceroute: the radio answers with a reply carrying the request id
    let id = gateway.start_traceroute("base", "!aabbccdd").await.unwrap();
    let ev = wait_for(&mut events, |e| matches!(e, GatewayEvent::TracerouteResolved(_))).await;
    let GatewayEvent::TracerouteResolved(tr) = ev else { unreachable!() };
    assert_eq!(tr.id, id);
    assert_eq!(tr.status, TracerouteStatus::Complete);
    let path: Vec<&str> = tr.hops.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(path, vec!["!0000abcd", "!00001111", "!aabbccdd"]);
    assert_eq!(gateway.traceroute(&id).unwrap().status, TracerouteStatus::Complete);

    let summary = gateway.disconnect_device("base").await.unwrap();
    assert_eq!(summary.state, SessionState::Disconnected);
    assert!(matches!(
        gateway.send_text("base", "^all", 0, "anyone?").await,
        Err(GatewayError::NotConnected { .. })
    ));

    tasks.abort();
}

#[tokio::test]
async fn unknown_device_and_bad_arguments_are_rejected() {
    let (port, _radio_rx) = spawn_radio().await;
    let (gateway, tasks) = Gateway::start(&gateway_config(port)).unwrap();

    assert!(matches!(
        gateway.connect_device("attic").await,
        Err(GatewayError::UnknownDevice(_))
    ));
    gateway.connect_device("base").await.unwrap();
    assert!(matches!(
        gateway.send_text("base", "not-a-node", 0, "hi").await,
        Err(GatewayError::InvalidArgument(_))
    ));
    let long = "x".repeat(300);
    assert!(matches!(
        gateway.send_text("base", "^all", 0, &long).await,
        Err(GatewayError::InvalidArgument(_))
    ));
    assert!(matches!(
        gateway.start_traceroute("base", "^all").await,
        Err(GatewayError::InvalidArgument(_))
    ));
    tasks.abort();
}

#[tokio::test]
async fn unacknowledged_command_times_out_and_link_survives() {
    let radio = spawn_radio_with(Script {
        no_acks: true,
        ..Default::default()
    })
    .await;
    let mut config = session_config(radio.port);
    config.command_timeout = Duration::from_millis(300);
    let (tx, _events) = mpsc::unbounded_channel();
    let session = DeviceSession::new(config, tx);
    session.connect().await.unwrap();

    let before = metrics::snapshot().commands_timed_out;
    let started = Instant::now();
    let err = session.send_text(REMOTE, 0, "anyone there?").await.unwrap_err();
    assert!(matches!(err, GatewayError::Timeout { .. }), "got {:?}", err);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(metrics::snapshot().commands_timed_out > before);
    assert_eq!(session.state(), SessionState::Connected);
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn malformed_and_oversize_frames_are_skipped() {
    let radio = spawn_radio_with(Script {
        noisy: true,
        ..Default::default()
    })
    .await;
    let (tx, mut events) = mpsc::unbounded_channel();
    let session = DeviceSession::new(session_config(radio.port), tx);
    let before = metrics::snapshot();
    session.connect().await.unwrap();

    // the packet behind the noise still arrives
    next_session_event(&mut events, |e| {
        matches!(e, SessionEvent::Packet { packet, .. } if packet.id == 78)
    })
    .await;
    let after = metrics::snapshot();
    assert!(after.format_errors > before.format_errors);
    assert!(after.stream_bytes_dropped > before.stream_bytes_dropped);
    assert_eq!(session.state(), SessionState::Connected);
    // the relayed sender is heard, but not through this radio's own neighbourhood
    assert_eq!(session.status().owned_nodes, vec![ME, REMOTE]);
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn lost_link_is_restored_by_automatic_reconnect() {
    let radio = spawn_radio_with(Script {
        drop_first: true,
        ..Default::default()
    })
    .await;
    let mut config = session_config(radio.port);
    config.reconnect_interval = Some(Duration::from_millis(200));
    let (tx, mut events) = mpsc::unbounded_channel();
    let session = DeviceSession::new(config, tx);
    session.connect().await.unwrap();

    let ev = next_session_event(&mut events, |e| is_state(e, SessionState::Error)).await;
    let SessionEvent::StateChanged { error, .. } = ev else { unreachable!() };
    assert!(error.is_some());
    next_session_event(&mut events, |e| is_state(e, SessionState::Connected)).await;
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(radio.accepts.load(Ordering::SeqCst), 2);
    assert_eq!(session.my_node_num(), Some(ME));
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn flapping_radio_gets_one_attempt_per_interval() {
    let radio = spawn_radio_with(Script {
        hang_up: true,
        ..Default::default()
    })
    .await;
    let mut config = session_config(radio.port);
    config.reconnect_interval = Some(Duration::from_millis(200));
    let (tx, _events) = mpsc::unbounded_channel();
    let session = DeviceSession::new(config, tx);

    assert!(session.connect().await.is_err());
    sleep(Duration::from_millis(1300)).await;
    // first attempt plus roughly six retries; a runaway retry loop would be far past this
    let attempts = radio.accepts.load(Ordering::SeqCst);
    assert!((3..=9).contains(&attempts), "{} connection attempts", attempts);

    session.disconnect().await.unwrap();
    sleep(Duration::from_millis(100)).await;
    let settled = radio.accepts.load(Ordering::SeqCst);
    sleep(Duration::from_millis(600)).await;
    assert_eq!(radio.accepts.load(Ordering::SeqCst), settled);
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn reconnect_supersedes_a_stalled_handshake() {
    let radio = spawn_radio_with(Script {
        mute: true,
        ..Default::default()
    })
    .await;
    let (tx, _events) = mpsc::unbounded_channel();
    let session = DeviceSession::new(session_config(radio.port), tx);

    let first = tokio::spawn({
        let session = session.clone();
        async move { session.connect().await }
    });
    timeout(Duration::from_secs(2), async {
        while radio.accepts.load(Ordering::SeqCst) < 1 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(session.state(), SessionState::Connecting);

    let second = tokio::spawn({
        let session = session.clone();
        async move { session.reconnect().await }
    });
    // the stalled attempt gives way well before its 5s handshake timeout
    let res = timeout(Duration::from_secs(1), first).await.unwrap().unwrap();
    assert!(matches!(res, Err(GatewayError::ConnectionLost(_))));
    timeout(Duration::from_secs(1), async {
        while radio.accepts.load(Ordering::SeqCst) < 2 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(session.state(), SessionState::Reconnecting);

    timeout(Duration::from_secs(1), session.disconnect())
        .await
        .unwrap()
        .unwrap();
    let res = timeout(Duration::from_secs(1), second).await.unwrap().unwrap();
    assert!(res.is_err());
    assert_eq!(session.state(), SessionState::Disconnected);
}
