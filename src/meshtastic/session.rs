//! # Device session
//!
//! One long-lived TCP link to a local Meshtastic radio (stream API, port 4403).
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (Disconnected | Error)
//!                               Connected -> Reconnecting -> Connected
//! ```
//!
//! A connection runs two tasks, mirroring the radio's half-duplex framing:
//!
//! - the **reader** reassembles `0x94 0xC3` frames, decodes `FromRadio`, keeps the
//!   handshake caches (own node, channels, config), settles acknowledgements and
//!   forwards everything else to the gateway as [`SessionEvent`]s;
//! - the **writer** drains an unbounded queue of encoded `ToRadio` frames and sends a
//!   heartbeat on an interval.
//!
//! Each connection attempt bumps a generation counter. Tasks belonging to an older
//! generation are ignored if they report late, so reconnecting never mixes state from
//! two links. A new attempt or a disconnect supersedes an attempt still waiting for its
//! handshake; the superseded caller gets `ConnectionLost` at once. At most one automatic
//! reconnect task runs per session. Command operations (`send_text`, `reboot`, ...) are only accepted in
//! `Connected` and wait for the radio to acknowledge the packet (a `QueueStatus` or a
//! routing reply carrying its id) within `command_timeout`.

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use prost::Message;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{timeout, MissedTickBehavior};

use crate::error::{GatewayError, GatewayResult};
use crate::logutil::{escape_log, hex_snippet, preview};
use crate::meshtastic::codec::{decode_from_radio_body, encode_to_radio, routing_error_name, Payload};
use crate::meshtastic::crypto::ChannelKey;
use crate::meshtastic::framer::StreamFramer;
use crate::meshtastic::{format_node_id, random_packet_id};
use crate::metrics;
use crate::protobuf::{
    self as proto, admin_message, config, from_radio, mesh_packet, routing, to_radio, AdminMessage,
    Channel, Data, FromRadio, Heartbeat, LoRaConfig, MeshPacket, NodeInfo, PortNum,
    PositionConfig, RouteDiscovery, ToRadio, User,
};

/// Largest text payload the firmware accepts in one packet.
pub const MAX_TEXT_BYTES: usize = 233;
pub const DEFAULT_HOP_LIMIT: u32 = 3;
pub const TRACEROUTE_HOP_LIMIT: u32 = 7;
pub const REBOOT_DELAY_SECS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub command_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Retry a lost link on this interval; `None` waits for an explicit reconnect.
    pub reconnect_interval: Option<Duration>,
}

impl SessionConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(60),
            reconnect_interval: None,
        }
    }
}

/// What a session reports to the packet pipeline, in the order it happened.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        device: String,
        state: SessionState,
        error: Option<String>,
    },
    MyInfo {
        device: String,
        my_node_num: u32,
    },
    /// Node DB entry streamed during the handshake.
    NodeInfo {
        device: String,
        my_node_num: Option<u32>,
        info: NodeInfo,
    },
    /// Handshake finished; channels and config caches are fresh.
    Configured { device: String },
    Packet {
        device: String,
        my_node_num: Option<u32>,
        packet: MeshPacket,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub index: i32,
    pub role: String,
    pub name: String,
    pub uplink: bool,
    pub downlink: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerInfo {
    pub long_name: String,
    pub short_name: String,
    pub hw_model: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSettings {
    pub gps_mode: i32,
    pub fixed_position: bool,
    pub broadcast_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoraSettings {
    pub region: String,
    pub modem_preset: String,
    pub hop_limit: u32,
    pub tx_power: i32,
    pub tx_enabled: bool,
}

/// Configuration cached from the handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub device: String,
    pub my_node_id: Option<String>,
    pub owner: Option<OwnerInfo>,
    pub position: Option<PositionSettings>,
    pub lora: Option<LoraSettings>,
    pub channels: Vec<ChannelInfo>,
}

/// Fields accepted by [`DeviceSession::set_config`]. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigUpdate {
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<i32>,
    pub remove_position: bool,
}

/// Point-in-time view of a session for the device list.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub state: SessionState,
    pub last_error: Option<String>,
    pub my_node_num: Option<u32>,
    pub owner: Option<User>,
    pub firmware_version: Option<String>,
    pub channels: Vec<ChannelInfo>,
    pub owned_nodes: Vec<u32>,
}

enum WriterMessage {
    Frame(Vec<u8>),
    /// Write a final frame, then shut the socket down.
    Close(Vec<u8>),
}

struct Link {
    tx: mpsc::UnboundedSender<WriterMessage>,
    reader: AbortHandle,
    writer: AbortHandle,
}

struct Inner {
    state: SessionState,
    last_error: Option<String>,
    generation: u64,
    link: Option<Link>,
    handshake: Option<(u32, oneshot::Sender<()>)>,
    my_node_num: Option<u32>,
    owner: Option<User>,
    firmware_version: Option<String>,
    position_config: Option<PositionConfig>,
    lora_config: Option<LoRaConfig>,
    channels: BTreeMap<i32, Channel>,
    owned_nodes: HashSet<u32>,
    reconnect_task: Option<AbortHandle>,
}

struct Shared {
    config: SessionConfig,
    inner: Mutex<Inner>,
    acks: Mutex<HashMap<u32, oneshot::Sender<GatewayResult<()>>>>,
    sink: mpsc::UnboundedSender<SessionEvent>,
}

/// Handle to one device session. Clones share the same connection.
#[derive(Clone)]
pub struct DeviceSession {
    shared: Arc<Shared>,
}

impl DeviceSession {
    pub fn new(config: SessionConfig, sink: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(Inner {
                    state: SessionState::Disconnected,
                    last_error: None,
                    generation: 0,
                    link: None,
                    handshake: None,
                    my_node_num: None,
                    owner: None,
                    firmware_version: None,
                    position_config: None,
                    lora_config: None,
                    channels: BTreeMap::new(),
                    owned_nodes: HashSet::new(),
                    reconnect_task: None,
                }),
                acks: Mutex::new(HashMap::new()),
                sink,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    pub fn my_node_num(&self) -> Option<u32> {
        self.shared.inner.lock().my_node_num
    }

    pub fn status(&self) -> SessionStatus {
        let inner = self.shared.inner.lock();
        let mut owned: Vec<u32> = inner.owned_nodes.iter().copied().collect();
        owned.sort_unstable();
        SessionStatus {
            name: self.shared.config.name.clone(),
            host: self.shared.config.host.clone(),
            port: self.shared.config.port,
            state: inner.state,
            last_error: inner.last_error.clone(),
            my_node_num: inner.my_node_num,
            owner: inner.owner.clone(),
            firmware_version: inner.firmware_version.clone(),
            channels: channel_infos(&inner.channels),
            owned_nodes: owned,
        }
    }

    /// Keys of the device's enabled channels, for the shared key ring.
    pub fn channel_keys(&self) -> Vec<ChannelKey> {
        let inner = self.shared.inner.lock();
        let preset = inner.lora_config.as_ref().map_or(0, |l| l.modem_preset);
        inner
            .channels
            .values()
            .filter(|c| c.role != 0)
            .filter_map(|c| {
                let settings = c.settings.as_ref()?;
                let name = if settings.name.is_empty() {
                    preset_channel_name(preset).to_string()
                } else {
                    settings.name.clone()
                };
                match ChannelKey::from_psk(name, &settings.psk) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!("[{}] channel {} has an unusable PSK: {}", self.name(), c.index, e);
                        None
                    }
                }
            })
            .collect()
    }

    /// Open the link and run the configuration handshake.
    pub async fn connect(&self) -> GatewayResult<()> {
        self.attempt(SessionState::Connecting).await
    }

    /// Drop the current link (if any) and connect again from scratch.
    pub async fn reconnect(&self) -> GatewayResult<()> {
        self.attempt(SessionState::Reconnecting).await
    }

    /// Close the link and stop automatic reconnects.
    pub async fn disconnect(&self) -> GatewayResult<()> {
        let (link, retry) = {
            let mut inner = self.shared.inner.lock();
            inner.generation += 1;
            inner.handshake = None;
            inner.state = SessionState::Disconnected;
            inner.last_error = None;
            (inner.link.take(), inner.reconnect_task.take())
        };
        if let Some(task) = retry {
            task.abort();
        }
        if let Some(link) = link {
            let bye = ToRadio {
                payload_variant: Some(to_radio::PayloadVariant::Disconnect(true)),
            };
            match encode_to_radio(&bye) {
                Ok(frame) => {
                    if link.tx.send(WriterMessage::Close(frame)).is_err() {
                        link.writer.abort();
                    }
                }
                Err(_) => link.writer.abort(),
            }
            link.reader.abort();
            info!("[{}] Disconnected", self.name());
        }
        self.shared
            .fail_pending_acks(|| GatewayError::not_connected(self.name()));
        self.shared.emit_state();
        Ok(())
    }

    /// One connection attempt. A failure that leaves the session in `Error` arms the
    /// retry loop when one is configured.
    async fn attempt(&self, via: SessionState) -> GatewayResult<()> {
        let result = self.open_and_configure(via).await;
        if result.is_err() {
            self.shared.schedule_reconnect();
        }
        result
    }

    async fn open_and_configure(&self, via: SessionState) -> GatewayResult<()> {
        let shared = &self.shared;
        let generation = shared.begin_attempt(via);
        shared.emit_state();

        let addr = format!("{}:{}", shared.config.host, shared.config.port);
        info!("[{}] Connecting to {}", shared.config.name, addr);
        let stream = match timeout(shared.config.connect_timeout, TcpStream::connect(&addr)).await {
            Err(_) => {
                return Err(shared.fail(generation, GatewayError::timeout(format!("TCP connect to {}", addr))))
            }
            Ok(Err(e)) => {
                return Err(shared.fail(
                    generation,
                    GatewayError::ConnectionLost(format!("connect to {} failed: {}", addr, e)),
                ))
            }
            Ok(Ok(s)) => s,
        };
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (tx, rx) = mpsc::unbounded_channel();
        let (hs_tx, hs_rx) = oneshot::channel();
        let nonce = random_packet_id();
        let writer = tokio::spawn(writer_loop(Arc::clone(shared), generation, write_half, rx));
        let reader = tokio::spawn(reader_loop(Arc::clone(shared), generation, read_half));
        {
            let mut inner = shared.inner.lock();
            // superseded while connecting, or the reader already saw the socket close
            if inner.generation != generation || inner.state == SessionState::Error {
                writer.abort();
                reader.abort();
                return Err(shared.attempt_lost(&inner, generation));
            }
            inner.handshake = Some((nonce, hs_tx));
            inner.link = Some(Link {
                tx,
                reader: reader.abort_handle(),
                writer: writer.abort_handle(),
            });
        }

        debug!(
            "[{}] Requesting config (want_config_id=0x{:08x})",
            shared.config.name, nonce
        );
        let want = ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::WantConfigId(nonce)),
        };
        shared.enqueue(&want)?;

        match timeout(shared.config.handshake_timeout, hs_rx).await {
            Ok(Ok(())) => {
                {
                    let mut inner = shared.inner.lock();
                    // the link may have dropped right after config_complete_id
                    if inner.generation != generation || inner.link.is_none() {
                        return Err(shared.attempt_lost(&inner, generation));
                    }
                    inner.state = SessionState::Connected;
                    inner.last_error = None;
                }
                let status = self.status();
                info!(
                    "[{}] Connected: node {} firmware {} ({} nodes, {} channels)",
                    shared.config.name,
                    status.my_node_num.map(format_node_id).unwrap_or_else(|| "?".into()),
                    status.firmware_version.as_deref().unwrap_or("?"),
                    status.owned_nodes.len(),
                    status.channels.len()
                );
                shared.emit_state();
                let _ = shared.sink.send(SessionEvent::Configured {
                    device: shared.config.name.clone(),
                });
                Ok(())
            }
            Ok(Err(_)) => {
                let err = shared.attempt_lost(&shared.inner.lock(), generation);
                Err(err)
            }
            Err(_) => Err(shared.fail(generation, GatewayError::timeout("configuration handshake"))),
        }
    }

    fn require_connected(&self) -> GatewayResult<u32> {
        let inner = self.shared.inner.lock();
        if inner.state != SessionState::Connected {
            return Err(GatewayError::not_connected(self.name()));
        }
        inner
            .my_node_num
            .ok_or_else(|| GatewayError::not_connected(self.name()))
    }

    fn hop_limit(&self) -> u32 {
        self.shared
            .inner
            .lock()
            .lora_config
            .as_ref()
            .map(|l| l.hop_limit)
            .filter(|h| *h > 0)
            .unwrap_or(DEFAULT_HOP_LIMIT)
    }

    /// Send a text message; resolves with the packet id once the radio accepted it.
    pub async fn send_text(&self, destination: u32, channel: u32, text: &str) -> GatewayResult<u32> {
        let me = self.require_connected()?;
        if text.is_empty() {
            return Err(GatewayError::InvalidArgument("message text is empty".into()));
        }
        if text.len() > MAX_TEXT_BYTES {
            return Err(GatewayError::InvalidArgument(format!(
                "message is {} bytes; the limit is {}",
                text.len(),
                MAX_TEXT_BYTES
            )));
        }
        let packet = MeshPacket {
            from: me,
            to: destination,
            channel,
            id: random_packet_id(),
            hop_limit: self.hop_limit(),
            want_ack: true,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(
                Payload::Text(text.to_string()).into_data(),
            )),
            ..Default::default()
        };
        info!(
            "[{}] Sending text to {} on channel {}: {}",
            self.name(),
            format_node_id(destination),
            channel,
            preview(text, 80)
        );
        self.send_packet(packet, "text message acknowledgement").await
    }

    /// Start a traceroute to `destination`; returns the outbound packet id.
    pub async fn request_traceroute(&self, destination: u32) -> GatewayResult<u32> {
        let id = random_packet_id();
        self.request_traceroute_with_id(destination, id).await?;
        Ok(id)
    }

    pub async fn request_traceroute_with_id(&self, destination: u32, packet_id: u32) -> GatewayResult<()> {
        let me = self.require_connected()?;
        let data = Data {
            portnum: PortNum::TracerouteApp as i32,
            payload: RouteDiscovery::default().encode_to_vec(),
            want_response: true,
            ..Default::default()
        };
        let packet = MeshPacket {
            from: me,
            to: destination,
            id: packet_id,
            hop_limit: TRACEROUTE_HOP_LIMIT,
            want_ack: true,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(data)),
            ..Default::default()
        };
        info!(
            "[{}] Traceroute request to {} (id 0x{:08x})",
            self.name(),
            format_node_id(destination),
            packet_id
        );
        self.send_packet(packet, "traceroute acknowledgement").await?;
        Ok(())
    }

    pub fn get_config(&self) -> GatewayResult<DeviceConfig> {
        let inner = self.shared.inner.lock();
        if inner.state != SessionState::Connected {
            return Err(GatewayError::not_connected(self.name()));
        }
        Ok(DeviceConfig {
            device: self.shared.config.name.clone(),
            my_node_id: inner.my_node_num.map(format_node_id),
            owner: inner.owner.as_ref().map(|u| OwnerInfo {
                long_name: u.long_name.clone(),
                short_name: u.short_name.clone(),
                hw_model: proto::hardware_model_name(u.hw_model),
                role: proto::role_name(u.role),
            }),
            position: inner.position_config.as_ref().map(|p| PositionSettings {
                gps_mode: p.gps_mode,
                fixed_position: p.fixed_position,
                broadcast_secs: p.position_broadcast_secs,
            }),
            lora: inner.lora_config.as_ref().map(|l| LoraSettings {
                region: proto::region_name(l.region),
                modem_preset: proto::modem_preset_name(l.modem_preset),
                hop_limit: l.hop_limit,
                tx_power: l.tx_power,
                tx_enabled: l.tx_enabled,
            }),
            channels: channel_infos(&inner.channels),
        })
    }

    /// Apply owner / fixed-position changes. Returns a description of each applied change.
    pub async fn set_config(&self, update: &ConfigUpdate) -> GatewayResult<Vec<String>> {
        self.require_connected()?;
        let mut applied = Vec::new();

        if update.long_name.is_some() || update.short_name.is_some() {
            let mut owner = self.shared.inner.lock().owner.clone().unwrap_or_default();
            if let Some(long) = &update.long_name {
                let long = long.trim();
                if long.is_empty() || long.len() > 39 {
                    return Err(GatewayError::InvalidArgument("long name must be 1-39 bytes".into()));
                }
                owner.long_name = long.to_string();
            }
            if let Some(short) = &update.short_name {
                let short = short.trim();
                if short.is_empty() || short.chars().count() > 4 {
                    return Err(GatewayError::InvalidArgument("short name must be 1-4 characters".into()));
                }
                owner.short_name = short.to_string();
            }
            self.send_admin(admin_message::PayloadVariant::SetOwner(owner.clone()), "set owner")
                .await?;
            applied.push(format!(
                "owner set to '{}' ({})",
                escape_log(&owner.long_name),
                escape_log(&owner.short_name)
            ));
            self.shared.inner.lock().owner = Some(owner);
        }

        if update.remove_position {
            self.send_admin(
                admin_message::PayloadVariant::RemoveFixedPosition(true),
                "remove fixed position",
            )
            .await?;
            applied.push("fixed position removed".to_string());
            if let Some(p) = self.shared.inner.lock().position_config.as_mut() {
                p.fixed_position = false;
            }
        } else if let (Some(lat), Some(lon)) = (update.latitude, update.longitude) {
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return Err(GatewayError::InvalidArgument("latitude/longitude out of range".into()));
            }
            let position = crate::mesh::GeoPosition {
                latitude: lat,
                longitude: lon,
                altitude: update.altitude,
            };
            self.send_admin(
                admin_message::PayloadVariant::SetFixedPosition(position.to_proto()),
                "set fixed position",
            )
            .await?;
            applied.push(format!("fixed position set to {:.5}, {:.5}", lat, lon));
            if let Some(p) = self.shared.inner.lock().position_config.as_mut() {
                p.fixed_position = true;
            }
        } else if update.latitude.is_some() || update.longitude.is_some() {
            return Err(GatewayError::InvalidArgument(
                "latitude and longitude must be given together".into(),
            ));
        }

        Ok(applied)
    }

    pub async fn reboot(&self) -> GatewayResult<()> {
        self.require_connected()?;
        warn!("[{}] Rebooting device in {}s", self.name(), REBOOT_DELAY_SECS);
        self.send_admin(
            admin_message::PayloadVariant::RebootSeconds(REBOOT_DELAY_SECS),
            "reboot",
        )
        .await
    }

    pub fn get_channel_mqtt(&self) -> GatewayResult<Vec<ChannelInfo>> {
        let inner = self.shared.inner.lock();
        if inner.state != SessionState::Connected {
            return Err(GatewayError::not_connected(self.name()));
        }
        Ok(channel_infos(&inner.channels))
    }

    pub async fn set_channel_mqtt(&self, index: i32, uplink: bool, downlink: bool) -> GatewayResult<ChannelInfo> {
        self.require_connected()?;
        let mut channel = self
            .shared
            .inner
            .lock()
            .channels
            .get(&index)
            .cloned()
            .ok_or_else(|| GatewayError::InvalidArgument(format!("no channel with index {}", index)))?;
        if channel.role == 0 {
            return Err(GatewayError::InvalidArgument(format!("channel {} is disabled", index)));
        }
        let settings = channel.settings.get_or_insert_with(Default::default);
        settings.uplink_enabled = uplink;
        settings.downlink_enabled = downlink;
        self.send_admin(
            admin_message::PayloadVariant::SetChannel(channel.clone()),
            "set channel",
        )
        .await?;
        info!(
            "[{}] Channel {} MQTT uplink={} downlink={}",
            self.name(),
            index,
            uplink,
            downlink
        );
        let info = channel_info(&channel);
        self.shared.inner.lock().channels.insert(index, channel);
        Ok(info)
    }

    async fn send_admin(&self, variant: admin_message::PayloadVariant, what: &str) -> GatewayResult<()> {
        let me = self.require_connected()?;
        let admin = AdminMessage {
            payload_variant: Some(variant),
            session_passkey: Vec::new(),
        };
        let packet = MeshPacket {
            from: me,
            to: me,
            id: random_packet_id(),
            hop_limit: 0,
            want_ack: true,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(Payload::Admin(admin).into_data())),
            ..Default::default()
        };
        self.send_packet(packet, what).await?;
        Ok(())
    }

    /// Queue a packet and wait for the radio to acknowledge it.
    async fn send_packet(&self, packet: MeshPacket, what: &str) -> GatewayResult<u32> {
        let id = packet.id;
        let msg = ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::Packet(packet)),
        };
        let (tx, rx) = oneshot::channel();
        self.shared.acks.lock().insert(id, tx);
        if let Err(e) = self.shared.enqueue(&msg) {
            self.shared.acks.lock().remove(&id);
            return Err(e);
        }
        metrics::inc_commands_sent();
        let started = Instant::now();

        match timeout(self.shared.config.command_timeout, rx).await {
            Ok(Ok(Ok(()))) => {
                metrics::inc_commands_acked();
                metrics::observe_ack_latency(started);
                debug!("[{}] {} for 0x{:08x} received", self.name(), what, id);
                Ok(id)
            }
            Ok(Ok(Err(e))) => {
                metrics::inc_commands_failed();
                warn!("[{}] packet 0x{:08x} failed: {}", self.name(), id, e);
                Err(e)
            }
            Ok(Err(_)) => {
                metrics::inc_commands_failed();
                Err(GatewayError::ConnectionLost(format!(
                    "link to {} closed before {}",
                    self.name(),
                    what
                )))
            }
            Err(_) => {
                self.shared.acks.lock().remove(&id);
                metrics::inc_commands_timed_out();
                warn!("[{}] no {} for 0x{:08x}", self.name(), what, id);
                Err(GatewayError::timeout(what))
            }
        }
    }
}

impl Shared {
    fn name(&self) -> &str {
        &self.config.name
    }

    /// Tear down any previous link and start a new generation.
    fn begin_attempt(&self, via: SessionState) -> u64 {
        let (generation, link) = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.state = via;
            inner.handshake = None;
            inner.channels.clear();
            inner.position_config = None;
            inner.lora_config = None;
            inner.my_node_num = None;
            inner.owner = None;
            inner.firmware_version = None;
            inner.owned_nodes.clear();
            (inner.generation, inner.link.take())
        };
        if let Some(link) = link {
            link.reader.abort();
            link.writer.abort();
        }
        self.fail_pending_acks(|| GatewayError::ConnectionLost("link replaced".into()));
        generation
    }

    /// Why an attempt that lost its handshake waiter did not complete.
    fn attempt_lost(&self, inner: &Inner, generation: u64) -> GatewayError {
        if inner.generation != generation {
            return GatewayError::ConnectionLost("connection attempt superseded".into());
        }
        GatewayError::ConnectionLost(
            inner
                .last_error
                .clone()
                .unwrap_or_else(|| "link closed during handshake".into()),
        )
    }

    /// Record `err` as the session error if `generation` is still current.
    fn fail(&self, generation: u64, err: GatewayError) -> GatewayError {
        let link = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return err;
            }
            inner.state = SessionState::Error;
            inner.last_error = Some(err.to_string());
            inner.handshake = None;
            inner.link.take()
        };
        if let Some(link) = link {
            link.reader.abort();
            link.writer.abort();
        }
        error!("[{}] {}", self.name(), err);
        self.fail_pending_acks(|| GatewayError::ConnectionLost(err.to_string()));
        self.emit_state();
        err
    }

    fn emit_state(&self) {
        let (state, error) = {
            let inner = self.inner.lock();
            (inner.state, inner.last_error.clone())
        };
        let _ = self.sink.send(SessionEvent::StateChanged {
            device: self.config.name.clone(),
            state,
            error,
        });
    }

    fn fail_pending_acks(&self, err: impl Fn() -> GatewayError) {
        let pending: Vec<_> = self.acks.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(err()));
        }
    }

    fn settle(&self, id: u32, result: GatewayResult<()>) {
        if id == 0 {
            return;
        }
        if let Some(tx) = self.acks.lock().remove(&id) {
            let _ = tx.send(result);
        }
    }

    fn enqueue(&self, msg: &ToRadio) -> GatewayResult<()> {
        let frame = encode_to_radio(msg)?;
        let inner = self.inner.lock();
        let link = inner
            .link
            .as_ref()
            .ok_or_else(|| GatewayError::not_connected(self.name()))?;
        link.tx
            .send(WriterMessage::Frame(frame))
            .map_err(|_| GatewayError::not_connected(self.name()))
    }

    /// Called by the reader/writer tasks when the socket fails mid-session.
    fn link_failed(self: &Arc<Self>, generation: u64, reason: String) {
        let current = self.inner.lock().generation == generation;
        if !current {
            return;
        }
        self.fail(generation, GatewayError::ConnectionLost(reason));
        self.schedule_reconnect();
    }

    /// Start the retry loop unless one is already running.
    fn schedule_reconnect(self: &Arc<Self>) {
        let Some(interval) = self.config.reconnect_interval else {
            return;
        };
        let mut inner = self.inner.lock();
        if inner.reconnect_task.is_some() || inner.state != SessionState::Error {
            return;
        }
        info!("[{}] Retrying every {:?}", self.name(), interval);
        let task = tokio::spawn(auto_reconnect(Arc::clone(self), interval));
        inner.reconnect_task = Some(task.abort_handle());
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().generation == generation
    }

    fn handle_from_radio(&self, generation: u64, msg: FromRadio) {
        if !self.is_current(generation) {
            return;
        }
        let Some(variant) = msg.payload_variant else {
            trace!("[{}] FromRadio without payload (id={})", self.name(), msg.id);
            return;
        };
        match variant {
            from_radio::PayloadVariant::MyInfo(info) => {
                debug!("[{}] my node is {}", self.name(), format_node_id(info.my_node_num));
                self.inner.lock().my_node_num = Some(info.my_node_num);
                let _ = self.sink.send(SessionEvent::MyInfo {
                    device: self.config.name.clone(),
                    my_node_num: info.my_node_num,
                });
            }
            from_radio::PayloadVariant::NodeInfo(info) => {
                let my_node_num = {
                    let mut inner = self.inner.lock();
                    inner.owned_nodes.insert(info.num);
                    if Some(info.num) == inner.my_node_num {
                        if let Some(user) = &info.user {
                            inner.owner = Some(user.clone());
                        }
                    }
                    inner.my_node_num
                };
                let _ = self.sink.send(SessionEvent::NodeInfo {
                    device: self.config.name.clone(),
                    my_node_num,
                    info,
                });
            }
            from_radio::PayloadVariant::Config(cfg) => self.cache_config(cfg),
            from_radio::PayloadVariant::Channel(ch) => {
                self.inner.lock().channels.insert(ch.index, ch);
            }
            from_radio::PayloadVariant::Metadata(meta) => {
                self.inner.lock().firmware_version = Some(meta.firmware_version);
            }
            from_radio::PayloadVariant::ConfigCompleteId(id) => {
                let waiter = {
                    let mut inner = self.inner.lock();
                    match inner.handshake.take() {
                        Some((nonce, tx)) if nonce == id => Some(tx),
                        other => {
                            inner.handshake = other;
                            None
                        }
                    }
                };
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(());
                    }
                    None => debug!("[{}] unexpected config_complete_id 0x{:08x}", self.name(), id),
                }
            }
            from_radio::PayloadVariant::QueueStatus(qs) => {
                trace!(
                    "[{}] queue status res={} free={}/{} id=0x{:08x}",
                    self.name(),
                    qs.res,
                    qs.free,
                    qs.maxlen,
                    qs.mesh_packet_id
                );
                let result = if qs.res == 0 {
                    Ok(())
                } else {
                    Err(GatewayError::Rejected(format!("queue result {}", qs.res)))
                };
                self.settle(qs.mesh_packet_id, result);
            }
            from_radio::PayloadVariant::Packet(packet) => self.handle_packet(packet),
            from_radio::PayloadVariant::LogRecord(rec) => {
                debug!("[{}] device log: {}", self.name(), escape_log(&rec.message));
            }
            from_radio::PayloadVariant::Rebooted(_) => {
                warn!("[{}] device reports a reboot", self.name());
            }
        }
    }

    fn cache_config(&self, cfg: proto::Config) {
        let mut inner = self.inner.lock();
        match cfg.payload_variant {
            Some(config::PayloadVariant::Position(p)) => inner.position_config = Some(p),
            Some(config::PayloadVariant::Lora(l)) => inner.lora_config = Some(l),
            None => {}
        }
    }

    fn handle_packet(&self, packet: MeshPacket) {
        let my_node_num = {
            let mut inner = self.inner.lock();
            let heard_directly = packet.hop_start > 0 && packet.hop_start == packet.hop_limit;
            if heard_directly && Some(packet.from) != inner.my_node_num && packet.from != 0 {
                inner.owned_nodes.insert(packet.from);
            }
            inner.my_node_num
        };

        if let Some(mesh_packet::PayloadVariant::Decoded(data)) = &packet.payload_variant {
            if data.portnum == PortNum::RoutingApp as i32 {
                if let Ok(r) = proto::Routing::decode(data.payload.as_slice()) {
                    if let Some(routing::Variant::ErrorReason(code)) = r.variant {
                        let result = if code == routing::Error::None as i32 {
                            Ok(())
                        } else {
                            Err(GatewayError::Rejected(routing_error_name(code)))
                        };
                        self.settle(data.request_id, result);
                    }
                }
            } else if data.portnum == PortNum::AdminApp as i32 && Some(packet.from) == my_node_num {
                if let Ok(admin) = AdminMessage::decode(data.payload.as_slice()) {
                    self.cache_admin_response(admin);
                }
            }
        }

        let _ = self.sink.send(SessionEvent::Packet {
            device: self.config.name.clone(),
            my_node_num,
            packet,
        });
    }

    fn cache_admin_response(&self, admin: AdminMessage) {
        let mut inner = self.inner.lock();
        match admin.payload_variant {
            Some(admin_message::PayloadVariant::GetOwnerResponse(user)) => inner.owner = Some(user),
            Some(admin_message::PayloadVariant::GetChannelResponse(ch)) => {
                inner.channels.insert(ch.index, ch);
            }
            Some(admin_message::PayloadVariant::GetConfigResponse(cfg)) => match cfg.payload_variant {
                Some(config::PayloadVariant::Position(p)) => inner.position_config = Some(p),
                Some(config::PayloadVariant::Lora(l)) => inner.lora_config = Some(l),
                None => {}
            },
            Some(admin_message::PayloadVariant::GetDeviceMetadataResponse(meta)) => {
                inner.firmware_version = Some(meta.firmware_version)
            }
            _ => {}
        }
    }
}

async fn reader_loop(shared: Arc<Shared>, generation: u64, mut half: OwnedReadHalf) {
    let mut framer = StreamFramer::new();
    let mut dropped_seen = 0u64;
    let mut buf = [0u8; 1024];
    loop {
        match half.read(&mut buf).await {
            Ok(0) => {
                shared.link_failed(generation, "device closed the connection".into());
                break;
            }
            Ok(n) => {
                trace!("[{}] RAW {} bytes: {}", shared.name(), n, hex_snippet(&buf[..n], 64));
                framer.push(&buf[..n]);
                while let Some(body) = framer.next_frame() {
                    note_dropped(&shared, &framer, &mut dropped_seen);
                    match decode_from_radio_body(&body) {
                        Ok(msg) => {
                            metrics::inc_frames_decoded();
                            shared.handle_from_radio(generation, msg);
                        }
                        Err(e) => {
                            metrics::inc_format_errors();
                            debug!("[{}] dropping malformed frame: {}", shared.name(), e);
                        }
                    }
                }
                note_dropped(&shared, &framer, &mut dropped_seen);
            }
            Err(e) => {
                shared.link_failed(generation, format!("read failed: {}", e));
                break;
            }
        }
    }
}

fn note_dropped(shared: &Shared, framer: &StreamFramer, seen: &mut u64) {
    let dropped = framer.dropped();
    if dropped > *seen {
        metrics::add_stream_bytes_dropped(dropped - *seen);
        debug!("[{}] skipped {} bytes of noise", shared.name(), dropped - *seen);
        *seen = dropped;
    }
}

async fn writer_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriterMessage>,
) {
    let period = shared.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(WriterMessage::Frame(frame)) => {
                        if let Err(e) = half.write_all(&frame).await {
                            shared.link_failed(generation, format!("write failed: {}", e));
                            break;
                        }
                    }
                    Some(WriterMessage::Close(frame)) => {
                        let _ = half.write_all(&frame).await;
                        let _ = half.shutdown().await;
                        break;
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                let hb = ToRadio {
                    payload_variant: Some(to_radio::PayloadVariant::Heartbeat(Heartbeat { nonce: rand::random() })),
                };
                let Ok(frame) = encode_to_radio(&hb) else { continue };
                trace!("[{}] heartbeat", shared.name());
                if let Err(e) = half.write_all(&frame).await {
                    shared.link_failed(generation, format!("heartbeat write failed: {}", e));
                    break;
                }
            }
        }
    }
}

/// Retry loop owned by `Inner::reconnect_task`. Its own failed attempts land in
/// `link_failed`, which sees the task registered and does not start another.
async fn auto_reconnect(shared: Arc<Shared>, interval: Duration) {
    let session = DeviceSession { shared };
    loop {
        tokio::time::sleep(interval).await;
        {
            let mut inner = session.shared.inner.lock();
            match inner.state {
                SessionState::Error => {}
                SessionState::Connected | SessionState::Disconnected => {
                    inner.reconnect_task = None;
                    return;
                }
                // someone else's attempt is in flight
                SessionState::Connecting | SessionState::Reconnecting => continue,
            }
        }
        info!("[{}] Attempting automatic reconnect", session.name());
        if let Err(e) = session.attempt(SessionState::Reconnecting).await {
            debug!("[{}] automatic reconnect failed: {}", session.name(), e);
        }
    }
}

fn channel_info(c: &Channel) -> ChannelInfo {
    let settings = c.settings.clone().unwrap_or_default();
    ChannelInfo {
        index: c.index,
        role: proto::channel_role_name(c.role).to_string(),
        name: settings.name,
        uplink: settings.uplink_enabled,
        downlink: settings.downlink_enabled,
    }
}

fn channel_infos(channels: &BTreeMap<i32, Channel>) -> Vec<ChannelInfo> {
    channels
        .values()
        .filter(|c| c.role != 0)
        .map(channel_info)
        .collect()
}

/// Display name a primary channel without a name gets from its modem preset.
pub fn preset_channel_name(preset: i32) -> &'static str {
    match preset {
        1 => "LongSlow",
        2 => "VeryLongSlow",
        3 => "MediumSlow",
        4 => "MediumFast",
        5 => "ShortSlow",
        6 => "ShortFast",
        7 => "LongModerate",
        _ => "LongFast",
    }
}
