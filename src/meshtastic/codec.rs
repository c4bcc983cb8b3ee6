//! Frame and payload codec.
//!
//! Stateless helpers turning stream frames into `FromRadio`/`ToRadio` messages and
//! `Data` payloads into typed [`Payload`] values. Every decode either yields a complete
//! structure or a [`FormatError`]; nothing is truncated or partially accepted.
//!
//! Payload decoding doubles as the integrity check for decrypted packets: Meshtastic
//! channel encryption carries no authentication tag, so a candidate plaintext is only
//! accepted when it parses as `Data` with a known port and a payload that decodes under
//! that port's schema.

use prost::Message;
use serde_json::{json, Value};

use crate::error::FormatError;
use crate::meshtastic::format_node_id;
use crate::meshtastic::framer::{decode_frame, encode_frame};
use crate::protobuf::{
    self as proto, mesh_packet, AdminMessage, Data, FromRadio, MeshPacket, NeighborInfo, PortNum,
    Position, RouteDiscovery, Routing, Telemetry, ToRadio, User,
};

/// Typed application payload of a decoded packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Position(Position),
    User(User),
    Telemetry(Telemetry),
    Traceroute(RouteDiscovery),
    NeighborInfo(NeighborInfo),
    Routing(Routing),
    Admin(AdminMessage),
    /// A known port whose payload we carry without interpreting.
    Other { port: PortNum, bytes: Vec<u8> },
}

impl Payload {
    pub fn port(&self) -> PortNum {
        match self {
            Payload::Text(_) => PortNum::TextMessageApp,
            Payload::Position(_) => PortNum::PositionApp,
            Payload::User(_) => PortNum::NodeinfoApp,
            Payload::Telemetry(_) => PortNum::TelemetryApp,
            Payload::Traceroute(_) => PortNum::TracerouteApp,
            Payload::NeighborInfo(_) => PortNum::NeighborinfoApp,
            Payload::Routing(_) => PortNum::RoutingApp,
            Payload::Admin(_) => PortNum::AdminApp,
            Payload::Other { port, .. } => *port,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Payload::Text(s) => s.as_bytes().to_vec(),
            Payload::Position(m) => m.encode_to_vec(),
            Payload::User(m) => m.encode_to_vec(),
            Payload::Telemetry(m) => m.encode_to_vec(),
            Payload::Traceroute(m) => m.encode_to_vec(),
            Payload::NeighborInfo(m) => m.encode_to_vec(),
            Payload::Routing(m) => m.encode_to_vec(),
            Payload::Admin(m) => m.encode_to_vec(),
            Payload::Other { bytes, .. } => bytes.clone(),
        }
    }

    /// Wrap into a `Data` message with the matching port number.
    pub fn into_data(self) -> Data {
        Data {
            portnum: self.port() as i32,
            payload: self.encode(),
            ..Default::default()
        }
    }

    /// JSON rendering for the boundary (feed records, events).
    pub fn to_json(&self) -> Value {
        match self {
            Payload::Text(s) => json!({ "text": s }),
            Payload::Position(p) => position_json(p),
            Payload::User(u) => json!({
                "id": u.id,
                "longName": u.long_name,
                "shortName": u.short_name,
                "hwModel": proto::hardware_model_name(u.hw_model),
                "role": proto::role_name(u.role),
            }),
            Payload::Telemetry(t) => telemetry_json(t),
            Payload::Traceroute(r) => json!({
                "route": r.route.iter().map(|n| format_node_id(*n)).collect::<Vec<_>>(),
                "snrTowards": r.snr_towards.iter().map(|s| *s as f32 / 4.0).collect::<Vec<_>>(),
                "routeBack": r.route_back.iter().map(|n| format_node_id(*n)).collect::<Vec<_>>(),
                "snrBack": r.snr_back.iter().map(|s| *s as f32 / 4.0).collect::<Vec<_>>(),
            }),
            Payload::NeighborInfo(n) => json!({
                "nodeId": format_node_id(n.node_id),
                "neighbors": n.neighbors.iter().map(|nb| json!({
                    "nodeId": format_node_id(nb.node_id),
                    "snr": nb.snr,
                })).collect::<Vec<_>>(),
            }),
            Payload::Routing(r) => match &r.variant {
                Some(proto::routing::Variant::ErrorReason(e)) => json!({ "errorReason": routing_error_name(*e) }),
                Some(proto::routing::Variant::RouteRequest(_)) => json!({ "routeRequest": true }),
                Some(proto::routing::Variant::RouteReply(_)) => json!({ "routeReply": true }),
                None => json!({}),
            },
            Payload::Admin(_) => json!({ "admin": true }),
            Payload::Other { bytes, .. } => json!({ "bytes": hex::encode(bytes) }),
        }
    }
}

fn position_json(p: &Position) -> Value {
    json!({
        "latitude": p.latitude_i.map(|v| v as f64 * 1e-7),
        "longitude": p.longitude_i.map(|v| v as f64 * 1e-7),
        "altitude": p.altitude,
        "time": p.time,
    })
}

fn telemetry_json(t: &Telemetry) -> Value {
    match &t.variant {
        Some(proto::telemetry::Variant::DeviceMetrics(m)) => json!({
            "batteryLevel": m.battery_level,
            "voltage": m.voltage,
            "channelUtilization": m.channel_utilization,
            "airUtilTx": m.air_util_tx,
            "uptimeSeconds": m.uptime_seconds,
        }),
        Some(proto::telemetry::Variant::EnvironmentMetrics(m)) => json!({
            "temperature": m.temperature,
            "relativeHumidity": m.relative_humidity,
            "barometricPressure": m.barometric_pressure,
        }),
        None => json!({}),
    }
}

pub fn routing_error_name(code: i32) -> String {
    proto::routing::Error::try_from(code)
        .map(|e| format!("{:?}", e))
        .unwrap_or_else(|_| format!("ERROR_{}", code))
}

/// Decode a payload under the schema of its port.
pub fn decode_payload(portnum: i32, bytes: &[u8]) -> Result<Payload, FormatError> {
    let port = PortNum::try_from(portnum).map_err(|_| FormatError::InvalidPort(portnum))?;
    let payload = match port {
        PortNum::UnknownApp => return Err(FormatError::InvalidPort(portnum)),
        PortNum::TextMessageApp => Payload::Text(
            String::from_utf8(bytes.to_vec()).map_err(|_| FormatError::InvalidUtf8)?,
        ),
        PortNum::PositionApp => Payload::Position(Position::decode(bytes)?),
        PortNum::NodeinfoApp => Payload::User(User::decode(bytes)?),
        PortNum::TelemetryApp => Payload::Telemetry(Telemetry::decode(bytes)?),
        PortNum::TracerouteApp => Payload::Traceroute(RouteDiscovery::decode(bytes)?),
        PortNum::NeighborinfoApp => Payload::NeighborInfo(NeighborInfo::decode(bytes)?),
        PortNum::RoutingApp => Payload::Routing(Routing::decode(bytes)?),
        PortNum::AdminApp => Payload::Admin(AdminMessage::decode(bytes)?),
        other => Payload::Other {
            port: other,
            bytes: bytes.to_vec(),
        },
    };
    Ok(payload)
}

/// Decode and validate a plaintext `Data` message, e.g. a decryption candidate.
pub fn decode_data(bytes: &[u8]) -> Result<(Data, Payload), FormatError> {
    if bytes.is_empty() {
        return Err(FormatError::Empty);
    }
    let data = Data::decode(bytes)?;
    let payload = decode_payload(data.portnum, &data.payload)?;
    Ok((data, payload))
}

/// Decode one framed `FromRadio` (header included).
pub fn decode_from_radio(frame: &[u8]) -> Result<FromRadio, FormatError> {
    let body = decode_frame(frame)?;
    Ok(FromRadio::decode(body)?)
}

/// Decode the body of a frame already split off by the stream framer.
pub fn decode_from_radio_body(body: &[u8]) -> Result<FromRadio, FormatError> {
    if body.is_empty() {
        return Err(FormatError::Empty);
    }
    Ok(FromRadio::decode(body)?)
}

pub fn encode_from_radio(msg: &FromRadio) -> Result<Vec<u8>, FormatError> {
    encode_frame(&msg.encode_to_vec())
}

pub fn decode_to_radio(frame: &[u8]) -> Result<ToRadio, FormatError> {
    let body = decode_frame(frame)?;
    Ok(ToRadio::decode(body)?)
}

pub fn decode_to_radio_body(body: &[u8]) -> Result<ToRadio, FormatError> {
    if body.is_empty() {
        return Err(FormatError::Empty);
    }
    Ok(ToRadio::decode(body)?)
}

pub fn encode_to_radio(msg: &ToRadio) -> Result<Vec<u8>, FormatError> {
    encode_frame(&msg.encode_to_vec())
}

/// A mesh packet with its application payload decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    pub id: u32,
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub rx_time: u32,
    pub rx_snr: f32,
    pub rx_rssi: i32,
    pub hop_limit: u32,
    pub hop_start: u32,
    pub via_mqtt: bool,
    pub request_id: u32,
    pub reply_id: u32,
    pub want_response: bool,
    pub payload: Payload,
}

impl DecodedPacket {
    /// Combine packet metadata with an already decoded (or decrypted) `Data`.
    pub fn from_parts(pkt: &MeshPacket, data: &Data) -> Result<Self, FormatError> {
        let payload = decode_payload(data.portnum, &data.payload)?;
        Ok(Self::with_payload(pkt, data, payload))
    }

    pub fn with_payload(pkt: &MeshPacket, data: &Data, payload: Payload) -> Self {
        Self {
            id: pkt.id,
            from: pkt.from,
            to: pkt.to,
            channel: pkt.channel,
            rx_time: pkt.rx_time,
            rx_snr: pkt.rx_snr,
            rx_rssi: pkt.rx_rssi,
            hop_limit: pkt.hop_limit,
            hop_start: pkt.hop_start,
            via_mqtt: pkt.via_mqtt,
            request_id: data.request_id,
            reply_id: data.reply_id,
            want_response: data.want_response,
            payload,
        }
    }

    /// Decode a packet that arrived in the clear.
    pub fn from_packet(pkt: &MeshPacket) -> Result<Self, FormatError> {
        match &pkt.payload_variant {
            Some(mesh_packet::PayloadVariant::Decoded(data)) => Self::from_parts(pkt, data),
            _ => Err(FormatError::MissingPayload),
        }
    }

    pub fn port(&self) -> PortNum {
        self.payload.port()
    }

    /// Relays between sender and receiver, when the sender advertised `hop_start`.
    pub fn hops_away(&self) -> Option<u32> {
        if self.hop_start > 0 && self.hop_start >= self.hop_limit {
            Some(self.hop_start - self.hop_limit)
        } else {
            None
        }
    }

    /// Heard directly from the sender, with no relay in between.
    pub fn is_direct(&self) -> bool {
        self.hops_away() == Some(0)
    }

    /// Signal figures are only meaningful when the radio actually measured them.
    pub fn has_signal(&self) -> bool {
        self.rx_snr != 0.0 || self.rx_rssi != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protobuf::{from_radio, to_radio, MyNodeInfo};

    fn text_packet(text: &str) -> MeshPacket {
        MeshPacket {
            from: 0xaabbccdd,
            to: crate::protobuf::BROADCAST_ADDR,
            id: 42,
            hop_start: 3,
            hop_limit: 3,
            rx_snr: 6.25,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(
                Payload::Text(text.to_string()).into_data(),
            )),
            ..Default::default()
        }
    }

    #[test]
    fn from_radio_round_trip() {
        let msg = FromRadio {
            id: 9,
            payload_variant: Some(from_radio::PayloadVariant::Packet(text_packet("hi"))),
        };
        let framed = encode_from_radio(&msg).unwrap();
        assert_eq!(decode_from_radio(&framed).unwrap(), msg);

        let info = FromRadio {
            id: 0,
            payload_variant: Some(from_radio::PayloadVariant::MyInfo(MyNodeInfo {
                my_node_num: 0x1234,
                ..Default::default()
            })),
        };
        let framed = encode_from_radio(&info).unwrap();
        assert_eq!(decode_from_radio_body(&framed[4..]).unwrap(), info);
    }

    #[test]
    fn to_radio_round_trip() {
        let msg = ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::WantConfigId(77)),
        };
        assert_eq!(decode_to_radio(&encode_to_radio(&msg).unwrap()).unwrap(), msg);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let msg = FromRadio {
            id: 1,
            payload_variant: Some(from_radio::PayloadVariant::Packet(text_packet("hello"))),
        };
        let framed = encode_from_radio(&msg).unwrap();
        assert!(matches!(
            decode_from_radio(&framed[..framed.len() - 1]),
            Err(FormatError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn payload_schema_validation() {
        assert_eq!(
            decode_payload(1, "héllo".as_bytes()).unwrap(),
            Payload::Text("héllo".into())
        );
        assert_eq!(decode_payload(1, &[0xff, 0xfe]), Err(FormatError::InvalidUtf8));
        assert_eq!(decode_payload(0, b"x"), Err(FormatError::InvalidPort(0)));
        assert_eq!(decode_payload(999, b"x"), Err(FormatError::InvalidPort(999)));
        // truncated varint inside a Position
        assert!(decode_payload(PortNum::PositionApp as i32, &[0x18]).is_err());
    }

    #[test]
    fn decoded_packet_hops() {
        let pkt = text_packet("x");
        let d = DecodedPacket::from_packet(&pkt).unwrap();
        assert_eq!(d.port(), PortNum::TextMessageApp);
        assert!(d.is_direct());
        let relayed = MeshPacket {
            hop_limit: 1,
            ..pkt
        };
        let d = DecodedPacket::from_packet(&relayed).unwrap();
        assert_eq!(d.hops_away(), Some(2));
        assert!(!d.is_direct());
    }

    #[test]
    fn encrypted_packet_has_no_clear_payload() {
        let pkt = MeshPacket {
            payload_variant: Some(mesh_packet::PayloadVariant::Encrypted(vec![1, 2, 3])),
            ..Default::default()
        };
        assert_eq!(DecodedPacket::from_packet(&pkt), Err(FormatError::MissingPayload));
    }
}
