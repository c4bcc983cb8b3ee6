//! # Meshtastic link layer
//!
//! Everything that touches Meshtastic wire data lives here:
//!
//! - [`framer`]: `0x94 0xC3` stream framing used on the device TCP link
//! - [`codec`]: protobuf frame and payload decoding, with per-port schema validation
//! - [`crypto`]: channel keys, the key ring and AES-CTR packet decryption
//! - [`session`]: one long-lived connection to a local gateway radio
//! - [`mqtt`]: the broker bridge carrying the wider mesh's traffic
//!
//! Node numbers are `u32` on the wire and `!xxxxxxxx` strings at the boundary; the
//! helpers below convert between the two.

pub mod codec;
pub mod crypto;
pub mod framer;
pub mod mqtt;
pub mod session;

use crate::error::GatewayError;
pub use crate::protobuf::BROADCAST_ADDR;

/// Destination marker meaning "broadcast to every node on the channel".
pub const BROADCAST_MARKER: &str = "^all";

/// Canonical node ID string, e.g. `!aabbccdd`.
pub fn format_node_id(num: u32) -> String {
    format!("!{:08x}", num)
}

/// Parse `!hex`, `0xHEX` or decimal node numbers.
pub fn parse_node_id(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix('!') {
        return u32::from_str_radix(hex, 16).ok();
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).ok();
    }
    s.parse::<u32>().ok()
}

/// Resolve a boundary destination (node ID or [`BROADCAST_MARKER`]) to a node number.
pub fn parse_destination(s: &str) -> Result<u32, GatewayError> {
    if s.trim() == BROADCAST_MARKER {
        return Ok(BROADCAST_ADDR);
    }
    parse_node_id(s).ok_or_else(|| GatewayError::InvalidArgument(format!("bad node id '{}'", s)))
}

/// Boundary form of a destination, mapping the broadcast address back to `^all`.
pub fn format_destination(num: u32) -> String {
    if num == BROADCAST_ADDR {
        BROADCAST_MARKER.to_string()
    } else {
        format_node_id(num)
    }
}

/// Non-zero random packet id, as the firmware expects for correlation.
pub fn random_packet_id() -> u32 {
    loop {
        let id: u32 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_formats() {
        assert_eq!(format_node_id(0xaabbccdd), "!aabbccdd");
        assert_eq!(format_node_id(1), "!00000001");
        assert_eq!(parse_node_id("!aabbccdd"), Some(0xaabbccdd));
        assert_eq!(parse_node_id("0xAABBCCDD"), Some(0xaabbccdd));
        assert_eq!(parse_node_id("16"), Some(16));
        assert_eq!(parse_node_id("!zz"), None);
    }

    #[test]
    fn broadcast_marker_round_trips() {
        assert_eq!(parse_destination("^all").unwrap(), BROADCAST_ADDR);
        assert_eq!(format_destination(BROADCAST_ADDR), "^all");
        assert!(parse_destination("nobody").is_err());
    }
}
