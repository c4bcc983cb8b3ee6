//! Aggregated view of the mesh.
//!
//! These collections are shared between every device session, the MQTT bridge and the
//! HTTP boundary. Each one guards its state with a single `parking_lot` lock and every
//! mutating call takes that lock exactly once, so a reader never observes half of an
//! update. Cross references between collections are node numbers, never pointers.

pub mod messages;
pub mod registry;
pub mod telemetry;
pub mod topology;
pub mod traceroute;

use serde::{Deserialize, Serialize};

/// Latitude/longitude in degrees, altitude in metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<i32>,
}

impl GeoPosition {
    /// From a protobuf position. `None` without a fix or at the 0,0 placeholder.
    pub fn from_proto(p: &crate::protobuf::Position) -> Option<Self> {
        let (lat, lon) = (p.latitude_i?, p.longitude_i?);
        if lat == 0 && lon == 0 {
            return None;
        }
        Some(Self {
            latitude: lat as f64 * 1e-7,
            longitude: lon as f64 * 1e-7,
            altitude: p.altitude,
        })
    }

    pub fn to_proto(&self) -> crate::protobuf::Position {
        crate::protobuf::Position {
            latitude_i: Some((self.latitude * 1e7).round() as i32),
            longitude_i: Some((self.longitude * 1e7).round() as i32),
            altitude: self.altitude,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_scaling() {
        let p = crate::protobuf::Position {
            latitude_i: Some(515_000_000),
            longitude_i: Some(-1_250_000),
            altitude: Some(12),
            ..Default::default()
        };
        let g = GeoPosition::from_proto(&p).unwrap();
        assert!((g.latitude - 51.5).abs() < 1e-9);
        assert!((g.longitude + 0.125).abs() < 1e-9);
        assert_eq!(g.to_proto().latitude_i, Some(515_000_000));

        let empty = crate::protobuf::Position::default();
        assert!(GeoPosition::from_proto(&empty).is_none());
    }
}
