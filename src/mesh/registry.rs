//! Canonical node registry.
//!
//! Every source (device sessions and the MQTT bridge) reports partial observations of a
//! node. They are merged field by field: each field remembers the timestamp of the
//! observation that set it, and a value only replaces it when its own timestamp is at
//! least as new. Re-applying an observation is therefore a no-op, and a late-arriving
//! old report can never roll a fresher field back.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

use crate::mesh::GeoPosition;
use crate::meshtastic::format_node_id;

/// Partial observation of a node; `None` fields are left untouched by `upsert`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeObservation {
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<String>,
    pub role: Option<String>,
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub hops_away: Option<u32>,
    pub position: Option<GeoPosition>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
    pub via_mqtt: Option<bool>,
}

impl NodeObservation {
    pub fn is_empty(&self) -> bool {
        self == &NodeObservation::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Stamped<T> {
    value: T,
    at: DateTime<Utc>,
}

/// Last-writer-wins slot.
#[derive(Debug, Clone, PartialEq)]
struct Field<T>(Option<Stamped<T>>);

impl<T: Clone> Field<T> {
    fn empty() -> Self {
        Field(None)
    }

    fn merge(&mut self, value: Option<T>, at: DateTime<Utc>) {
        let Some(value) = value else { return };
        match &self.0 {
            Some(current) if current.at > at => {}
            _ => self.0 = Some(Stamped { value, at }),
        }
    }

    fn get(&self) -> Option<T> {
        self.0.as_ref().map(|s| s.value.clone())
    }
}

#[derive(Debug, Clone)]
struct NodeRecord {
    long_name: Field<String>,
    short_name: Field<String>,
    hw_model: Field<String>,
    role: Field<String>,
    battery_level: Field<u32>,
    voltage: Field<f32>,
    snr: Field<f32>,
    rssi: Field<i32>,
    hops_away: Field<u32>,
    position: Field<GeoPosition>,
    channel_utilization: Field<f32>,
    air_util_tx: Field<f32>,
    uptime_seconds: Field<u32>,
    via_mqtt: Field<bool>,
    source: Field<String>,
    last_heard: DateTime<Utc>,
}

impl NodeRecord {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            long_name: Field::empty(),
            short_name: Field::empty(),
            hw_model: Field::empty(),
            role: Field::empty(),
            battery_level: Field::empty(),
            voltage: Field::empty(),
            snr: Field::empty(),
            rssi: Field::empty(),
            hops_away: Field::empty(),
            position: Field::empty(),
            channel_utilization: Field::empty(),
            air_util_tx: Field::empty(),
            uptime_seconds: Field::empty(),
            via_mqtt: Field::empty(),
            source: Field::empty(),
            last_heard: at,
        }
    }

    fn apply(&mut self, obs: NodeObservation, source: &str, at: DateTime<Utc>) {
        self.long_name.merge(obs.long_name, at);
        self.short_name.merge(obs.short_name, at);
        self.hw_model.merge(obs.hw_model, at);
        self.role.merge(obs.role, at);
        self.battery_level.merge(obs.battery_level, at);
        self.voltage.merge(obs.voltage, at);
        self.snr.merge(obs.snr, at);
        self.rssi.merge(obs.rssi, at);
        self.hops_away.merge(obs.hops_away, at);
        self.position.merge(obs.position, at);
        self.channel_utilization.merge(obs.channel_utilization, at);
        self.air_util_tx.merge(obs.air_util_tx, at);
        self.uptime_seconds.merge(obs.uptime_seconds, at);
        self.via_mqtt.merge(obs.via_mqtt, at);
        self.source.merge(Some(source.to_string()), at);
        if at > self.last_heard {
            self.last_heard = at;
        }
    }

    fn snapshot(&self, num: u32) -> NodeSnapshot {
        NodeSnapshot {
            num,
            id: format_node_id(num),
            long_name: self.long_name.get(),
            short_name: self.short_name.get(),
            hw_model: self.hw_model.get(),
            role: self.role.get(),
            battery_level: self.battery_level.get(),
            voltage: self.voltage.get(),
            snr: self.snr.get(),
            rssi: self.rssi.get(),
            hops_away: self.hops_away.get(),
            position: self.position.get(),
            channel_utilization: self.channel_utilization.get(),
            air_util_tx: self.air_util_tx.get(),
            uptime_seconds: self.uptime_seconds.get(),
            via_mqtt: self.via_mqtt.get().unwrap_or(false),
            source: self.source.get().unwrap_or_default(),
            last_heard: self.last_heard,
        }
    }
}

/// Immutable copy of a node handed out to readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub num: u32,
    pub id: String,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<String>,
    pub role: Option<String>,
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub hops_away: Option<u32>,
    pub position: Option<GeoPosition>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
    pub via_mqtt: bool,
    /// Device name or `mqtt`, whichever reported most recently.
    pub source: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_heard: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<u32, NodeRecord>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an observation of node `num` made by `source` at `at`.
    /// Returns the merged state and whether the node was new.
    pub fn upsert(
        &self,
        num: u32,
        obs: NodeObservation,
        source: &str,
        at: DateTime<Utc>,
    ) -> (NodeSnapshot, bool) {
        let mut nodes = self.nodes.write();
        let mut created = false;
        let record = nodes.entry(num).or_insert_with(|| {
            created = true;
            NodeRecord::new(at)
        });
        record.apply(obs, source, at);
        (record.snapshot(num), created)
    }

    pub fn get(&self, num: u32) -> Option<NodeSnapshot> {
        self.nodes.read().get(&num).map(|r| r.snapshot(num))
    }

    pub fn contains(&self, num: u32) -> bool {
        self.nodes.read().contains_key(&num)
    }

    /// All nodes, most recently heard first.
    pub fn list(&self) -> Vec<NodeSnapshot> {
        let mut out: Vec<NodeSnapshot> = self
            .nodes
            .read()
            .iter()
            .map(|(num, r)| r.snapshot(*num))
            .collect();
        out.sort_by(|a, b| b.last_heard.cmp(&a.last_heard).then(a.num.cmp(&b.num)));
        out
    }

    /// Snapshots for a set of node numbers; unknown numbers are skipped.
    pub fn select(&self, nums: impl IntoIterator<Item = u32>) -> Vec<NodeSnapshot> {
        let nodes = self.nodes.read();
        nums.into_iter()
            .filter_map(|n| nodes.get(&n).map(|r| r.snapshot(n)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Drop nodes not heard since `older_than`; returns the removed node numbers.
    pub fn remove_stale(&self, older_than: DateTime<Utc>) -> Vec<u32> {
        let mut nodes = self.nodes.write();
        let stale: Vec<u32> = nodes
            .iter()
            .filter(|(_, r)| r.last_heard < older_than)
            .map(|(num, _)| *num)
            .collect();
        for num in &stale {
            nodes.remove(num);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn named(long: &str) -> NodeObservation {
        NodeObservation {
            long_name: Some(long.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let reg = NodeRegistry::new();
        let t = Utc::now();
        let obs = NodeObservation {
            long_name: Some("Hilltop".into()),
            snr: Some(7.5),
            battery_level: Some(88),
            ..Default::default()
        };
        let (first, created) = reg.upsert(0xaabbccdd, obs.clone(), "base", t);
        assert!(created);
        let (second, created) = reg.upsert(0xaabbccdd, obs, "base", t);
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn older_observation_never_rolls_back_fields() {
        let reg = NodeRegistry::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(10);
        reg.upsert(1, named("new name"), "mqtt", t1);
        reg.upsert(
            1,
            NodeObservation {
                long_name: Some("old name".into()),
                battery_level: Some(50),
                ..Default::default()
            },
            "base",
            t0,
        );
        let n = reg.get(1).unwrap();
        assert_eq!(n.long_name.as_deref(), Some("new name"));
        // untouched field still accepts the older value
        assert_eq!(n.battery_level, Some(50));
        assert_eq!(n.source, "mqtt");
        assert_eq!(n.last_heard, t1);
    }

    #[test]
    fn partial_update_keeps_other_fields() {
        let reg = NodeRegistry::new();
        let t0 = Utc::now();
        reg.upsert(2, named("Relay"), "base", t0);
        reg.upsert(
            2,
            NodeObservation {
                snr: Some(-3.0),
                ..Default::default()
            },
            "mqtt",
            t0 + Duration::seconds(1),
        );
        let n = reg.get(2).unwrap();
        assert_eq!(n.long_name.as_deref(), Some("Relay"));
        assert_eq!(n.snr, Some(-3.0));
        assert_eq!(n.id, "!00000002");
    }

    #[test]
    fn remove_stale_ages_out_nodes() {
        let reg = NodeRegistry::new();
        let now = Utc::now();
        reg.upsert(1, named("old"), "base", now - Duration::hours(48));
        reg.upsert(2, named("fresh"), "base", now);
        let removed = reg.remove_stale(now - Duration::hours(24));
        assert_eq!(removed, vec![1]);
        assert!(reg.get(1).is_none());
        assert_eq!(reg.list().len(), 1);
    }

    #[test]
    fn list_orders_by_recency() {
        let reg = NodeRegistry::new();
        let now = Utc::now();
        reg.upsert(1, named("a"), "x", now - Duration::seconds(5));
        reg.upsert(2, named("b"), "x", now);
        let ids: Vec<u32> = reg.list().iter().map(|n| n.num).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(reg.select([1, 3]).len(), 1);
    }
}
