//! Bounded per-node telemetry history.
//!
//! Each node keeps at most `capacity` samples in arrival order; the oldest sample is
//! evicted first. Nothing here survives a restart.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::mesh::registry::NodeSnapshot;
use crate::mesh::GeoPosition;
use crate::meshtastic::format_node_id;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
    pub snr: Option<f32>,
    pub position: Option<GeoPosition>,
}

impl TelemetrySample {
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            battery_level: None,
            voltage: None,
            channel_utilization: None,
            air_util_tx: None,
            uptime_seconds: None,
            snr: None,
            position: None,
        }
    }

    /// Fill from device metrics as carried by telemetry packets and node DB entries.
    pub fn with_device_metrics(mut self, m: &crate::protobuf::DeviceMetrics) -> Self {
        self.battery_level = m.battery_level;
        self.voltage = m.voltage;
        self.channel_utilization = m.channel_utilization;
        self.air_util_tx = m.air_util_tx;
        self.uptime_seconds = m.uptime_seconds;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySummary {
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub nodes_with_gps: usize,
    pub average_snr: Option<f32>,
    pub average_battery: Option<f32>,
    pub total_samples: usize,
    /// Retained sample count per node ID.
    pub history_points: BTreeMap<String, usize>,
}

pub struct TelemetryHistory {
    capacity: usize,
    series: Mutex<HashMap<u32, VecDeque<TelemetrySample>>>,
}

impl TelemetryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            series: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, node: u32, sample: TelemetrySample) {
        let mut series = self.series.lock();
        let q = series
            .entry(node)
            .or_insert_with(|| VecDeque::with_capacity(self.capacity.min(64)));
        while q.len() >= self.capacity {
            q.pop_front();
        }
        q.push_back(sample);
    }

    /// Samples for `node`, oldest first.
    pub fn history(&self, node: u32) -> Vec<TelemetrySample> {
        self.series
            .lock()
            .get(&node)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, node: u32) -> usize {
        self.series.lock().get(&node).map_or(0, |q| q.len())
    }

    /// Drop the history of nodes that left the registry.
    pub fn forget(&self, nodes: &[u32]) {
        let mut series = self.series.lock();
        for n in nodes {
            series.remove(n);
        }
    }

    /// Aggregate counts over `nodes`. A node is online when heard within `online_window`.
    pub fn summary(
        &self,
        nodes: &[NodeSnapshot],
        now: DateTime<Utc>,
        online_window: Duration,
    ) -> TelemetrySummary {
        let cutoff = now - online_window;
        let online_nodes = nodes.iter().filter(|n| n.last_heard >= cutoff).count();
        let nodes_with_gps = nodes.iter().filter(|n| n.position.is_some()).count();

        let snrs: Vec<f32> = nodes.iter().filter_map(|n| n.snr).collect();
        let average_snr = mean(&snrs);
        let batteries: Vec<f32> = nodes
            .iter()
            .filter_map(|n| n.battery_level)
            // 101 means "externally powered"
            .filter(|b| *b <= 100)
            .map(|b| b as f32)
            .collect();
        let average_battery = mean(&batteries);

        let series = self.series.lock();
        let history_points: BTreeMap<String, usize> = series
            .iter()
            .map(|(num, q)| (format_node_id(*num), q.len()))
            .collect();
        let total_samples = series.values().map(|q| q.len()).sum();

        TelemetrySummary {
            total_nodes: nodes.len(),
            online_nodes,
            nodes_with_gps,
            average_snr,
            average_battery,
            total_samples,
            history_points,
        }
    }
}

fn mean(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f32>() / values.len() as f32)
    }
}
