//! Topology graph derived from direct receptions, neighbor reports and traceroutes.
//!
//! Edges are undirected and keyed by the node pair. An edge is only created when both
//! endpoints are present in the registry; if an endpoint later disappears the edge is
//! dropped on the next read. Edges age out on their own clock, independent of nodes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::mesh::registry::{NodeRegistry, NodeSnapshot};
use crate::meshtastic::format_node_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeSource {
    /// Zero-hop reception reported by a gateway
    Direct,
    Neighbor,
    Traceroute,
    /// Node DB entry streamed by a device during its handshake
    NodeDb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EdgeKey(u32, u32);

impl EdgeKey {
    fn new(a: u32, b: u32) -> Self {
        if a <= b {
            EdgeKey(a, b)
        } else {
            EdgeKey(b, a)
        }
    }
}

#[derive(Debug, Clone)]
struct EdgeRecord {
    from: u32,
    to: u32,
    snr: Option<f32>,
    rssi: Option<i32>,
    source: EdgeSource,
    updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeSnapshot {
    pub from: String,
    pub to: String,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub source: EdgeSource,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopologySnapshot {
    pub nodes: Vec<NodeSnapshot>,
    pub edges: Vec<EdgeSnapshot>,
}

pub struct TopologyGraph {
    registry: Arc<NodeRegistry>,
    edges: Mutex<HashMap<EdgeKey, EdgeRecord>>,
}

impl TopologyGraph {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            registry,
            edges: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `from` was heard by `to`. Ignored (returns false) for self-loops,
    /// unknown endpoints, or when a newer observation of the pair already exists.
    pub fn add_observation(
        &self,
        from: u32,
        to: u32,
        snr: Option<f32>,
        rssi: Option<i32>,
        at: DateTime<Utc>,
        source: EdgeSource,
    ) -> bool {
        if from == to || !self.registry.contains(from) || !self.registry.contains(to) {
            return false;
        }
        let mut edges = self.edges.lock();
        let key = EdgeKey::new(from, to);
        if let Some(existing) = edges.get(&key) {
            if existing.updated > at {
                return false;
            }
        }
        edges.insert(
            key,
            EdgeRecord {
                from,
                to,
                snr,
                rssi,
                source,
                updated: at,
            },
        );
        true
    }

    /// Current nodes and the edges whose endpoints both still exist.
    pub fn snapshot(&self) -> TopologySnapshot {
        let nodes = self.registry.list();
        let known: std::collections::HashSet<u32> = nodes.iter().map(|n| n.num).collect();

        let mut edges = self.edges.lock();
        edges.retain(|k, _| known.contains(&k.0) && known.contains(&k.1));
        let mut out: Vec<EdgeSnapshot> = edges
            .values()
            .map(|e| EdgeSnapshot {
                from: format_node_id(e.from),
                to: format_node_id(e.to),
                snr: e.snr,
                rssi: e.rssi,
                source: e.source,
                updated: e.updated,
            })
            .collect();
        drop(edges);
        out.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));

        TopologySnapshot { nodes, edges: out }
    }

    /// Remove edges last updated before `older_than`; returns how many went.
    pub fn prune(&self, older_than: DateTime<Utc>) -> usize {
        let mut edges = self.edges.lock();
        let before = edges.len();
        edges.retain(|_, e| e.updated >= older_than);
        before - edges.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::registry::NodeObservation;
    use chrono::Duration;

    fn graph_with(nodes: &[u32]) -> (Arc<NodeRegistry>, TopologyGraph) {
        let reg = Arc::new(NodeRegistry::new());
        for n in nodes {
            reg.upsert(*n, NodeObservation::default(), "test", Utc::now());
        }
        let g = TopologyGraph::new(reg.clone());
        (reg, g)
    }

    #[test]
    fn edges_require_known_endpoints() {
        let (_reg, g) = graph_with(&[1, 2]);
        let now = Utc::now();
        assert!(g.add_observation(1, 2, Some(5.0), Some(-80), now, EdgeSource::Direct));
        assert!(!g.add_observation(1, 3, Some(5.0), None, now, EdgeSource::Direct));
        assert!(!g.add_observation(1, 1, None, None, now, EdgeSource::Direct));
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn pair_is_unordered_and_newest_wins() {
        let (_reg, g) = graph_with(&[1, 2]);
        let now = Utc::now();
        g.add_observation(1, 2, Some(5.0), None, now, EdgeSource::Direct);
        g.add_observation(2, 1, Some(-2.0), None, now + Duration::seconds(1), EdgeSource::Neighbor);
        assert!(!g.add_observation(1, 2, Some(9.0), None, now - Duration::seconds(1), EdgeSource::Direct));
        let snap = g.snapshot();
        assert_eq!(snap.edges.len(), 1);
        assert_eq!(snap.edges[0].snr, Some(-2.0));
        assert_eq!(snap.edges[0].from, "!00000002");
    }

    #[test]
    fn snapshot_drops_edges_to_removed_nodes() {
        let (reg, g) = graph_with(&[1, 2, 3]);
        let now = Utc::now();
        g.add_observation(1, 2, None, None, now, EdgeSource::Traceroute);
        g.add_observation(2, 3, None, None, now, EdgeSource::Traceroute);
        reg.remove_stale(now + Duration::seconds(1));
        reg.upsert(1, NodeObservation::default(), "test", now + Duration::seconds(2));
        reg.upsert(2, NodeObservation::default(), "test", now + Duration::seconds(2));
        let snap = g.snapshot();
        assert_eq!(snap.nodes.len(), 2);
        assert_eq!(snap.edges.len(), 1);
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn prune_ages_edges_independently() {
        let (reg, g) = graph_with(&[1, 2, 3]);
        let now = Utc::now();
        g.add_observation(1, 2, None, None, now - Duration::hours(2), EdgeSource::Direct);
        g.add_observation(2, 3, None, None, now, EdgeSource::Direct);
        assert_eq!(g.prune(now - Duration::hours(1)), 1);
        assert_eq!(g.edge_count(), 1);
        assert_eq!(reg.len(), 3);
    }
}
