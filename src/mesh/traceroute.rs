//! Traceroute request/response correlation.
//!
//! `start` registers a pending request, arms its timer and forwards the request to a
//! device. A matching response (by the outbound packet id, or by destination when the
//! response carries none) completes it; the timer moves it to `timed-out` otherwise.
//! Once a request has left `pending` it never changes again: late responses are logged
//! and dropped.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

use crate::error::GatewayError;
use crate::gateway::events::{EventBus, GatewayEvent};
use crate::mesh::topology::{EdgeSource, TopologyGraph};
use crate::metrics;
use crate::meshtastic::{format_node_id, random_packet_id};
use crate::protobuf::RouteDiscovery;

/// Firmware marker for "SNR not recorded" in route discovery SNR lists.
const SNR_UNKNOWN: i32 = i8::MIN as i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TracerouteStatus {
    Pending,
    Complete,
    TimedOut,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hop {
    #[serde(skip)]
    pub num: u32,
    pub id: String,
    /// SNR (dB) with which this hop received the packet
    pub snr: Option<f32>,
}

impl Hop {
    pub fn new(num: u32, snr: Option<f32>) -> Self {
        Self {
            num,
            id: format_node_id(num),
            snr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TracerouteRecord {
    pub id: String,
    pub device: String,
    pub destination: String,
    pub status: TracerouteStatus,
    pub hops: Vec<Hop>,
    pub route_back: Vec<Hop>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub finished: Option<DateTime<Utc>>,
}

/// Forward and return paths (origin and destination included) of a route reply.
pub fn hops_from_route(origin: u32, destination: u32, route: &RouteDiscovery) -> (Vec<Hop>, Vec<Hop>) {
    fn snr_at(list: &[i32], i: usize) -> Option<f32> {
        list.get(i)
            .copied()
            .filter(|v| *v != SNR_UNKNOWN)
            .map(|v| v as f32 / 4.0)
    }

    let mut forward = vec![Hop::new(origin, None)];
    for (i, num) in route.route.iter().chain(std::iter::once(&destination)).enumerate() {
        forward.push(Hop::new(*num, snr_at(&route.snr_towards, i)));
    }

    let mut back = Vec::new();
    if !route.snr_back.is_empty() || !route.route_back.is_empty() {
        back.push(Hop::new(destination, None));
        for (i, num) in route.route_back.iter().chain(std::iter::once(&origin)).enumerate() {
            back.push(Hop::new(*num, snr_at(&route.snr_back, i)));
        }
    }
    (forward, back)
}

struct Entry {
    record: TracerouteRecord,
    packet_id: u32,
    destination: u32,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    /// Request ids in creation order.
    order: VecDeque<String>,
}

struct Shared {
    state: Mutex<State>,
    timeout: Duration,
    retention: usize,
    seq: AtomicU64,
    topology: Arc<TopologyGraph>,
    events: EventBus,
}

impl Shared {
    fn finish(
        &self,
        id: &str,
        status: TracerouteStatus,
        hops: Vec<Hop>,
        route_back: Vec<Hop>,
        error: Option<String>,
    ) -> Result<Option<TracerouteRecord>, GatewayError> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| GatewayError::UnknownTraceroute(id.to_string()))?;
        if entry.record.status != TracerouteStatus::Pending {
            info!(
                "Ignoring late {:?} for traceroute {} (already {:?})",
                status, id, entry.record.status
            );
            return Ok(None);
        }
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        entry.record.status = status;
        entry.record.hops = hops;
        entry.record.route_back = route_back;
        entry.record.error = error;
        entry.record.finished = Some(Utc::now());
        let record = entry.record.clone();
        self.evict_finished(&mut state);
        drop(state);

        match status {
            TracerouteStatus::Complete => metrics::inc_traceroutes_completed(),
            TracerouteStatus::TimedOut => metrics::inc_traceroutes_timed_out(),
            _ => {}
        }
        self.events
            .publish(GatewayEvent::TracerouteResolved(record.clone()));
        Ok(Some(record))
    }

    fn evict_finished(&self, state: &mut State) {
        let finished = state
            .entries
            .values()
            .filter(|e| e.record.status != TracerouteStatus::Pending)
            .count();
        let mut excess = finished.saturating_sub(self.retention);
        if excess == 0 {
            return;
        }
        let State { entries, order } = state;
        order.retain(|id| {
            if excess == 0 {
                return true;
            }
            match entries.get(id) {
                Some(e) if e.record.status != TracerouteStatus::Pending => {
                    entries.remove(id);
                    excess -= 1;
                    false
                }
                Some(_) => true,
                None => false,
            }
        });
    }

    fn expire(&self, id: &str) {
        match self.finish(id, TracerouteStatus::TimedOut, Vec::new(), Vec::new(), None) {
            Ok(Some(_)) => warn!("Traceroute {} timed out after {:?}", id, self.timeout),
            Ok(None) => {}
            Err(e) => debug!("Traceroute timer fired for evicted request: {}", e),
        }
    }
}

/// Cheap to clone; all clones share the same pending table.
#[derive(Clone)]
pub struct TracerouteCoordinator {
    shared: Arc<Shared>,
}

impl TracerouteCoordinator {
    pub fn new(
        timeout: Duration,
        retention: usize,
        topology: Arc<TopologyGraph>,
        events: EventBus,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                timeout,
                retention,
                seq: AtomicU64::new(0),
                topology,
                events,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// Register a pending traceroute and hand it to `forward` along with the packet id
    /// the outbound request must carry. The request is discarded again if `forward`
    /// fails, and the error is returned to the caller.
    pub async fn start<F, Fut>(
        &self,
        device: &str,
        destination: u32,
        forward: F,
    ) -> Result<String, GatewayError>
    where
        F: FnOnce(u32) -> Fut,
        Fut: Future<Output = Result<(), GatewayError>>,
    {
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Utc::now();
        let id = format!("tr-{}-{}", seq, now.timestamp());
        let packet_id = random_packet_id();

        let shared = Arc::clone(&self.shared);
        let timer_id = id.clone();
        let timeout = self.shared.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            shared.expire(&timer_id);
        });

        {
            let mut state = self.shared.state.lock();
            state.entries.insert(
                id.clone(),
                Entry {
                    record: TracerouteRecord {
                        id: id.clone(),
                        device: device.to_string(),
                        destination: format_node_id(destination),
                        status: TracerouteStatus::Pending,
                        hops: Vec::new(),
                        route_back: Vec::new(),
                        error: None,
                        created: now,
                        finished: None,
                    },
                    packet_id,
                    destination,
                    timer: Some(timer.abort_handle()),
                },
            );
            state.order.push_back(id.clone());
        }
        info!(
            "Traceroute {} started: {} -> {} (packet id 0x{:08x})",
            id,
            device,
            format_node_id(destination),
            packet_id
        );

        if let Err(e) = forward(packet_id).await {
            timer.abort();
            let mut state = self.shared.state.lock();
            state.entries.remove(&id);
            state.order.retain(|x| x != &id);
            warn!("Traceroute {} could not be sent: {}", id, e);
            return Err(e);
        }
        metrics::inc_traceroutes_started();
        Ok(id)
    }

    /// Complete `id` with the given paths and feed adjacent hop pairs into the
    /// topology graph. Returns `Ok(false)` when the request already finished.
    pub fn resolve(&self, id: &str, hops: Vec<Hop>, route_back: Vec<Hop>) -> Result<bool, GatewayError> {
        let pairs: Vec<(u32, u32, Option<f32>)> = hops
            .windows(2)
            .chain(route_back.windows(2))
            .map(|w| (w[0].num, w[1].num, w[1].snr))
            .collect();
        let applied = self
            .shared
            .finish(id, TracerouteStatus::Complete, hops, route_back, None)?;
        let Some(record) = applied else {
            return Ok(false);
        };
        let now = Utc::now();
        for (from, to, snr) in pairs {
            self.shared
                .topology
                .add_observation(from, to, snr, None, now, EdgeSource::Traceroute);
        }
        info!(
            "Traceroute {} complete: {}",
            record.id,
            record
                .hops
                .iter()
                .map(|h| h.id.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        Ok(true)
    }

    /// Move `id` to `error`. Returns `Ok(false)` when the request already finished.
    pub fn fail(&self, id: &str, reason: &str) -> Result<bool, GatewayError> {
        let applied = self.shared.finish(
            id,
            TracerouteStatus::Error,
            Vec::new(),
            Vec::new(),
            Some(reason.to_string()),
        )?;
        if applied.is_some() {
            warn!("Traceroute {} failed: {}", id, reason);
        }
        Ok(applied.is_some())
    }

    /// Find the request a response from `from` on `device` belongs to: by outbound
    /// packet id when `request_id` is set, else the oldest pending request to `from`.
    pub fn correlate(&self, device: &str, from: u32, request_id: u32) -> Option<String> {
        let state = self.shared.state.lock();
        if request_id != 0 {
            if let Some(id) = state.order.iter().find(|id| {
                state
                    .entries
                    .get(*id)
                    .is_some_and(|e| e.record.device == device && e.packet_id == request_id)
            }) {
                return Some(id.clone());
            }
            return None;
        }
        state
            .order
            .iter()
            .find(|id| {
                state.entries.get(*id).is_some_and(|e| {
                    e.record.device == device
                        && e.destination == from
                        && e.record.status == TracerouteStatus::Pending
                })
            })
            .cloned()
    }

    /// Handle a traceroute reply received on `device`. `origin` is the device's node.
    pub fn resolve_response(
        &self,
        device: &str,
        origin: u32,
        from: u32,
        request_id: u32,
        route: &RouteDiscovery,
    ) -> Option<String> {
        let id = self.correlate(device, from, request_id)?;
        let (hops, back) = hops_from_route(origin, from, route);
        match self.resolve(&id, hops, back) {
            Ok(_) => Some(id),
            Err(e) => {
                debug!("Traceroute reply from {} not applied: {}", format_node_id(from), e);
                None
            }
        }
    }

    /// Handle a routing error on `device` that refers to outbound packet `request_id`.
    pub fn fail_by_packet(&self, device: &str, request_id: u32, reason: &str) -> Option<String> {
        if request_id == 0 {
            return None;
        }
        let id = self.correlate(device, 0, request_id)?;
        self.fail(&id, reason).ok()?;
        Some(id)
    }

    pub fn query(&self, id: &str) -> Option<TracerouteRecord> {
        self.shared
            .state
            .lock()
            .entries
            .get(id)
            .map(|e| e.record.clone())
    }

    /// All retained requests, oldest first.
    pub fn list(&self) -> Vec<TracerouteRecord> {
        let state = self.shared.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.entries.get(id).map(|e| e.record.clone()))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .entries
            .values()
            .filter(|e| e.record.status == TracerouteStatus::Pending)
            .count()
    }
}
