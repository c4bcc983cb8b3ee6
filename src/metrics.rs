//! Process-wide counters for the packet pipeline and device commands.
//! Cheap relaxed atomics; exposed through `GET /api/metrics`.
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static FRAMES_DECODED: AtomicU64 = AtomicU64::new(0);
static FORMAT_ERRORS: AtomicU64 = AtomicU64::new(0);
static STREAM_BYTES_DROPPED: AtomicU64 = AtomicU64::new(0);
static PACKETS_DECRYPTED: AtomicU64 = AtomicU64::new(0);
static PACKETS_UNDECRYPTABLE: AtomicU64 = AtomicU64::new(0);
static MQTT_MESSAGES: AtomicU64 = AtomicU64::new(0);
static MQTT_IGNORED: AtomicU64 = AtomicU64::new(0);
static COMMANDS_SENT: AtomicU64 = AtomicU64::new(0);
static COMMANDS_ACKED: AtomicU64 = AtomicU64::new(0);
static COMMANDS_FAILED: AtomicU64 = AtomicU64::new(0);
static COMMANDS_TIMED_OUT: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);
static TRACEROUTES_STARTED: AtomicU64 = AtomicU64::new(0);
static TRACEROUTES_COMPLETED: AtomicU64 = AtomicU64::new(0);
static TRACEROUTES_TIMED_OUT: AtomicU64 = AtomicU64::new(0);

pub fn inc_frames_decoded() {
    FRAMES_DECODED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_format_errors() {
    FORMAT_ERRORS.fetch_add(1, Ordering::Relaxed);
}
pub fn add_stream_bytes_dropped(n: u64) {
    STREAM_BYTES_DROPPED.fetch_add(n, Ordering::Relaxed);
}
pub fn inc_decrypted() {
    PACKETS_DECRYPTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_undecryptable() {
    PACKETS_UNDECRYPTABLE.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_mqtt_messages() {
    MQTT_MESSAGES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_mqtt_ignored() {
    MQTT_IGNORED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_commands_sent() {
    COMMANDS_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_commands_acked() {
    COMMANDS_ACKED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_commands_failed() {
    COMMANDS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_commands_timed_out() {
    COMMANDS_TIMED_OUT.fetch_add(1, Ordering::Relaxed);
}
pub fn observe_ack_latency(sent_at: Instant) {
    let ms = sent_at.elapsed().as_millis() as u64;
    ACK_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    ACK_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_traceroutes_started() {
    TRACEROUTES_STARTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_traceroutes_completed() {
    TRACEROUTES_COMPLETED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_traceroutes_timed_out() {
    TRACEROUTES_TIMED_OUT.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub frames_decoded: u64,
    pub format_errors: u64,
    pub stream_bytes_dropped: u64,
    pub packets_decrypted: u64,
    pub packets_undecryptable: u64,
    pub mqtt_messages: u64,
    pub mqtt_ignored: u64,
    pub commands_sent: u64,
    pub commands_acked: u64,
    pub commands_failed: u64,
    pub commands_timed_out: u64,
    pub ack_latency_avg_ms: Option<u64>,
    pub traceroutes_started: u64,
    pub traceroutes_completed: u64,
    pub traceroutes_timed_out: u64,
}

pub fn snapshot() -> Snapshot {
    let sum = ACK_LATENCY_SUM_MS.load(Ordering::Relaxed);
    let count = ACK_LATENCY_COUNT.load(Ordering::Relaxed);
    Snapshot {
        frames_decoded: FRAMES_DECODED.load(Ordering::Relaxed),
        format_errors: FORMAT_ERRORS.load(Ordering::Relaxed),
        stream_bytes_dropped: STREAM_BYTES_DROPPED.load(Ordering::Relaxed),
        packets_decrypted: PACKETS_DECRYPTED.load(Ordering::Relaxed),
        packets_undecryptable: PACKETS_UNDECRYPTABLE.load(Ordering::Relaxed),
        mqtt_messages: MQTT_MESSAGES.load(Ordering::Relaxed),
        mqtt_ignored: MQTT_IGNORED.load(Ordering::Relaxed),
        commands_sent: COMMANDS_SENT.load(Ordering::Relaxed),
        commands_acked: COMMANDS_ACKED.load(Ordering::Relaxed),
        commands_failed: COMMANDS_FAILED.load(Ordering::Relaxed),
        commands_timed_out: COMMANDS_TIMED_OUT.load(Ordering::Relaxed),
        ack_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
        traceroutes_started: TRACEROUTES_STARTED.load(Ordering::Relaxed),
        traceroutes_completed: TRACEROUTES_COMPLETED.load(Ordering::Relaxed),
        traceroutes_timed_out: TRACEROUTES_TIMED_OUT.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_only_move_forward() {
        let before = snapshot();
        inc_format_errors();
        inc_commands_acked();
        let after = snapshot();
        assert!(after.format_errors > before.format_errors);
        assert!(after.commands_acked > before.commands_acked);
    }
}
