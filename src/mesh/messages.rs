//! Bounded text message history, newest last.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: u32,
    pub from: String,
    pub to: String,
    pub text: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub rx_snr: Option<f32>,
    pub rx_rssi: Option<i32>,
    pub hop_start: u32,
    pub hop_limit: u32,
    /// Device name, or `mqtt` for broker traffic
    pub device: String,
    pub channel: u32,
    /// Originated through this gateway rather than received
    pub sent: bool,
}

pub struct MessageLog {
    capacity: usize,
    inner: Mutex<VecDeque<MessageRecord>>,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, record: MessageRecord) {
        let mut q = self.inner.lock();
        while q.len() >= self.capacity {
            q.pop_front();
        }
        q.push_back(record);
    }

    /// The last `limit` messages (all when `None`), oldest first.
    pub fn list(&self, limit: Option<usize>) -> Vec<MessageRecord> {
        let q = self.inner.lock();
        let skip = limit.map_or(0, |l| q.len().saturating_sub(l));
        q.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: u32) -> MessageRecord {
        MessageRecord {
            id,
            from: "!00000001".into(),
            to: "^all".into(),
            text: format!("m{}", id),
            timestamp: Utc::now(),
            rx_snr: None,
            rx_rssi: None,
            hop_start: 3,
            hop_limit: 3,
            device: "base".into(),
            channel: 0,
            sent: false,
        }
    }

    #[test]
    fn keeps_newest_messages() {
        let log = MessageLog::new(2);
        log.push(msg(1));
        log.push(msg(2));
        log.push(msg(3));
        let ids: Vec<u32> = log.list(None).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(log.list(Some(1))[0].id, 3);
    }
}
