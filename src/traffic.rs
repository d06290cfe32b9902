//! In-memory ring of recent request records.
//!
//! Nothing here is persistent: the ring exists for diagnostics and tests.
//! Oldest records fall off once capacity is reached.

use std::collections::VecDeque;

use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

/// One served request, as recorded after the response completes.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficRecord {
    pub id: String,
    pub model_requested: String,
    pub model_served: String,
    pub tier: Option<String>,
    pub method: String,
    pub status: u16,
    pub latency_ms: u64,
    /// Served from the dedup cache (replay or subscription).
    pub deduped: bool,
    /// A payment authorization was attached or signed for this request.
    pub paid: bool,
}

impl TrafficRecord {
    pub fn new(model_requested: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            model_requested: model_requested.into(),
            model_served: String::new(),
            tier: None,
            method: String::new(),
            status: 0,
            latency_ms: 0,
            deduped: false,
            paid: false,
        }
    }
}

/// Bounded ring of [`TrafficRecord`]s.
pub struct TrafficLog {
    records: Mutex<VecDeque<TrafficRecord>>,
    capacity: usize,
}

impl TrafficLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub async fn push(&self, record: TrafficRecord) {
        let mut records = self.records.lock().await;
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// The most recent `n` records, newest last.
    pub async fn recent(&self, n: usize) -> Vec<TrafficRecord> {
        let records = self.records.lock().await;
        records
            .iter()
            .skip(records.len().saturating_sub(n))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_and_recent_preserve_order() {
        let log = TrafficLog::new(8);
        for i in 0..3 {
            let mut r = TrafficRecord::new(format!("model-{i}"));
            r.status = 200;
            log.push(r).await;
        }
        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].model_requested, "model-0");
        assert_eq!(recent[2].model_requested, "model-2");
    }

    #[tokio::test]
    async fn test_ring_drops_oldest_beyond_capacity() {
        let log = TrafficLog::new(2);
        for i in 0..5 {
            log.push(TrafficRecord::new(format!("model-{i}"))).await;
        }
        assert_eq!(log.len().await, 2);
        let recent = log.recent(10).await;
        assert_eq!(recent[0].model_requested, "model-3");
        assert_eq!(recent[1].model_requested, "model-4");
    }
}
