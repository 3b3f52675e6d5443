use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use triage_core::model::DispatchStatus;

/// In-memory dispatch counters for `GET /stats`. Best-effort only:
/// process restart resets everything.
#[derive(Debug, Default)]
pub struct Stats {
    received: AtomicU64,
    processed: AtomicU64,
    accepted: AtomicU64,
    skipped: AtomicU64,
    duplicates: AtomicU64,
    errors: AtomicU64,
    per_event: Mutex<BTreeMap<String, u64>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_event(&self, event_type: &str) {
        if let Ok(mut guard) = self.per_event.lock() {
            *guard.entry(event_type.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_outcome(&self, status: DispatchStatus) {
        let counter = match status {
            DispatchStatus::Processed => &self.processed,
            DispatchStatus::Accepted => &self.accepted,
            DispatchStatus::Skipped => &self.skipped,
            DispatchStatus::Duplicate => &self.duplicates,
            DispatchStatus::Error => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Value {
        let per_event = self
            .per_event
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();

        json!({
            "received": self.received.load(Ordering::Relaxed),
            "processed": self.processed.load(Ordering::Relaxed),
            "accepted": self.accepted.load(Ordering::Relaxed),
            "skipped": self.skipped.load(Ordering::Relaxed),
            "duplicates": self.duplicates.load(Ordering::Relaxed),
            "errors": self.errors.load(Ordering::Relaxed),
            "events": per_event,
        })
    }
}
