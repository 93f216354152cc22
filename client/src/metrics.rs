//! Request metrics for the randomness client.
//!
//! All counters are backed by atomics for lock-free concurrent access.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated client metrics.
///
/// Thread-safe via atomics; share via `Arc<Metrics>`.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Request transactions committed.
    pub requests_submitted: AtomicU64,
    /// Submissions retried after a stale blockhash.
    pub stale_blockhash_retries: AtomicU64,
    /// Submissions that failed permanently.
    pub submit_failures: AtomicU64,
    /// Fulfillments observed.
    pub requests_fulfilled: AtomicU64,
    /// Fulfillments whose callback was not delivered.
    pub callback_failures: AtomicU64,
    /// Requests that were not fulfilled within the timeout.
    pub requests_timed_out: AtomicU64,
    /// Sum of slots elapsed between request and settlement.
    pub fulfillment_slots_sum: AtomicU64,
}

impl Metrics {
    /// Create a new zeroed metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.requests_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_retry(&self) {
        self.stale_blockhash_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_submit_failure(&self) {
        self.submit_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an observed fulfillment and how many slots it took.
    pub fn record_fulfillment(&self, slots_elapsed: u64, is_success: bool) {
        self.requests_fulfilled.fetch_add(1, Ordering::Relaxed);
        self.fulfillment_slots_sum
            .fetch_add(slots_elapsed, Ordering::Relaxed);
        if !is_success {
            self.callback_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_timeout(&self) {
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Average slots from request to settlement, or 0 if none.
    pub fn avg_fulfillment_slots(&self) -> u64 {
        let count = self.requests_fulfilled.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.fulfillment_slots_sum.load(Ordering::Relaxed) / count
    }

    /// Serialize metrics as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "requests_submitted": self.requests_submitted.load(Ordering::Relaxed),
            "stale_blockhash_retries": self.stale_blockhash_retries.load(Ordering::Relaxed),
            "submit_failures": self.submit_failures.load(Ordering::Relaxed),
            "requests_fulfilled": self.requests_fulfilled.load(Ordering::Relaxed),
            "callback_failures": self.callback_failures.load(Ordering::Relaxed),
            "requests_timed_out": self.requests_timed_out.load(Ordering::Relaxed),
            "avg_fulfillment_slots": self.avg_fulfillment_slots(),
        })
    }
}
