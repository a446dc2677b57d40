//! Operational counters for the `/stats` endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Cheap atomic counters, shared across handlers.
#[derive(Clone)]
pub struct Stats {
    inner: Arc<StatsInner>,
}

struct StatsInner {
    http_requests_total: AtomicU64,
    http_errors_total: AtomicU64,
    completions_total: AtomicU64,
    completions_streamed_total: AtomicU64,
    estimates_total: AtomicU64,
    prompt_tokens_total: AtomicU64,
    completion_tokens_total: AtomicU64,
    started_at: Instant,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StatsInner {
                http_requests_total: AtomicU64::new(0),
                http_errors_total: AtomicU64::new(0),
                completions_total: AtomicU64::new(0),
                completions_streamed_total: AtomicU64::new(0),
                estimates_total: AtomicU64::new(0),
                prompt_tokens_total: AtomicU64::new(0),
                completion_tokens_total: AtomicU64::new(0),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn inc_http_requests(&self) {
        self.inner.http_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_http_errors(&self) {
        self.inner.http_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_completions(&self) {
        self.inner.completions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_completions_streamed(&self) {
        self.inner
            .completions_streamed_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_estimates(&self) {
        self.inner.estimates_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_usage(&self, usage: &relay_core::Usage) {
        self.inner
            .prompt_tokens_total
            .fetch_add(u64::from(usage.prompt_tokens), Ordering::Relaxed);
        self.inner
            .completion_tokens_total
            .fetch_add(u64::from(usage.completion_tokens), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let m = &self.inner;
        serde_json::json!({
            "uptime_secs": m.started_at.elapsed().as_secs(),
            "http_requests_total": m.http_requests_total.load(Ordering::Relaxed),
            "http_errors_total": m.http_errors_total.load(Ordering::Relaxed),
            "completions_total": m.completions_total.load(Ordering::Relaxed),
            "completions_streamed_total": m.completions_streamed_total.load(Ordering::Relaxed),
            "estimates_total": m.estimates_total.load(Ordering::Relaxed),
            "prompt_tokens_total": m.prompt_tokens_total.load(Ordering::Relaxed),
            "completion_tokens_total": m.completion_tokens_total.load(Ordering::Relaxed),
        })
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
