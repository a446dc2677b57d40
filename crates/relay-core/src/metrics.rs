use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result};
use crate::model::AdapterKind;

/// How a call ended. `Partial` covers streams where the client disconnected
/// after tokens had already been delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Success,
    Partial,
    Failure,
}

/// One row emitted per upstream attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSample {
    pub request_id: String,
    pub user_id: String,
    pub model: String,
    pub provider: String,
    pub adapter: AdapterKind,
    pub streamed: bool,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cached_tokens: u32,
    pub cost: f64,
    pub total_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_chunk_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput_tokens_s: Option<f64>,
    pub attempt_number: u32,
    pub success: CallOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Batched performance view for one `(model, provider)` pair.
#[derive(Debug, Clone, Default)]
pub struct PerfStats {
    pub throughput_median_ts: Option<f64>,
    pub latency_median_ms: Option<f64>,
    pub sample_count: usize,
}

/// External metrics storage. Both read operations must be a single
/// round-trip each; the selector issues O(1) calls per ranking regardless of
/// candidate count.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Persist one sample. Failures are the store's problem; callers treat
    /// this as fire-and-forget.
    async fn record(&self, sample: MetricsSample) -> Result<()>;

    /// Median throughput/latency over the last `window` samples per provider.
    /// Providers with no usable samples map to `PerfStats::default()`.
    async fn get_performance(
        &self,
        model_id: &str,
        providers: &[String],
        window: usize,
    ) -> Result<HashMap<String, PerfStats>>;

    /// Whether the user saw a prompt-cache hit (`cached_tokens > 0`) in any
    /// of their last 5 requests against each `(model, provider)` pair.
    async fn get_cache_history(
        &self,
        user_id: &str,
        model_id: &str,
        providers: &[String],
    ) -> Result<HashMap<String, bool>>;
}
