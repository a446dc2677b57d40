use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use dashmap::DashMap;

use relay_core::{MetricsSample, MetricsStore, PerfStats, Result};

/// Ring depth kept per `(model, provider)` pair.
const PAIR_HISTORY: usize = 100;
/// Records consulted for the per-user cache-hit flag.
const CACHE_HISTORY: usize = 5;

/// In-memory metrics store: ring buffers per key. Persistence-backed stores
/// implement the same trait; this one backs the default wiring and tests.
pub struct InMemoryMetricsStore {
    by_pair: DashMap<(String, String), VecDeque<MetricsSample>>,
    by_user_pair: DashMap<(String, String, String), VecDeque<u32>>,
}

impl InMemoryMetricsStore {
    pub fn new() -> Self {
        Self {
            by_pair: DashMap::new(),
            by_user_pair: DashMap::new(),
        }
    }

    /// Number of samples recorded for a pair, for assertions in tests.
    pub fn sample_count(&self, model: &str, provider: &str) -> usize {
        self.by_pair
            .get(&(model.to_string(), provider.to_string()))
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Most recent sample for a pair.
    pub fn last_sample(&self, model: &str, provider: &str) -> Option<MetricsSample> {
        self.by_pair
            .get(&(model.to_string(), provider.to_string()))
            .and_then(|q| q.back().cloned())
    }
}

impl Default for InMemoryMetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

#[async_trait]
impl MetricsStore for InMemoryMetricsStore {
    async fn record(&self, sample: MetricsSample) -> Result<()> {
        let pair_key = (sample.model.clone(), sample.provider.clone());
        let user_key = (
            sample.user_id.clone(),
            sample.model.clone(),
            sample.provider.clone(),
        );

        {
            let mut ring = self.by_pair.entry(pair_key).or_default();
            if ring.len() >= PAIR_HISTORY {
                ring.pop_front();
            }
            ring.push_back(sample.clone());
        }
        {
            let mut ring = self.by_user_pair.entry(user_key).or_default();
            if ring.len() >= CACHE_HISTORY {
                ring.pop_front();
            }
            ring.push_back(sample.cached_tokens);
        }
        Ok(())
    }

    async fn get_performance(
        &self,
        model_id: &str,
        providers: &[String],
        window: usize,
    ) -> Result<HashMap<String, PerfStats>> {
        let mut result = HashMap::new();
        for provider in providers {
            let key = (model_id.to_string(), provider.clone());
            let stats = match self.by_pair.get(&key) {
                Some(ring) => {
                    // Last `window` samples with a defined throughput.
                    let usable: Vec<&MetricsSample> = ring
                        .iter()
                        .rev()
                        .filter(|s| s.throughput_tokens_s.is_some())
                        .take(window)
                        .collect();
                    let throughput: Vec<f64> =
                        usable.iter().filter_map(|s| s.throughput_tokens_s).collect();
                    let latency: Vec<f64> = usable
                        .iter()
                        .map(|s| {
                            s.time_to_first_chunk_ms.unwrap_or(s.total_duration_ms) as f64
                        })
                        .collect();
                    PerfStats {
                        throughput_median_ts: median(throughput),
                        latency_median_ms: median(latency),
                        sample_count: usable.len(),
                    }
                }
                None => PerfStats::default(),
            };
            result.insert(provider.clone(), stats);
        }
        Ok(result)
    }

    async fn get_cache_history(
        &self,
        user_id: &str,
        model_id: &str,
        providers: &[String],
    ) -> Result<HashMap<String, bool>> {
        let mut result = HashMap::new();
        for provider in providers {
            let key = (user_id.to_string(), model_id.to_string(), provider.clone());
            let hit = self
                .by_user_pair
                .get(&key)
                .map(|ring| ring.iter().any(|cached| *cached > 0))
                .unwrap_or(false);
            result.insert(provider.clone(), hit);
        }
        Ok(result)
    }
}
