use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use relay_core::{
    MetricsStore, Model, ProviderCombination, RelayError, Result, StandardRequest, Tokenizer,
};

use crate::registry::ModelRegistry;

pub const DEFAULT_SPEED_VS_PRICE: u8 = 50;

/// Axis value assigned when an axis cannot discriminate: every defined value
/// equal, or no samples at all. It contributes the same amount to every
/// candidate's distance.
const NEUTRAL_AXIS: f64 = 0.5;

/// Ranks the provider combinations able to serve a request.
///
/// Hard filters first (capability, context window, caller constraints), then
/// a 3-D distance score against the optimal point derived from the
/// `speed_vs_price` knob, halved for providers where the user recently hit
/// the prompt cache. Lower scores rank first.
pub struct ProviderSelector {
    registry: Arc<ModelRegistry>,
    metrics: Arc<dyn MetricsStore>,
    tokenizer: Arc<dyn Tokenizer>,
    performance_window: usize,
}

impl ProviderSelector {
    pub fn new(
        registry: Arc<ModelRegistry>,
        metrics: Arc<dyn MetricsStore>,
        tokenizer: Arc<dyn Tokenizer>,
        performance_window: usize,
    ) -> Self {
        Self {
            registry,
            metrics,
            tokenizer,
            performance_window,
        }
    }

    pub async fn rank(
        &self,
        request: &StandardRequest,
        user_id: &str,
    ) -> Result<Vec<ProviderCombination>> {
        let requested = request.model.id();
        let candidates = self.filter(request, requested)?;

        let model_id = candidates[0].model_id.clone();
        let providers: Vec<String> = candidates.iter().map(|m| m.provider.clone()).collect();

        // One round-trip each, independent of candidate count.
        let perf = self
            .metrics
            .get_performance(&model_id, &providers, self.performance_window)
            .await?;
        let cache_history = self
            .metrics
            .get_cache_history(user_id, &model_id, &providers)
            .await?;

        let mut combos = build_combinations(candidates, &perf, &cache_history);

        // A single survivor makes min-max normalization degenerate; skip the
        // scoring and hand it back directly.
        if combos.len() == 1 {
            return Ok(combos);
        }

        let speed_vs_price = request.speed_vs_price.unwrap_or(DEFAULT_SPEED_VS_PRICE).min(100);
        score_combinations(&mut combos, speed_vs_price);
        combos.sort_by(|a, b| {
            a.distance_score
                .partial_cmp(&b.distance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for combo in &combos {
            debug!(
                model = %combo.model.model_id,
                provider = %combo.model.provider,
                price_sum = combo.price_sum,
                throughput = ?combo.throughput_median_ts,
                latency = ?combo.latency_median_ms,
                cache_boost = combo.caching_boost,
                score = combo.distance_score,
                "ranked provider combination"
            );
        }

        Ok(combos)
    }

    /// Apply the hard filters. Survivors are returned in registry order,
    /// which is what the stable sort preserves on score ties.
    fn filter(&self, request: &StandardRequest, requested: &str) -> Result<Vec<Model>> {
        let mut candidates = self.registry.lookup_exact(requested);

        if request.has_tools() {
            candidates.retain(|m| m.support_tool_calling);
        }
        if request.has_images() {
            candidates.retain(|m| m.support_vision);
        }

        let estimated_tokens = self.tokenizer.estimate_tokens(&request.messages);
        candidates.retain(|m| estimated_tokens <= m.context_window);

        if let Some(max_cost) = request.max_cost_per_token {
            candidates.retain(|m| m.price_sum() <= max_cost);
        }
        if let Some(allowed) = &request.providers {
            candidates.retain(|m| allowed.iter().any(|p| p == &m.provider));
        }

        if candidates.is_empty() {
            return Err(RelayError::NoProviders(requested.to_string()));
        }
        Ok(candidates)
    }
}

fn build_combinations(
    candidates: Vec<Model>,
    perf: &HashMap<String, relay_core::PerfStats>,
    cache_history: &HashMap<String, bool>,
) -> Vec<ProviderCombination> {
    candidates
        .into_iter()
        .map(|model| {
            let stats = perf.get(&model.provider);
            ProviderCombination {
                price_sum: model.price_sum(),
                throughput_median_ts: stats.and_then(|s| s.throughput_median_ts),
                latency_median_ms: stats.and_then(|s| s.latency_median_ms),
                caching_boost: cache_history.get(&model.provider).copied().unwrap_or(false),
                distance_score: 0.0,
                model,
            }
        })
        .collect()
}

/// Score each combination as the euclidean distance from its normalized
/// `(price, throughput, latency)` point to the optimum `(1-r, r, r)`.
fn score_combinations(combos: &mut [ProviderCombination], speed_vs_price: u8) {
    let r = f64::from(speed_vs_price) / 100.0;
    let optimal = (1.0 - r, r, r);

    // Price axis is oriented as cheapness (1.0 is cheapest) so that r = 0
    // pulls the optimum toward the cheapest provider and r = 100 toward the
    // fastest, matching the knob's meaning.
    let price_axis: Vec<f64> = normalize_axis(
        &combos
            .iter()
            .map(|c| Some(c.price_sum))
            .collect::<Vec<_>>(),
    )
    .into_iter()
    .map(|v| 1.0 - v)
    .collect();
    let throughput_axis = normalize_axis(
        &combos
            .iter()
            .map(|c| c.throughput_median_ts)
            .collect::<Vec<_>>(),
    );
    // Latency axis is inverted: 1.0 is fastest.
    let latency_axis: Vec<f64> = normalize_axis(
        &combos
            .iter()
            .map(|c| c.latency_median_ms)
            .collect::<Vec<_>>(),
    )
    .into_iter()
    .map(|v| 1.0 - v)
    .collect();

    for (i, combo) in combos.iter_mut().enumerate() {
        let point = (price_axis[i], throughput_axis[i], latency_axis[i]);
        let distance = ((point.0 - optimal.0).powi(2)
            + (point.1 - optimal.1).powi(2)
            + (point.2 - optimal.2).powi(2))
        .sqrt();
        let boost = if combo.caching_boost { 0.5 } else { 1.0 };
        combo.distance_score = distance * boost;
    }
}

/// Min-max normalize, substituting the set's median for missing values
/// before normalization. Degenerate axes collapse to [`NEUTRAL_AXIS`].
fn normalize_axis(values: &[Option<f64>]) -> Vec<f64> {
    let defined: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    let Some(median) = median(&defined) else {
        return vec![NEUTRAL_AXIS; values.len()];
    };

    let filled: Vec<f64> = values.iter().map(|v| v.unwrap_or(median)).collect();
    let min = filled.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = filled.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if (max - min).abs() < f64::EPSILON {
        return vec![NEUTRAL_AXIS; values.len()];
    }
    filled.iter().map(|v| (v - min) / (max - min)).collect()
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_even_and_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn normalize_fills_missing_with_median() {
        let axis = normalize_axis(&[Some(10.0), None, Some(20.0), Some(30.0)]);
        // Median of defined values is 20; the missing slot normalizes to the
        // same position as the explicit 20.
        assert_eq!(axis[1], axis[2]);
        assert_eq!(axis[0], 0.0);
        assert_eq!(axis[3], 1.0);
    }

    #[test]
    fn degenerate_axis_is_neutral() {
        assert_eq!(normalize_axis(&[Some(5.0), Some(5.0)]), vec![0.5, 0.5]);
        assert_eq!(normalize_axis(&[None, None]), vec![0.5, 0.5]);
    }
}
