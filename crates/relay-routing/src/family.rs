use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use relay_config::families::{FAMILY_SUFFIX, FamiliesDocument};
use relay_core::{RelayError, Result, StandardRequest, TtlCache};

/// How much of the last user message feeds the decision fingerprint.
const FINGERPRINT_PREFIX_CHARS: usize = 512;

/// Scores task complexity 1..=100 by consulting an evaluator model. The
/// production implementation drives a configured adapter and books the
/// call's cost against `user_id`; tests stub it.
#[async_trait]
pub trait ComplexityEvaluator: Send + Sync {
    async fn score_task(
        &self,
        model_id: &str,
        provider: &str,
        user_id: &str,
        prompt: &str,
    ) -> Result<u8>;
}

/// A concrete model chosen for a family alias.
#[derive(Debug, Clone)]
pub struct RoutedTarget {
    pub model_id: String,
    /// Pinned provider; `None` lets the selector choose among providers.
    pub provider: Option<String>,
    pub reason: Option<String>,
    pub from_fallback: bool,
}

/// Expands `<ns>/family` aliases into concrete models via an
/// evaluator-scored routing table, with per-user decision caching.
pub struct FamilyRouter {
    document: FamiliesDocument,
    evaluator: Arc<dyn ComplexityEvaluator>,
    decisions: TtlCache<(String, String, String), RoutedTarget>,
    families_per_user: DashMap<String, std::collections::HashSet<String>>,
}

impl FamilyRouter {
    pub fn new(document: FamiliesDocument, evaluator: Arc<dyn ComplexityEvaluator>) -> Self {
        let default_ttl =
            Duration::from_secs(document.settings.default_cache_duration_minutes * 60);
        Self {
            document,
            evaluator,
            decisions: TtlCache::new(default_ttl),
            families_per_user: DashMap::new(),
        }
    }

    pub fn is_family(model_id: &str) -> bool {
        model_id.ends_with(FAMILY_SUFFIX)
    }

    /// The family's static fallback pair, used when the evaluator's pick
    /// fails the selector's hard filters downstream.
    pub fn fallback_target(&self, alias: &str) -> Option<RoutedTarget> {
        let (_, family) = self.document.by_alias(alias)?;
        Some(RoutedTarget {
            model_id: family.routing_config.fallback_model.clone(),
            provider: Some(family.routing_config.fallback_provider.clone()),
            reason: None,
            from_fallback: true,
        })
    }

    /// Resolve the request's model. `Ok(None)` means it is not a family
    /// alias and should be used as-is.
    pub async fn resolve(
        &self,
        user_id: &str,
        request: &StandardRequest,
    ) -> Result<Option<RoutedTarget>> {
        let alias = request.model.id();
        if !Self::is_family(alias) {
            return Ok(None);
        }

        let Some((family_id, family)) = self.document.by_alias(alias) else {
            return Err(RelayError::Validation(format!(
                "unknown model family: {alias}"
            )));
        };

        self.check_family_quota(user_id, family_id)?;

        let fingerprint = fingerprint(&request.last_user_text());
        let key = (
            user_id.to_string(),
            family_id.to_string(),
            fingerprint.clone(),
        );
        if let Some(cached) = self.decisions.get(&key) {
            debug!(family = family_id, target = %cached.model_id, "family decision cache hit");
            return Ok(Some(cached));
        }

        let rc = &family.routing_config;
        let timeout = Duration::from_millis(rc.evaluation_timeout_ms);
        let prompt = request.last_user_text();

        let target = match tokio::time::timeout(
            timeout,
            self.evaluator.score_task(
                &family.evaluation_model_id,
                &family.evaluation_provider,
                user_id,
                &prompt,
            ),
        )
        .await
        {
            Ok(Ok(score)) => {
                let score = score.clamp(1, 100);
                match rc.target_for_score(score) {
                    Some(range) => {
                        info!(
                            family = family_id,
                            score,
                            target = %range.target_model,
                            "family routed by evaluator"
                        );
                        RoutedTarget {
                            model_id: range.target_model.clone(),
                            provider: None,
                            reason: range.reason.clone(),
                            from_fallback: false,
                        }
                    }
                    None => self.fallback(family_id, alias, "score outside all ranges")?,
                }
            }
            Ok(Err(e)) => self.fallback(family_id, alias, &format!("evaluator failed: {e}"))?,
            Err(_) => self.fallback(family_id, alias, "evaluator timed out")?,
        };

        let ttl_minutes = rc
            .cache_duration_minutes
            .unwrap_or(self.document.settings.default_cache_duration_minutes);
        self.decisions
            .insert_with_ttl(key, target.clone(), Duration::from_secs(ttl_minutes * 60));

        Ok(Some(target))
    }

    fn fallback(&self, family_id: &str, alias: &str, why: &str) -> Result<RoutedTarget> {
        if !self.document.settings.enable_fallback_routing {
            return Err(RelayError::Api {
                status: 502,
                message: format!("family {family_id}: {why} and fallback routing is disabled"),
            });
        }
        warn!(family = family_id, why, "family routing fell back");
        self.fallback_target(alias).ok_or_else(|| {
            RelayError::Validation(format!("unknown model family: {alias}"))
        })
    }

    fn check_family_quota(&self, user_id: &str, family_id: &str) -> Result<()> {
        let max = self.document.settings.max_families_per_user;
        let mut used = self
            .families_per_user
            .entry(user_id.to_string())
            .or_default();
        if !used.contains(family_id) && used.len() >= max {
            return Err(RelayError::Validation(format!(
                "family limit reached ({max} per user)"
            )));
        }
        used.insert(family_id.to_string());
        Ok(())
    }
}

/// Stable fingerprint of the routing-relevant prompt prefix.
fn fingerprint(text: &str) -> String {
    let prefix: String = text.chars().take(FINGERPRINT_PREFIX_CHARS).collect();
    blake3::hash(prefix.as_bytes()).to_hex()[..16].to_string()
}
