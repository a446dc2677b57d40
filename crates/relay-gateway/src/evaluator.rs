use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use relay_adapters::AdapterFactory;
use relay_core::{
    CallOutcome, ChatMessage, MetricsSample, MetricsStore, ModelRef, RelayError, Result, Role,
    StandardRequest,
};
use relay_routing::{ComplexityEvaluator, ModelRegistry};

use crate::cost::compute_cost;

/// How much of the user's prompt the evaluator sees.
const PROMPT_EXCERPT_CHARS: usize = 2000;

const RUBRIC: &str = "You grade the complexity of a task for model routing. \
Rate the following task from 1 (trivial lookup or chit-chat) to 100 \
(multi-step reasoning, long synthesis, or intricate code). \
Respond with a single integer between 1 and 100 and nothing else.";

/// Production complexity evaluator: drives the configured evaluator model
/// through a real adapter. The call's cost is recorded against the user via
/// a metrics sample but never surfaced in the response.
pub struct AdapterEvaluator {
    registry: Arc<ModelRegistry>,
    factory: Arc<dyn AdapterFactory>,
    metrics: Arc<dyn MetricsStore>,
}

impl AdapterEvaluator {
    pub fn new(
        registry: Arc<ModelRegistry>,
        factory: Arc<dyn AdapterFactory>,
        metrics: Arc<dyn MetricsStore>,
    ) -> Self {
        Self {
            registry,
            factory,
            metrics,
        }
    }
}

#[async_trait]
impl ComplexityEvaluator for AdapterEvaluator {
    async fn score_task(
        &self,
        model_id: &str,
        provider: &str,
        user_id: &str,
        prompt: &str,
    ) -> Result<u8> {
        let model = self
            .registry
            .lookup_exact(model_id)
            .into_iter()
            .find(|m| m.provider == provider)
            .ok_or_else(|| {
                RelayError::Configuration(format!(
                    "evaluator model {model_id}/{provider} is not registered"
                ))
            })?;

        let adapter = self.factory.configure(&model).await?;
        let excerpt: String = prompt.chars().take(PROMPT_EXCERPT_CHARS).collect();
        let request = StandardRequest {
            model: ModelRef::Alias(model_id.to_string()),
            messages: vec![
                ChatMessage::text(Role::System, RUBRIC),
                ChatMessage::text(Role::User, excerpt),
            ],
            stream: false,
            max_tokens: Some(8),
            temperature: Some(0.0),
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: None,
            user: None,
            tools: vec![],
            tool_choice: None,
            speed_vs_price: None,
            max_cost_per_token: None,
            providers: None,
        };

        let started = Instant::now();
        let response = adapter.execute(&request, &model).await?;

        if let Some(usage) = &response.usage {
            let _ = self
                .metrics
                .record(MetricsSample {
                    request_id: format!("eval_{}", uuid::Uuid::new_v4().simple()),
                    user_id: user_id.to_string(),
                    model: model.model_id.clone(),
                    provider: model.provider.clone(),
                    adapter: model.adapter,
                    streamed: false,
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    cached_tokens: usage.cached_tokens.unwrap_or(0),
                    cost: compute_cost(&model, usage),
                    total_duration_ms: started.elapsed().as_millis() as u64,
                    time_to_first_chunk_ms: None,
                    throughput_tokens_s: None,
                    attempt_number: 1,
                    success: CallOutcome::Success,
                    error_kind: None,
                })
                .await;
        }

        let text = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let score = parse_score(&text)?;
        debug!(model = model_id, score, "evaluator scored task");
        Ok(score)
    }
}

/// Extract the first integer in the text; reject anything outside 1..=100.
fn parse_score(text: &str) -> Result<u8> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let value: u32 = digits
        .parse()
        .map_err(|_| RelayError::Api {
            status: 502,
            message: format!("evaluator returned unparseable score: {text:?}"),
        })?;
    if (1..=100).contains(&value) {
        Ok(value as u8)
    } else {
        Err(RelayError::Api {
            status: 502,
            message: format!("evaluator score out of range: {value}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_embedded_integers() {
        assert_eq!(parse_score("42").unwrap(), 42);
        assert_eq!(parse_score("Score: 15\n").unwrap(), 15);
        assert_eq!(parse_score("100").unwrap(), 100);
    }

    #[test]
    fn rejects_out_of_range_and_garbage() {
        assert!(parse_score("0").is_err());
        assert!(parse_score("250").is_err());
        assert!(parse_score("no number here").is_err());
    }
}
