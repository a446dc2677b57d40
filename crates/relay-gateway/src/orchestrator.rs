use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relay_adapters::{AdapterFactory, AdapterStream};
use relay_core::{
    AuthData, CallOutcome, DebitMeta, ErrorKind, MetricsSample, MetricsStore, ModelRef, Notifier,
    ProviderCombination, RelayError, Result, Severity, StandardRequest, StandardResponse,
    StreamChunk, Tokenizer, TtlCache, Usage, WalletLedger,
};
use relay_routing::{FamilyRouter, ModelRegistry, ProviderSelector, RoutedTarget};

use crate::cost::compute_cost;

/// Buffer between the stream relay and the HTTP writer.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Minimum balance (USD) required to accept a request.
    pub minimal_fund: f64,
    /// Bound on one upstream attempt: a non-streaming execution, or the time
    /// to the first streamed chunk.
    pub request_timeout: Duration,
    pub balance_cache_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            minimal_fund: 0.0,
            request_timeout: Duration::from_secs(30),
            balance_cache_ttl: Duration::from_secs(60),
        }
    }
}

/// One frame of the proxied stream as the server sees it.
pub enum StreamEvent {
    Chunk(StreamChunk),
    /// Terminal: the upstream failed after chunks had been delivered.
    Error { kind: ErrorKind, message: String },
}

#[derive(Debug)]
pub struct StreamingCompletion {
    pub rx: mpsc::Receiver<StreamEvent>,
}

#[derive(Debug)]
pub enum Completion {
    Full(Box<StandardResponse>),
    Stream(StreamingCompletion),
}

#[derive(Debug, Clone, Serialize)]
pub struct CostEstimate {
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u32,
    pub assumed_completion_tokens: u32,
    pub estimated_cost: f64,
}

/// The end-to-end pipeline: resolve → rank → attempt in order → translate →
/// stream → account → debit → record.
pub struct Orchestrator {
    registry: Arc<ModelRegistry>,
    selector: ProviderSelector,
    family: Option<Arc<FamilyRouter>>,
    factory: Arc<dyn AdapterFactory>,
    wallet: Arc<dyn WalletLedger>,
    metrics: Arc<dyn MetricsStore>,
    notifier: Arc<dyn Notifier>,
    tokenizer: Arc<dyn Tokenizer>,
    config: OrchestratorConfig,
    balance_cache: Arc<TtlCache<String, f64>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ModelRegistry>,
        selector: ProviderSelector,
        family: Option<Arc<FamilyRouter>>,
        factory: Arc<dyn AdapterFactory>,
        wallet: Arc<dyn WalletLedger>,
        metrics: Arc<dyn MetricsStore>,
        notifier: Arc<dyn Notifier>,
        tokenizer: Arc<dyn Tokenizer>,
        config: OrchestratorConfig,
    ) -> Self {
        let balance_cache = Arc::new(TtlCache::new(config.balance_cache_ttl));
        Self {
            registry,
            selector,
            family,
            factory,
            wallet,
            metrics,
            notifier,
            tokenizer,
            config,
            balance_cache,
        }
    }

    /// Balance with the read-through cache; invalidated on every debit.
    pub async fn user_balance(&self, user_id: &str) -> Result<f64> {
        if let Some(balance) = self.balance_cache.get(&user_id.to_string()) {
            return Ok(balance);
        }
        let balance = self.wallet.balance(user_id).await?;
        self.balance_cache.insert(user_id.to_string(), balance);
        Ok(balance)
    }

    async fn check_balance(&self, user_id: &str) -> Result<()> {
        let balance = self.user_balance(user_id).await?;
        if balance < self.config.minimal_fund {
            return Err(RelayError::InsufficientFunds {
                balance,
                required: self.config.minimal_fund,
            });
        }
        Ok(())
    }

    /// Expand a family alias (if any) and rank providers. When the
    /// evaluator's pick survives no hard filter, the family's static
    /// fallback pair gets one more ranking pass.
    async fn resolve_and_rank(
        &self,
        user_id: &str,
        request: &mut StandardRequest,
    ) -> Result<Vec<ProviderCombination>> {
        let alias = request.model.id().to_string();
        let mut routed_by_evaluator = false;

        if let Some(family) = &self.family {
            if let Some(target) = family.resolve(user_id, request).await? {
                routed_by_evaluator = !target.from_fallback;
                apply_target(request, &target);
            }
        }

        match self.selector.rank(request, user_id).await {
            Ok(ranking) => Ok(ranking),
            Err(e @ RelayError::NoProviders(_)) if routed_by_evaluator => {
                let family = self.family.as_ref().expect("family routing produced a target");
                let Some(fallback) = family.fallback_target(&alias) else {
                    return Err(e);
                };
                warn!(
                    alias = %alias,
                    target = %request.model.id(),
                    fallback = %fallback.model_id,
                    "family target failed hard filters, ranking fallback"
                );
                apply_target(request, &fallback);
                self.selector.rank(request, user_id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Serve one authenticated chat completion.
    pub async fn chat(&self, auth: &AuthData, mut request: StandardRequest) -> Result<Completion> {
        self.registry.maybe_refresh().await;
        self.check_balance(&auth.user.id).await?;

        let ranking = self.resolve_and_rank(&auth.user.id, &mut request).await?;
        let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
        let prompt_estimate = self.tokenizer.estimate_tokens(&request.messages);

        let mut last_err: Option<RelayError> = None;
        for (i, combo) in ranking.iter().enumerate() {
            let attempt = (i + 1) as u32;

            let adapter = match self.factory.configure(&combo.model).await {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(
                        provider = %combo.model.provider,
                        error = %e,
                        "adapter configuration failed, advancing"
                    );
                    self.note_failure(&e, combo, attempt, &request_id, &auth.user.id, request.stream);
                    last_err = Some(e);
                    continue;
                }
            };

            if let Err(e) = adapter.validate(&request, &combo.model) {
                warn!(
                    provider = %combo.model.provider,
                    error = %e,
                    "request failed adapter validation, advancing"
                );
                self.note_failure(&e, combo, attempt, &request_id, &auth.user.id, request.stream);
                last_err = Some(e);
                continue;
            }

            let started = Instant::now();

            if request.stream {
                let opened = tokio::time::timeout(
                    self.config.request_timeout,
                    adapter.execute_stream(&request, &combo.model),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(RelayError::Timeout {
                        ms: self.config.request_timeout.as_millis() as u64,
                    })
                });

                let stream = match opened {
                    Ok(stream) => stream,
                    Err(e) => {
                        if !e.retryable() {
                            return Err(e);
                        }
                        self.note_failure(&e, combo, attempt, &request_id, &auth.user.id, true);
                        last_err = Some(e);
                        continue;
                    }
                };

                // Retry is only possible before the first chunk reaches the
                // client; peek it here, while fallback is still an option.
                match self.await_first_chunk(stream).await {
                    Ok((first, upstream)) => {
                        info!(
                            provider = %combo.model.provider,
                            model = %combo.model.model_id,
                            attempt,
                            "streaming from upstream"
                        );
                        return Ok(Completion::Stream(self.spawn_stream_relay(
                            first,
                            upstream,
                            combo.clone(),
                            attempt,
                            request_id,
                            auth.user.id.clone(),
                            prompt_estimate,
                            started,
                        )));
                    }
                    Err(e) => {
                        if !e.retryable() {
                            return Err(e);
                        }
                        self.note_failure(&e, combo, attempt, &request_id, &auth.user.id, true);
                        last_err = Some(e);
                        continue;
                    }
                }
            }

            // Non-streaming path.
            let executed = tokio::time::timeout(
                self.config.request_timeout,
                adapter.execute(&request, &combo.model),
            )
            .await
            .unwrap_or_else(|_| {
                Err(RelayError::Timeout {
                    ms: self.config.request_timeout.as_millis() as u64,
                })
            });

            match executed {
                Ok(mut response) => {
                    let usage = ensure_usage(&mut response, prompt_estimate);
                    let cost = compute_cost(&combo.model, &usage);
                    self.debit(&auth.user.id, cost, &request_id, combo).await;

                    let sample = MetricsSample {
                        request_id: request_id.clone(),
                        user_id: auth.user.id.clone(),
                        model: combo.model.model_id.clone(),
                        provider: combo.model.provider.clone(),
                        adapter: combo.model.adapter,
                        streamed: false,
                        prompt_tokens: usage.prompt_tokens,
                        completion_tokens: usage.completion_tokens,
                        cached_tokens: usage.cached_tokens.unwrap_or(0),
                        cost,
                        total_duration_ms: started.elapsed().as_millis() as u64,
                        time_to_first_chunk_ms: None,
                        throughput_tokens_s: None,
                        attempt_number: attempt,
                        success: CallOutcome::Success,
                        error_kind: None,
                    };
                    let metrics = Arc::clone(&self.metrics);
                    tokio::spawn(async move {
                        let _ = metrics.record(sample).await;
                    });

                    info!(
                        provider = %combo.model.provider,
                        model = %combo.model.model_id,
                        attempt,
                        cost,
                        "completion served"
                    );
                    return Ok(Completion::Full(Box::new(response)));
                }
                Err(e) => {
                    if !e.retryable() {
                        return Err(e);
                    }
                    self.note_failure(&e, combo, attempt, &request_id, &auth.user.id, false);
                    last_err = Some(e);
                }
            }
        }

        Err(RelayError::AllProvidersFailed {
            last: Box::new(
                last_err.unwrap_or_else(|| RelayError::NoProviders(request.model.id().to_string())),
            ),
        })
    }

    /// Estimated cost of serving a request, without executing it.
    pub async fn estimate(
        &self,
        user_id: &str,
        request: &StandardRequest,
    ) -> Result<CostEstimate> {
        let mut request = request.clone();
        let ranking = self.resolve_and_rank(user_id, &mut request).await?;
        let best = &ranking[0];
        let prompt_tokens = self.tokenizer.estimate_tokens(&request.messages);
        let assumed_completion_tokens = request.max_tokens.unwrap_or(1024);
        let usage = Usage::new(prompt_tokens, assumed_completion_tokens, None);
        Ok(CostEstimate {
            model: best.model.model_id.clone(),
            provider: best.model.provider.clone(),
            prompt_tokens,
            assumed_completion_tokens,
            estimated_cost: compute_cost(&best.model, &usage),
        })
    }

    async fn await_first_chunk(
        &self,
        mut stream: AdapterStream,
    ) -> Result<(StreamChunk, AdapterStream)> {
        match tokio::time::timeout(self.config.request_timeout, stream.rx.recv()).await {
            Err(_) => Err(RelayError::Timeout {
                ms: self.config.request_timeout.as_millis() as u64,
            }),
            Ok(None) => Err(RelayError::Api {
                status: 502,
                message: "upstream stream ended before any chunk".into(),
            }),
            Ok(Some(Err(e))) => Err(e),
            Ok(Some(Ok(chunk))) => Ok((chunk, stream)),
        }
    }

    /// Pipe translated chunks to the client as they arrive; on completion
    /// (or disconnect) compute stream metrics, debit observed tokens, and
    /// record the sample. Never buffers the stream.
    #[allow(clippy::too_many_arguments)]
    fn spawn_stream_relay(
        &self,
        first: StreamChunk,
        mut upstream: AdapterStream,
        combo: ProviderCombination,
        attempt: u32,
        request_id: String,
        user_id: String,
        prompt_estimate: u32,
        started: Instant,
    ) -> StreamingCompletion {
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let wallet = Arc::clone(&self.wallet);
        let metrics = Arc::clone(&self.metrics);
        let notifier = Arc::clone(&self.notifier);
        let balance_cache = Arc::clone(&self.balance_cache);
        let first_chunk_at = Instant::now();

        tokio::spawn(async move {
            let model = combo.model;
            let mut usage: Option<Usage> = None;
            let mut content_chars = 0usize;
            let mut outcome = CallOutcome::Success;
            let mut error_kind: Option<ErrorKind> = None;

            track_chunk(&first, &mut usage, &mut content_chars);
            if tx.send(StreamEvent::Chunk(first)).await.is_err() {
                outcome = CallOutcome::Partial;
            } else {
                loop {
                    match upstream.rx.recv().await {
                        Some(Ok(chunk)) => {
                            track_chunk(&chunk, &mut usage, &mut content_chars);
                            if tx.send(StreamEvent::Chunk(chunk)).await.is_err() {
                                // Client disconnect: cancel upstream by
                                // dropping the receiver, keep what we saw.
                                outcome = CallOutcome::Partial;
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            // Past the first chunk there is no retry; close
                            // the stream with a terminal error frame.
                            outcome = CallOutcome::Failure;
                            error_kind = Some(e.kind());
                            if should_notify(&e) {
                                notifier
                                    .notify(Severity::Warning, &format!("upstream stream failed: {e}"))
                                    .await;
                            }
                            let _ = tx
                                .send(StreamEvent::Error {
                                    kind: e.kind(),
                                    message: e.to_string(),
                                })
                                .await;
                            break;
                        }
                        None => break,
                    }
                }
            }

            let total = started.elapsed();
            let time_to_first_chunk = first_chunk_at.duration_since(started);
            // Usage comes from the final chunk when upstream supplies it;
            // otherwise estimate from what was actually delivered.
            let usage = usage.unwrap_or_else(|| {
                Usage::new(prompt_estimate, (content_chars / 4) as u32, None)
            });
            let stream_secs = total
                .saturating_sub(time_to_first_chunk)
                .as_secs_f64()
                .max(0.001);
            let throughput = f64::from(usage.completion_tokens) / stream_secs;
            let cost = compute_cost(&model, &usage);

            if outcome != CallOutcome::Failure && cost > 0.0 {
                let meta = DebitMeta {
                    request_id: request_id.clone(),
                    model: model.model_id.clone(),
                    provider: model.provider.clone(),
                };
                if let Err(e) = wallet.debit(&user_id, cost, meta).await {
                    warn!(error = %e, request_id = %request_id, "wallet debit failed after stream");
                }
                balance_cache.invalidate(&user_id);
            }

            let sample = MetricsSample {
                request_id,
                user_id,
                model: model.model_id.clone(),
                provider: model.provider.clone(),
                adapter: model.adapter,
                streamed: true,
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                cached_tokens: usage.cached_tokens.unwrap_or(0),
                cost,
                total_duration_ms: total.as_millis() as u64,
                time_to_first_chunk_ms: Some(time_to_first_chunk.as_millis() as u64),
                throughput_tokens_s: Some(throughput),
                attempt_number: attempt,
                success: outcome,
                error_kind,
            };
            let _ = metrics.record(sample).await;
        });

        StreamingCompletion { rx }
    }

    async fn debit(&self, user_id: &str, cost: f64, request_id: &str, combo: &ProviderCombination) {
        if cost <= 0.0 {
            return;
        }
        let meta = DebitMeta {
            request_id: request_id.to_string(),
            model: combo.model.model_id.clone(),
            provider: combo.model.provider.clone(),
        };
        // The response was already produced; a ledger failure is logged, not
        // surfaced.
        if let Err(e) = self.wallet.debit(user_id, cost, meta).await {
            warn!(error = %e, request_id = %request_id, "wallet debit failed");
        }
        self.balance_cache.invalidate(&user_id.to_string());
    }

    fn note_failure(
        &self,
        error: &RelayError,
        combo: &ProviderCombination,
        attempt: u32,
        request_id: &str,
        user_id: &str,
        streamed: bool,
    ) {
        if should_notify(error) {
            let notifier = Arc::clone(&self.notifier);
            let message = format!(
                "upstream {}/{} failed (attempt {attempt}): {error}",
                combo.model.provider, combo.model.model_id
            );
            tokio::spawn(async move {
                notifier.notify(Severity::Warning, &message).await;
            });
        }

        let sample = MetricsSample {
            request_id: request_id.to_string(),
            user_id: user_id.to_string(),
            model: combo.model.model_id.clone(),
            provider: combo.model.provider.clone(),
            adapter: combo.model.adapter,
            streamed,
            prompt_tokens: 0,
            completion_tokens: 0,
            cached_tokens: 0,
            cost: 0.0,
            total_duration_ms: 0,
            time_to_first_chunk_ms: None,
            throughput_tokens_s: None,
            attempt_number: attempt,
            success: CallOutcome::Failure,
            error_kind: Some(error.kind()),
        };
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            let _ = metrics.record(sample).await;
        });
        debug!(kind = ?error.kind(), attempt, "recorded failed attempt");
    }
}

fn apply_target(request: &mut StandardRequest, target: &RoutedTarget) {
    request.model = ModelRef::Alias(target.model_id.clone());
    if let Some(provider) = &target.provider {
        request.providers = Some(vec![provider.clone()]);
    }
}

fn track_chunk(chunk: &StreamChunk, usage: &mut Option<Usage>, content_chars: &mut usize) {
    if let Some(u) = &chunk.usage {
        *usage = Some(u.clone());
    }
    for choice in &chunk.choices {
        if let Some(text) = &choice.delta.content {
            *content_chars += text.len();
        }
    }
}

/// Upstream 5xx and timeouts page the notification channel; everything else
/// just logs.
fn should_notify(error: &RelayError) -> bool {
    match error {
        RelayError::Timeout { .. } => true,
        RelayError::Api { status, .. } => *status >= 500,
        _ => false,
    }
}

/// Make sure a response carries usage; estimate it when upstream omitted it.
fn ensure_usage(response: &mut StandardResponse, prompt_estimate: u32) -> Usage {
    if let Some(usage) = &response.usage {
        return usage.clone();
    }
    let content_chars: usize = response
        .choices
        .iter()
        .filter_map(|c| c.message.content.as_ref())
        .map(|c| c.len())
        .sum();
    let usage = Usage::new(prompt_estimate, (content_chars / 4) as u32, None);
    response.usage = Some(usage.clone());
    usage
}
