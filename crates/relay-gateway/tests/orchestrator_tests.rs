use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use relay_adapters::mock::{MockAdapter, MockAdapterFactory};
use relay_config::families::FamiliesDocument;
use relay_core::{
    AdapterKind, AuthData, AuthMethod, CallOutcome, ChatMessage, FinishReason, HeuristicTokenizer,
    MetricsStore, Model, ModelRef, Result, Role, StandardRequest, UserInfo,
};
use relay_gateway::{
    Completion, InMemoryMetricsStore, InMemoryWallet, Orchestrator, OrchestratorConfig,
    StreamEvent, compute_cost,
};
use relay_routing::{ComplexityEvaluator, FamilyRouter, ModelRegistry, ProviderSelector};

struct Harness {
    orchestrator: Orchestrator,
    wallet: Arc<InMemoryWallet>,
    metrics: Arc<InMemoryMetricsStore>,
    factory: Arc<MockAdapterFactory>,
}

fn harness(models: Vec<Model>, family: Option<Arc<FamilyRouter>>) -> Harness {
    harness_with_config(models, family, OrchestratorConfig::default())
}

fn harness_with_config(
    models: Vec<Model>,
    family: Option<Arc<FamilyRouter>>,
    config: OrchestratorConfig,
) -> Harness {
    let registry = Arc::new(ModelRegistry::with_models(models));
    let metrics = Arc::new(InMemoryMetricsStore::new());
    let wallet = Arc::new(InMemoryWallet::new().with_user("u1", 10.0));
    let factory = Arc::new(MockAdapterFactory::new());
    let tokenizer = Arc::new(HeuristicTokenizer);

    let selector = ProviderSelector::new(
        Arc::clone(&registry),
        metrics.clone() as Arc<dyn MetricsStore>,
        tokenizer.clone(),
        10,
    );
    let orchestrator = Orchestrator::new(
        registry,
        selector,
        family,
        factory.clone(),
        wallet.clone(),
        metrics.clone(),
        Arc::new(relay_gateway::NullNotifier),
        tokenizer,
        config,
    );
    Harness {
        orchestrator,
        wallet,
        metrics,
        factory,
    }
}

fn model(model_id: &str, provider: &str, price_in: f64, price_out: f64) -> Model {
    Model {
        model_id: model_id.into(),
        provider: provider.into(),
        adapter: AdapterKind::Openai,
        provider_model_id: model_id.into(),
        context_window: 128_000,
        support_tool_calling: true,
        support_vision: true,
        price_per_input_token: price_in,
        price_per_output_token: price_out,
        price_per_cached_token: None,
        extra_param: Default::default(),
        active: true,
    }
}

fn auth() -> AuthData {
    AuthData {
        user: UserInfo {
            id: "u1".into(),
            balance: 10.0,
            email: None,
        },
        api_key: None,
        method: AuthMethod::ApiKey,
    }
}

fn request(model: &str, text: &str) -> StandardRequest {
    StandardRequest {
        model: ModelRef::Alias(model.into()),
        messages: vec![ChatMessage::text(Role::User, text)],
        stream: false,
        max_tokens: None,
        temperature: None,
        top_p: None,
        frequency_penalty: None,
        presence_penalty: None,
        stop: None,
        user: None,
        tools: vec![],
        tool_choice: None,
        // Cheapest-first keeps two-provider rankings deterministic.
        speed_vs_price: Some(0),
        max_cost_per_token: None,
        providers: None,
    }
}

fn unwrap_full(completion: Completion) -> relay_core::StandardResponse {
    match completion {
        Completion::Full(response) => *response,
        Completion::Stream(_) => panic!("expected a non-streaming completion"),
    }
}

// ── Non-streaming pipeline ─────────────────────────────────────

#[tokio::test]
async fn completion_fills_usage_debits_once_and_records_metrics() {
    let gpt4o = model("gpt-4o", "openai", 2.5e-6, 1e-5);
    let h = harness(vec![gpt4o.clone()], None);
    h.factory
        .insert("openai", MockAdapter::new("openai").with_usage_text("hi!", 100, 50, None));

    let response = unwrap_full(h.orchestrator.chat(&auth(), request("gpt-4o", "hi")).await.unwrap());

    assert_eq!(response.object, "chat.completion");
    let usage = response.usage.clone().unwrap();
    assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);

    let expected_cost = compute_cost(&gpt4o, &usage);
    let transactions = h.wallet.transactions("u1");
    assert_eq!(transactions.len(), 1);
    assert!((transactions[0].amount + expected_cost).abs() < 1e-12);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let sample = h.metrics.last_sample("gpt-4o", "openai").unwrap();
    assert_eq!(sample.attempt_number, 1);
    assert_eq!(sample.success, CallOutcome::Success);
    assert!(!sample.streamed);
}

#[tokio::test]
async fn fallback_on_5xx_serves_from_second_provider() {
    // "cheap" ranks first at speed_vs_price 0 and fails with a 503.
    let h = harness(
        vec![
            model("gpt-4o", "cheap", 1e-6, 4e-6),
            model("gpt-4o", "backup", 5e-6, 2e-5),
        ],
        None,
    );
    h.factory
        .insert("cheap", MockAdapter::new("cheap").with_http_error(503, "overloaded"));
    h.factory
        .insert("backup", MockAdapter::new("backup").with_text("rescued"));

    let response = unwrap_full(h.orchestrator.chat(&auth(), request("gpt-4o", "hi")).await.unwrap());
    assert_eq!(
        response.choices[0].message.content.as_deref(),
        Some("rescued")
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    let success = h.metrics.last_sample("gpt-4o", "backup").unwrap();
    assert_eq!(success.attempt_number, 2);
    assert_eq!(success.success, CallOutcome::Success);
    let failure = h.metrics.last_sample("gpt-4o", "cheap").unwrap();
    assert_eq!(failure.success, CallOutcome::Failure);
    assert_eq!(failure.error_kind, Some(relay_core::ErrorKind::Api));
}

#[tokio::test]
async fn upstream_400_blocks_fallback_and_debits_nothing() {
    let h = harness(
        vec![
            model("gpt-4o", "cheap", 1e-6, 4e-6),
            model("gpt-4o", "backup", 5e-6, 2e-5),
        ],
        None,
    );
    h.factory
        .insert("cheap", MockAdapter::new("cheap").with_http_error(400, "invalid role"));
    let backup = MockAdapter::new("backup").with_text("never sent");
    let backup_requests = backup.recorded_requests();
    h.factory.insert("backup", backup);

    let err = h
        .orchestrator
        .chat(&auth(), request("gpt-4o", "hi"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), relay_core::ErrorKind::Validation);
    assert!(err.to_string().contains("invalid role"));
    assert!(backup_requests.lock().unwrap().is_empty());
    assert!(h.wallet.transactions("u1").is_empty());
}

#[tokio::test]
async fn exhaustion_surfaces_all_providers_failed_with_last_cause() {
    let h = harness(
        vec![
            model("gpt-4o", "cheap", 1e-6, 4e-6),
            model("gpt-4o", "backup", 5e-6, 2e-5),
        ],
        None,
    );
    h.factory
        .insert("cheap", MockAdapter::new("cheap").with_http_error(503, "down"));
    h.factory
        .insert("backup", MockAdapter::new("backup").with_timeout());

    let err = h
        .orchestrator
        .chat(&auth(), request("gpt-4o", "hi"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), relay_core::ErrorKind::AllProvidersFailed);
    assert_eq!(err.status_code(), 502);
    assert!(err.to_string().contains("timed out"));
    assert!(h.wallet.transactions("u1").is_empty());
}

#[tokio::test]
async fn configuration_failure_advances_to_next_provider() {
    let h = harness(
        vec![
            model("gpt-4o", "unconfigured", 1e-6, 4e-6),
            model("gpt-4o", "backup", 5e-6, 2e-5),
        ],
        None,
    );
    // No factory entry for "unconfigured": configure() fails, fallback runs.
    h.factory
        .insert("backup", MockAdapter::new("backup").with_text("served"));

    let response = unwrap_full(h.orchestrator.chat(&auth(), request("gpt-4o", "hi")).await.unwrap());
    assert_eq!(response.choices[0].message.content.as_deref(), Some("served"));
}

#[tokio::test]
async fn balance_below_minimal_fund_is_rejected() {
    let h = harness_with_config(
        vec![model("gpt-4o", "openai", 1e-6, 4e-6)],
        None,
        OrchestratorConfig {
            minimal_fund: 100.0,
            ..Default::default()
        },
    );
    h.factory
        .insert("openai", MockAdapter::new("openai").with_text("unreachable"));

    let err = h
        .orchestrator
        .chat(&auth(), request("gpt-4o", "hi"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), relay_core::ErrorKind::InsufficientFunds);
    assert_eq!(err.status_code(), 402);
}

#[tokio::test]
async fn cache_boost_reorders_the_ranking() {
    // Symmetric pair; history gives "boosted" a recent cache hit, halving its
    // score, so it must win the ranking and serve the request.
    let models = vec![
        model("gpt-4o", "plain", 1e-6, 4e-6),
        model("gpt-4o", "boosted", 10e-6, 2e-5),
    ];
    let h = harness(models, None);
    for _ in 0..2 {
        h.metrics
            .record(relay_core::MetricsSample {
                request_id: "seed".into(),
                user_id: "u1".into(),
                model: "gpt-4o".into(),
                provider: "boosted".into(),
                adapter: AdapterKind::Openai,
                streamed: true,
                prompt_tokens: 100,
                completion_tokens: 50,
                cached_tokens: 40,
                cost: 0.001,
                total_duration_ms: 500,
                time_to_first_chunk_ms: Some(100),
                throughput_tokens_s: Some(100.0),
                attempt_number: 1,
                success: CallOutcome::Success,
                error_kind: None,
            })
            .await
            .unwrap();
    }

    let plain = MockAdapter::new("plain").with_text("from plain");
    let plain_requests = plain.recorded_requests();
    h.factory.insert("plain", plain);
    h.factory
        .insert("boosted", MockAdapter::new("boosted").with_text("from boosted"));

    // Neutral knob so only the boost discriminates.
    let mut req = request("gpt-4o", "hi");
    req.speed_vs_price = Some(50);
    let response = unwrap_full(h.orchestrator.chat(&auth(), req).await.unwrap());
    assert_eq!(
        response.choices[0].message.content.as_deref(),
        Some("from boosted")
    );
    assert!(plain_requests.lock().unwrap().is_empty());
}

// ── Streaming pipeline ─────────────────────────────────────────

#[tokio::test]
async fn streaming_preserves_order_and_debits_final_usage() {
    let gpt4o = model("gpt-4o", "openai", 2.5e-6, 1e-5);
    let h = harness(vec![gpt4o.clone()], None);
    h.factory.insert(
        "openai",
        MockAdapter::new("openai").with_usage_text("streamed reply", 200, 40, None),
    );

    let mut req = request("gpt-4o", "hi");
    req.stream = true;
    let completion = h.orchestrator.chat(&auth(), req).await.unwrap();
    let mut stream = match completion {
        Completion::Stream(s) => s,
        Completion::Full(_) => panic!("expected a stream"),
    };

    let mut text = String::new();
    let mut last_chunk = None;
    while let Some(event) = stream.rx.recv().await {
        match event {
            StreamEvent::Chunk(chunk) => {
                for choice in &chunk.choices {
                    if let Some(t) = &choice.delta.content {
                        text.push_str(t);
                    }
                }
                last_chunk = Some(chunk);
            }
            StreamEvent::Error { .. } => panic!("unexpected stream error"),
        }
    }

    assert_eq!(text, "streamed reply");
    let last = last_chunk.unwrap();
    assert_eq!(last.finish_reason(), Some(FinishReason::Stop));
    let usage = last.usage.unwrap();
    assert_eq!(usage.total_tokens, 240);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let expected_cost = compute_cost(&gpt4o, &usage);
    let transactions = h.wallet.transactions("u1");
    assert_eq!(transactions.len(), 1);
    assert!((transactions[0].amount + expected_cost).abs() < 1e-12);

    let sample = h.metrics.last_sample("gpt-4o", "openai").unwrap();
    assert!(sample.streamed);
    assert_eq!(sample.success, CallOutcome::Success);
    assert!(sample.time_to_first_chunk_ms.is_some());
    assert!(sample.throughput_tokens_s.is_some());
}

#[tokio::test]
async fn client_disconnect_mid_stream_debits_partial_tokens() {
    let h = harness(vec![model("gpt-4o", "openai", 2.5e-6, 1e-5)], None);

    // Enough chunks to overflow the relay's output buffer, so the relay is
    // still mid-stream whenever the client hangs up.
    let mut chunks = Vec::new();
    for i in 0..200 {
        let mut chunk = relay_core::StreamChunk::new(format!("c{i}"), "gpt-4o", 0);
        chunk.choices.push(relay_core::ChunkChoice {
            index: 0,
            delta: relay_core::Delta {
                role: (i == 0).then_some(Role::Assistant),
                content: Some("word ".into()),
                tool_calls: vec![],
            },
            finish_reason: None,
        });
        chunks.push(chunk);
    }
    h.factory.insert(
        "openai",
        MockAdapter::new("openai").with_chunks(chunks),
    );

    let mut req = request("gpt-4o", "hi");
    req.stream = true;
    let completion = h.orchestrator.chat(&auth(), req).await.unwrap();
    let mut stream = match completion {
        Completion::Stream(s) => s,
        Completion::Full(_) => panic!("expected a stream"),
    };

    // Read one frame, then hang up.
    let _ = stream.rx.recv().await;
    drop(stream);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let sample = h.metrics.last_sample("gpt-4o", "openai").unwrap();
    assert_eq!(sample.success, CallOutcome::Partial);
    // Observed tokens were estimated and debited.
    let transactions = h.wallet.transactions("u1");
    assert_eq!(transactions.len(), 1);
    assert!(transactions[0].amount < 0.0);
}

#[tokio::test]
async fn streaming_failure_before_first_chunk_falls_back() {
    let h = harness(
        vec![
            model("gpt-4o", "cheap", 1e-6, 4e-6),
            model("gpt-4o", "backup", 5e-6, 2e-5),
        ],
        None,
    );
    h.factory
        .insert("cheap", MockAdapter::new("cheap").with_http_error(503, "down"));
    h.factory
        .insert("backup", MockAdapter::new("backup").with_text("streamed rescue"));

    let mut req = request("gpt-4o", "hi");
    req.stream = true;
    let completion = h.orchestrator.chat(&auth(), req).await.unwrap();
    let mut stream = match completion {
        Completion::Stream(s) => s,
        Completion::Full(_) => panic!("expected a stream"),
    };

    let mut text = String::new();
    while let Some(StreamEvent::Chunk(chunk)) = stream.rx.recv().await {
        for choice in &chunk.choices {
            if let Some(t) = &choice.delta.content {
                text.push_str(t);
            }
        }
    }
    assert_eq!(text, "streamed rescue");
}

// ── Family routing ─────────────────────────────────────────────

struct FixedEvaluator(u8);

#[async_trait]
impl ComplexityEvaluator for FixedEvaluator {
    async fn score_task(&self, _m: &str, _p: &str, _u: &str, _prompt: &str) -> Result<u8> {
        Ok(self.0)
    }
}

struct HangingEvaluator;

#[async_trait]
impl ComplexityEvaluator for HangingEvaluator {
    async fn score_task(&self, _m: &str, _p: &str, _u: &str, _prompt: &str) -> Result<u8> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(50)
    }
}

fn families() -> FamiliesDocument {
    serde_yaml::from_str(
        r#"
families:
  makehub-sota:
    evaluation_model_id: "gpt-4o-mini"
    evaluation_provider: "openai"
    routing_config:
      score_ranges:
        - min_score: 1
          max_score: 30
          target_model: "google/gemini-2.5-flash-lite-preview"
        - min_score: 31
          max_score: 100
          target_model: "anthropic/claude-4-sonnet"
      fallback_model: "anthropic/claude-4-sonnet"
      fallback_provider: "anthropic"
      evaluation_timeout_ms: 50
"#,
    )
    .unwrap()
}

fn family_models() -> Vec<Model> {
    vec![
        model("google/gemini-2.5-flash-lite-preview", "google", 1e-7, 4e-7),
        model("anthropic/claude-4-sonnet", "anthropic", 3e-6, 1.5e-5),
    ]
}

#[tokio::test]
async fn family_alias_routes_by_evaluator_score() {
    let family = Arc::new(FamilyRouter::new(families(), Arc::new(FixedEvaluator(15))));
    let h = harness(family_models(), Some(family));
    h.factory
        .insert("google", MockAdapter::new("google").with_text("light model reply"));
    h.factory
        .insert("anthropic", MockAdapter::new("anthropic").with_text("heavy model reply"));

    let response = unwrap_full(
        h.orchestrator
            .chat(&auth(), request("makehub-sota/family", "what is 2+2"))
            .await
            .unwrap(),
    );
    assert_eq!(response.model, "google/gemini-2.5-flash-lite-preview");
    assert_eq!(
        response.choices[0].message.content.as_deref(),
        Some("light model reply")
    );
}

#[tokio::test]
async fn family_evaluator_timeout_routes_to_fallback_pair() {
    let family = Arc::new(FamilyRouter::new(families(), Arc::new(HangingEvaluator)));
    let h = harness(family_models(), Some(family));
    h.factory
        .insert("anthropic", MockAdapter::new("anthropic").with_text("fallback reply"));

    let response = unwrap_full(
        h.orchestrator
            .chat(&auth(), request("makehub-sota/family", "anything"))
            .await
            .unwrap(),
    );
    assert_eq!(response.model, "anthropic/claude-4-sonnet");
}

#[tokio::test]
async fn family_target_failing_filters_reranks_the_fallback() {
    // The evaluator's pick lacks tool support; the request carries tools, so
    // the hard filters reject it and the family fallback serves instead.
    let mut models = family_models();
    models[0].support_tool_calling = false;
    let family = Arc::new(FamilyRouter::new(families(), Arc::new(FixedEvaluator(15))));
    let h = harness(models, Some(family));
    h.factory
        .insert("anthropic", MockAdapter::new("anthropic").with_text("tools handled"));

    let mut req = request("makehub-sota/family", "use the tool");
    req.tools = vec![relay_core::ToolSpec {
        kind: "function".into(),
        function: relay_core::FunctionDef {
            name: "get_weather".into(),
            description: None,
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
        },
        cache_control: None,
    }];

    let response = unwrap_full(h.orchestrator.chat(&auth(), req).await.unwrap());
    assert_eq!(response.model, "anthropic/claude-4-sonnet");
}

// ── Estimation ─────────────────────────────────────────────────

#[tokio::test]
async fn estimate_prices_without_executing() {
    let gpt4o = model("gpt-4o", "openai", 2.5e-6, 1e-5);
    let h = harness(vec![gpt4o], None);
    let adapter = MockAdapter::new("openai").with_text("should not run");
    let requests = adapter.recorded_requests();
    h.factory.insert("openai", adapter);

    let mut req = request("gpt-4o", "estimate this prompt please");
    req.max_tokens = Some(500);
    let estimate = h.orchestrator.estimate("u1", &req).await.unwrap();

    assert_eq!(estimate.model, "gpt-4o");
    assert_eq!(estimate.provider, "openai");
    assert_eq!(estimate.assumed_completion_tokens, 500);
    assert!(estimate.estimated_cost > 0.0);
    assert!(requests.lock().unwrap().is_empty());
    assert!(h.wallet.transactions("u1").is_empty());
}
