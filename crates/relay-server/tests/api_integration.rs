//! HTTP API integration tests — exercise the gateway surface with mock
//! adapters behind the real orchestrator.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use std::sync::Arc;
use std::time::Duration;

use relay_adapters::mock::{MockAdapter, MockAdapterFactory};
use relay_config::schema::{ApiKeyEntry, AuthConfig};
use relay_core::{AdapterKind, HeuristicTokenizer, Model};
use relay_gateway::{
    InMemoryMetricsStore, InMemoryWallet, NullNotifier, Orchestrator, OrchestratorConfig,
};
use relay_routing::{ModelRegistry, ProviderSelector};
use relay_server::auth::ConfigAuthProvider;
use relay_server::stats::Stats;
use relay_server::{AppState, build_router};

const TEST_KEY: &str = "sk_test_key";

fn model(model_id: &str, provider: &str) -> Model {
    Model {
        model_id: model_id.into(),
        provider: provider.into(),
        adapter: AdapterKind::Openai,
        provider_model_id: model_id.into(),
        context_window: 128_000,
        support_tool_calling: true,
        support_vision: true,
        price_per_input_token: 2.5e-6,
        price_per_output_token: 1e-5,
        price_per_cached_token: None,
        extra_param: Default::default(),
        active: true,
    }
}

/// Build a router whose single "openai" provider answers from a mock.
fn setup(adapter: MockAdapter) -> axum::Router {
    let registry = Arc::new(ModelRegistry::with_models(vec![model("gpt-4o", "openai")]));
    let metrics = Arc::new(InMemoryMetricsStore::new());
    let wallet = Arc::new(InMemoryWallet::new().with_user("u1", 10.0));
    let tokenizer = Arc::new(HeuristicTokenizer);

    let factory = Arc::new(MockAdapterFactory::new());
    factory.insert("openai", adapter);

    let selector = ProviderSelector::new(Arc::clone(&registry), metrics.clone(), tokenizer.clone(), 10);
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&registry),
        selector,
        None,
        factory,
        wallet.clone(),
        metrics,
        Arc::new(NullNotifier),
        tokenizer,
        OrchestratorConfig::default(),
    ));

    let auth_config = AuthConfig {
        jwt_secret: Some("test-secret".into()),
        api_keys: vec![ApiKeyEntry {
            key: TEST_KEY.into(),
            user_id: "u1".into(),
            name: "test".into(),
            email: None,
            initial_balance: 10.0,
        }],
    };
    let auth = Arc::new(ConfigAuthProvider::new(
        &auth_config,
        wallet,
        Duration::from_secs(600),
    ));

    let state = Arc::new(AppState {
        orchestrator,
        registry,
        auth,
        stats: Stats::new(),
    });
    build_router(state, false)
}

fn chat_body(stream: bool) -> String {
    serde_json::json!({
        "model": "gpt-4o",
        "messages": [{ "role": "user", "content": "hi" }],
        "stream": stream,
    })
    .to_string()
}

async fn body_string(resp: axum::response::Response) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// ── Operational endpoints ──────────────────────────────────────

#[tokio::test]
async fn health_reports_ok_and_model_count() {
    let app = setup(MockAdapter::new("openai"));
    let resp = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["active_models"], 1);
}

#[tokio::test]
async fn version_names_the_gateway() {
    let app = setup(MockAdapter::new("openai"));
    let resp = app
        .oneshot(Request::get("/version").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(json["name"], "relay");
}

#[tokio::test]
async fn models_are_aggregated_by_id() {
    let app = setup(MockAdapter::new("openai"));
    let resp = app
        .oneshot(Request::get("/v1/chat/models").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(json["object"], "list");
    assert_eq!(json["data"][0]["id"], "gpt-4o");
    assert_eq!(json["data"][0]["providers"][0], "openai");
}

// ── Authentication ─────────────────────────────────────────────

#[tokio::test]
async fn missing_credentials_is_401() {
    let app = setup(MockAdapter::new("openai"));
    let resp = app
        .oneshot(
            Request::post("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(chat_body(false)))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(json["error"]["type"], "AUTHENTICATION_ERROR");
}

#[tokio::test]
async fn api_key_header_authenticates() {
    let app = setup(MockAdapter::new("openai").with_text("hello there"));
    let resp = app
        .oneshot(
            Request::post("/v1/chat/completions")
                .header("content-type", "application/json")
                .header("x-api-key", TEST_KEY)
                .body(Body::from(chat_body(false)))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(json["object"], "chat.completion");
    assert_eq!(json["choices"][0]["message"]["content"], "hello there");
    assert_eq!(
        json["usage"]["total_tokens"],
        json["usage"]["prompt_tokens"].as_u64().unwrap()
            + json["usage"]["completion_tokens"].as_u64().unwrap()
    );
}

#[tokio::test]
async fn bearer_jwt_authenticates() {
    use jsonwebtoken::{Algorithm, EncodingKey, Header};

    #[derive(serde::Serialize)]
    struct Claims {
        sub: String,
        exp: usize,
    }
    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &Claims {
            sub: "u1".into(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        },
        &EncodingKey::from_secret(b"test-secret"),
    )
    .unwrap();

    let app = setup(MockAdapter::new("openai").with_text("jwt ok"));
    let resp = app
        .oneshot(
            Request::post("/v1/chat/completions")
                .header("content-type", "application/json")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::from(chat_body(false)))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
}

// ── Completions ────────────────────────────────────────────────

#[tokio::test]
async fn unknown_model_is_400_no_providers() {
    let app = setup(MockAdapter::new("openai"));
    let body = serde_json::json!({
        "model": "made-up-model",
        "messages": [{ "role": "user", "content": "hi" }],
    });
    let resp = app
        .oneshot(
            Request::post("/v1/chat/completions")
                .header("content-type", "application/json")
                .header("x-api-key", TEST_KEY)
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(json["error"]["type"], "NO_PROVIDERS");
}

#[tokio::test]
async fn streaming_response_is_sse_with_done_sentinel() {
    let app = setup(MockAdapter::new("openai").with_text("streamed text"));
    let resp = app
        .oneshot(
            Request::post("/v1/chat/completions")
                .header("content-type", "application/json")
                .header("x-api-key", TEST_KEY)
                .body(Body::from(chat_body(true)))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let body = body_string(resp).await;
    assert!(body.contains("chat.completion.chunk"));
    assert!(body.contains("streamed text"));
    assert!(body.trim_end().ends_with("data: [DONE]"));

    // Frames arrive in upstream order: role first, then content, then the
    // finishing chunk.
    let role_pos = body.find("assistant").unwrap();
    let text_pos = body.find("streamed text").unwrap();
    let finish_pos = body.find("\"finish_reason\":\"stop\"").unwrap();
    assert!(role_pos < text_pos && text_pos < finish_pos);
}

#[tokio::test]
async fn estimate_returns_cost_preview() {
    let app = setup(MockAdapter::new("openai").with_text("not executed"));
    let resp = app
        .oneshot(
            Request::post("/v1/chat/estimate")
                .header("content-type", "application/json")
                .header("x-api-key", TEST_KEY)
                .body(Body::from(chat_body(false)))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(json["model"], "gpt-4o");
    assert_eq!(json["provider"], "openai");
    assert!(json["estimated_cost"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn stats_counts_requests() {
    let app = setup(MockAdapter::new("openai").with_text("counted"));

    let _ = app
        .clone()
        .oneshot(
            Request::post("/v1/chat/completions")
                .header("content-type", "application/json")
                .header("x-api-key", TEST_KEY)
                .body(Body::from(chat_body(false)))
                .unwrap(),
        )
        .await
        .unwrap();

    let resp = app
        .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(json["completions_total"], 1);
    assert_eq!(json["http_requests_total"], 1);
    assert!(json["prompt_tokens_total"].as_u64().unwrap() > 0);
}
