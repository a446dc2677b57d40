//! # relay-server
//!
//! OpenAI-compatible HTTP surface for the Relay gateway:
//!
//! - `POST /v1/chat/completions` — JSON or SSE chat completions
//! - `GET /v1/chat/models` — active models aggregated by id
//! - `POST /v1/chat/estimate` — cost preview without execution
//! - `GET /v1/chat/health`, `/health`, `/stats`, `/version` — operational

pub mod auth;
pub mod stats;

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Json, Response, Sse,
        sse::Event as SseEvent,
    },
    routing::{get, post},
};
use futures::stream::Stream;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use relay_adapters::{DefaultAdapterFactory, ProviderCredentials};
use relay_config::RelayConfig;
use relay_config::families::FamiliesDocument;
use relay_core::{HeuristicTokenizer, RelayError, StandardRequest};
use relay_gateway::{
    AdapterEvaluator, Completion, InMemoryMetricsStore, InMemoryWallet, NullNotifier,
    Orchestrator, OrchestratorConfig, StreamEvent, StreamingCompletion, WebhookNotifier,
};
use relay_routing::{FamilyRouter, ModelRegistry, ProviderSelector, StaticModelSource};

use auth::{AuthProvider, ConfigAuthProvider};
use stats::Stats;

/// Shared server state.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<ModelRegistry>,
    pub auth: Arc<dyn AuthProvider>,
    pub stats: Stats,
}

/// Wire the default collaborator set from config: static model source,
/// in-memory wallet and metrics store, webhook or null notifier.
pub async fn build_state(config: &RelayConfig) -> relay_core::Result<Arc<AppState>> {
    let registry = Arc::new(ModelRegistry::new(
        Arc::new(StaticModelSource::new(config.models.clone())),
        Duration::from_secs(config.gateway.model_refresh_secs),
    ));
    registry.refresh().await?;

    let metrics = Arc::new(InMemoryMetricsStore::new());
    let tokenizer = Arc::new(HeuristicTokenizer);

    let mut wallet = InMemoryWallet::new();
    for entry in &config.auth.api_keys {
        wallet = wallet.with_user(entry.user_id.clone(), entry.initial_balance);
    }
    let wallet = Arc::new(wallet);

    let credentials = config
        .providers
        .iter()
        .map(|(name, p)| {
            (
                name.clone(),
                ProviderCredentials {
                    api_key: p.api_key.clone(),
                    base_url: p.base_url.clone(),
                    timeout_secs: p.timeout_secs,
                    extra: p.extra.clone(),
                },
            )
        })
        .collect();
    let factory = Arc::new(DefaultAdapterFactory::new(credentials));

    let family = match &config.gateway.families_path {
        Some(path) => {
            let document = FamiliesDocument::load(path)?;
            let evaluator = Arc::new(AdapterEvaluator::new(
                Arc::clone(&registry),
                factory.clone(),
                metrics.clone(),
            ));
            Some(Arc::new(FamilyRouter::new(document, evaluator)))
        }
        None => None,
    };

    let selector = ProviderSelector::new(
        Arc::clone(&registry),
        metrics.clone(),
        tokenizer.clone(),
        config.gateway.performance_window,
    );

    let notifier: Arc<dyn relay_core::Notifier> = match &config.notifications.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(NullNotifier),
    };

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&registry),
        selector,
        family,
        factory,
        wallet.clone(),
        metrics,
        notifier,
        tokenizer,
        OrchestratorConfig {
            minimal_fund: config.gateway.minimal_fund,
            request_timeout: Duration::from_secs(config.gateway.request_timeout_secs),
            balance_cache_ttl: Duration::from_secs(config.gateway.balance_cache_ttl_secs),
        },
    ));

    let auth = Arc::new(ConfigAuthProvider::new(
        &config.auth,
        wallet,
        Duration::from_secs(config.gateway.auth_cache_ttl_secs),
    ));

    Ok(Arc::new(AppState {
        orchestrator,
        registry,
        auth,
        stats: Stats::new(),
    }))
}

/// Build the Axum router.
pub fn build_router(state: Arc<AppState>, cors: bool) -> Router {
    let mut router = Router::new()
        .route("/v1/chat/completions", post(completions_handler))
        .route("/v1/chat/models", get(models_handler))
        .route("/v1/chat/estimate", post(estimate_handler))
        .route("/v1/chat/health", get(health_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/version", get(version_handler))
        .with_state(state);

    if cors {
        router = router.layer(CorsLayer::permissive());
    }
    router
}

/// Start the HTTP server.
pub async fn start_server(config: RelayConfig) -> relay_core::Result<()> {
    let listen = config.server.listen_addr();
    let cors = config.server.cors;
    let state = build_state(&config).await?;
    let router = build_router(state, cors);

    info!(listen = %listen, "starting gateway server");

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .map_err(|e| RelayError::Config(format!("failed to bind {listen}: {e}")))?;

    axum::serve(listener, router)
        .await
        .map_err(|e| RelayError::Config(format!("server error: {e}")))?;

    Ok(())
}

fn error_response(err: &RelayError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({
        "error": {
            "message": err.to_string(),
            "type": err.kind().as_str(),
        }
    });
    (status, Json(body)).into_response()
}

async fn completions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<StandardRequest>,
) -> Response {
    state.stats.inc_http_requests();

    let mut auth = match state.auth.authenticate(&headers).await {
        Ok(auth) => auth,
        Err(e) => {
            state.stats.inc_http_errors();
            return error_response(&e);
        }
    };
    // Balance flows through the orchestrator's cache (invalidated on debit)
    // rather than the 10-minute auth cache.
    auth.user.balance = state
        .orchestrator
        .user_balance(&auth.user.id)
        .await
        .unwrap_or(0.0);

    match state.orchestrator.chat(&auth, request).await {
        Ok(Completion::Full(response)) => {
            state.stats.inc_completions();
            if let Some(usage) = &response.usage {
                state.stats.add_usage(usage);
            }
            Json(*response).into_response()
        }
        Ok(Completion::Stream(stream)) => {
            state.stats.inc_completions_streamed();
            Sse::new(sse_frames(stream, state.stats.clone())).into_response()
        }
        Err(e) => {
            state.stats.inc_http_errors();
            warn!(error = %e, kind = ?e.kind(), "completion failed");
            error_response(&e)
        }
    }
}

/// Frame the proxied stream as SSE: one `data:` frame per chunk, an error
/// object on terminal failure, and the `[DONE]` sentinel last.
fn sse_frames(
    mut stream: StreamingCompletion,
    stats: Stats,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    async_stream::stream! {
        while let Some(event) = stream.rx.recv().await {
            match event {
                StreamEvent::Chunk(chunk) => {
                    if let Some(usage) = &chunk.usage {
                        stats.add_usage(usage);
                    }
                    let data = serde_json::to_string(&chunk).unwrap_or_default();
                    yield Ok(SseEvent::default().data(data));
                }
                StreamEvent::Error { kind, message } => {
                    let data = serde_json::json!({
                        "error": { "message": message, "type": kind.as_str() }
                    });
                    yield Ok(SseEvent::default().data(data.to_string()));
                    break;
                }
            }
        }
        yield Ok(SseEvent::default().data("[DONE]"));
    }
}

async fn models_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.stats.inc_http_requests();
    state.registry.maybe_refresh().await;

    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for model in state.registry.list_active() {
        grouped.entry(model.model_id).or_default().push(model.provider);
    }

    let data: Vec<serde_json::Value> = grouped
        .into_iter()
        .map(|(id, providers)| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "owned_by": providers.first().cloned().unwrap_or_default(),
                "providers": providers,
            })
        })
        .collect();

    Json(serde_json::json!({ "object": "list", "data": data }))
}

async fn estimate_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<StandardRequest>,
) -> Response {
    state.stats.inc_http_requests();

    let auth = match state.auth.authenticate(&headers).await {
        Ok(auth) => auth,
        Err(e) => {
            state.stats.inc_http_errors();
            return error_response(&e);
        }
    };

    match state.orchestrator.estimate(&auth.user.id, &request).await {
        Ok(estimate) => {
            state.stats.inc_estimates();
            Json(estimate).into_response()
        }
        Err(e) => {
            state.stats.inc_http_errors();
            error_response(&e)
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_models": state.registry.list_active().len(),
    }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.stats.snapshot())
}

async fn version_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
