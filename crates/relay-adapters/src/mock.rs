//! Mock adapter for deterministic testing.
//!
//! Returns pre-queued outcomes without making any HTTP calls and records
//! every request it receives for assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use relay_core::{
    AdapterKind, ChunkChoice, Delta, FinishReason, Model, RelayError, ResponseMessage, Result,
    Role, StandardRequest, StandardResponse, StreamChunk, Usage,
};

use crate::adapter::{AdapterFactory, AdapterStream, ProtocolAdapter};

/// A queued outcome for the next call.
#[derive(Clone)]
pub enum MockOutcome {
    Response(StandardResponse),
    Chunks(Vec<StreamChunk>),
    Fail(MockFailure),
}

#[derive(Clone)]
pub enum MockFailure {
    Http(u16, String),
    Timeout,
    Network(String),
}

impl MockFailure {
    fn to_error(&self) -> RelayError {
        match self {
            MockFailure::Http(status, message) => {
                RelayError::from_upstream_status(*status, message.clone())
            }
            MockFailure::Timeout => RelayError::Timeout { ms: 30_000 },
            MockFailure::Network(message) => RelayError::Network(message.clone()),
        }
    }
}

/// A mock protocol adapter with a FIFO of outcomes.
#[derive(Clone)]
pub struct MockAdapter {
    provider: String,
    outcomes: Arc<Mutex<VecDeque<MockOutcome>>>,
    requests: Arc<Mutex<Vec<StandardRequest>>>,
}

impl MockAdapter {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            outcomes: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a text response with default usage (100 prompt / 50 completion).
    pub fn with_text(self, text: &str) -> Self {
        self.with_response(Self::text_response(text, 100, 50, None));
        self
    }

    /// Queue a text response with explicit token counts.
    pub fn with_usage_text(
        self,
        text: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
        cached_tokens: Option<u32>,
    ) -> Self {
        self.with_response(Self::text_response(
            text,
            prompt_tokens,
            completion_tokens,
            cached_tokens,
        ));
        self
    }

    pub fn with_http_error(self, status: u16, message: &str) -> Self {
        self.queue(MockOutcome::Fail(MockFailure::Http(
            status,
            message.to_string(),
        )));
        self
    }

    pub fn with_timeout(self) -> Self {
        self.queue(MockOutcome::Fail(MockFailure::Timeout));
        self
    }

    pub fn with_chunks(self, chunks: Vec<StreamChunk>) -> Self {
        self.queue(MockOutcome::Chunks(chunks));
        self
    }

    pub fn queue(&self, outcome: MockOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    fn with_response(&self, response: StandardResponse) {
        self.queue(MockOutcome::Response(response));
    }

    /// Handle for asserting on the requests this adapter saw.
    pub fn recorded_requests(&self) -> Arc<Mutex<Vec<StandardRequest>>> {
        Arc::clone(&self.requests)
    }

    fn text_response(
        text: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
        cached_tokens: Option<u32>,
    ) -> StandardResponse {
        let mut response = StandardResponse::new("mock-model");
        response.choices.push(relay_core::Choice {
            index: 0,
            message: ResponseMessage {
                role: Role::Assistant,
                content: Some(text.to_string()),
                tool_calls: vec![],
            },
            finish_reason: Some(FinishReason::Stop),
        });
        response.usage = Some(Usage::new(prompt_tokens, completion_tokens, cached_tokens));
        response
    }

    fn pop(&self) -> MockOutcome {
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MockOutcome::Response(Self::text_response("ok", 100, 50, None)))
    }

    /// Render a full response as the chunk sequence a streaming call would
    /// produce.
    fn response_to_chunks(response: &StandardResponse) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        let mk = |delta: Delta, finish: Option<FinishReason>| {
            let mut chunk = StreamChunk::new(response.id.clone(), response.model.clone(), response.created);
            chunk.choices.push(ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish,
            });
            chunk
        };

        chunks.push(mk(
            Delta {
                role: Some(Role::Assistant),
                ..Default::default()
            },
            None,
        ));
        if let Some(content) = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
        {
            chunks.push(mk(
                Delta {
                    content: Some(content),
                    ..Default::default()
                },
                None,
            ));
        }
        let mut last = mk(
            Delta::default(),
            response
                .choices
                .first()
                .and_then(|c| c.finish_reason)
                .or(Some(FinishReason::Stop)),
        );
        last.usage = response.usage.clone();
        chunks.push(last);
        chunks
    }
}

#[async_trait]
impl ProtocolAdapter for MockAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Openai
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn validate(&self, request: &StandardRequest, model: &Model) -> Result<()> {
        crate::adapter::validate_common(request, model)
    }

    async fn execute(&self, request: &StandardRequest, model: &Model) -> Result<StandardResponse> {
        self.requests.lock().unwrap().push(request.clone());
        match self.pop() {
            MockOutcome::Response(mut response) => {
                response.model = model.model_id.clone();
                Ok(response)
            }
            MockOutcome::Chunks(chunks) => {
                // Assemble the text a client would have concatenated.
                let text: String = chunks
                    .iter()
                    .flat_map(|c| c.choices.iter())
                    .filter_map(|c| c.delta.content.clone())
                    .collect();
                let usage = chunks.iter().rev().find_map(|c| c.usage.clone());
                let mut response = Self::text_response(&text, 0, 0, None);
                response.usage = usage;
                response.model = model.model_id.clone();
                Ok(response)
            }
            MockOutcome::Fail(failure) => Err(failure.to_error()),
        }
    }

    async fn execute_stream(
        &self,
        request: &StandardRequest,
        model: &Model,
    ) -> Result<AdapterStream> {
        self.requests.lock().unwrap().push(request.clone());
        let chunks = match self.pop() {
            MockOutcome::Chunks(chunks) => chunks,
            MockOutcome::Response(mut response) => {
                response.model = model.model_id.clone();
                Self::response_to_chunks(&response)
            }
            MockOutcome::Fail(failure) => return Err(failure.to_error()),
        };

        let (tx, rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        });
        Ok(AdapterStream { rx })
    }
}

/// Test factory: hands out mock adapters keyed by provider name. Providers
/// without an entry fail to configure, which exercises the orchestrator's
/// configuration-failure path.
pub struct MockAdapterFactory {
    adapters: Mutex<HashMap<String, MockAdapter>>,
}

impl MockAdapterFactory {
    pub fn new() -> Self {
        Self {
            adapters: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, provider: impl Into<String>, adapter: MockAdapter) {
        self.adapters.lock().unwrap().insert(provider.into(), adapter);
    }
}

impl Default for MockAdapterFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AdapterFactory for MockAdapterFactory {
    async fn configure(&self, model: &Model) -> Result<Box<dyn ProtocolAdapter>> {
        let adapter = self
            .adapters
            .lock()
            .unwrap()
            .get(&model.provider)
            .cloned()
            .ok_or_else(|| {
                RelayError::Configuration(format!("no credentials for provider {}", model.provider))
            })?;
        Ok(Box::new(adapter))
    }
}
