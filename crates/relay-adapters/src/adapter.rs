use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use relay_core::{Model, RelayError, Result, StandardRequest, StandardResponse, StreamChunk};

/// Channel capacity between an adapter's parsing loop and the client writer.
/// Bounded so a slow client applies backpressure to the upstream read.
pub(crate) const STREAM_CHANNEL_CAPACITY: usize = 256;

/// Default per-attempt timeout. Azure deployments may raise theirs via
/// `extra_param.timeout_secs` (capped at 500s).
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Credentials and connection settings for one provider, already merged from
/// the provider config block. `extra` values may still carry `${VAR}`
/// environment references; adapters resolve them at configure time.
#[derive(Debug, Clone, Default)]
pub struct ProviderCredentials {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProviderCredentials {
    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT)
    }
}

/// A live translated stream: chunks arrive in strict upstream order; an
/// `Err` item terminates the stream.
pub struct AdapterStream {
    pub rx: mpsc::Receiver<Result<StreamChunk>>,
}

/// The uniform adapter contract. One implementation per wire protocol; the
/// set is closed and constructed through [`crate::configure_adapter`].
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn kind(&self) -> relay_core::AdapterKind;

    fn is_configured(&self) -> bool;

    /// Shape checks the upstream would reject anyway, caught before the
    /// network round-trip.
    fn validate(&self, request: &StandardRequest, model: &Model) -> Result<()>;

    async fn execute(&self, request: &StandardRequest, model: &Model) -> Result<StandardResponse>;

    async fn execute_stream(
        &self,
        request: &StandardRequest,
        model: &Model,
    ) -> Result<AdapterStream>;
}

/// Seam between the orchestrator and adapter construction, so tests can
/// inject mocks per provider.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn configure(&self, model: &Model) -> Result<Box<dyn ProtocolAdapter>>;
}

/// Production factory: resolves the provider's credential block and builds
/// the real adapter for the model's kind.
pub struct DefaultAdapterFactory {
    credentials: HashMap<String, ProviderCredentials>,
}

impl DefaultAdapterFactory {
    pub fn new(credentials: HashMap<String, ProviderCredentials>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AdapterFactory for DefaultAdapterFactory {
    async fn configure(&self, model: &Model) -> Result<Box<dyn ProtocolAdapter>> {
        let creds = self
            .credentials
            .get(&model.provider)
            .cloned()
            .unwrap_or_default();
        crate::configure_adapter(&creds, model).await
    }
}

/// Resolve a possibly-env-referencing string value. `${VAR}` is replaced by
/// the variable's value; a missing variable is a configuration error so the
/// orchestrator can fall back to another provider.
pub(crate) fn resolve_env_ref(value: &str) -> Result<String> {
    if let Some(name) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        return std::env::var(name).map_err(|_| {
            RelayError::Configuration(format!("environment variable {name} is not set"))
        });
    }
    Ok(value.to_string())
}

/// Fetch a required string out of `extra_param`, resolving env references.
pub(crate) fn required_extra(
    extra: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<String> {
    let raw = extra
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| RelayError::Configuration(format!("missing extra_param `{key}`")))?;
    resolve_env_ref(raw)
}

/// Optional string out of `extra_param`, resolving env references.
pub(crate) fn optional_extra(
    extra: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Option<String>> {
    match extra.get(key).and_then(|v| v.as_str()) {
        Some(raw) => resolve_env_ref(raw).map(Some),
        None => Ok(None),
    }
}

/// Merge the provider block's extras with a model's `extra_param`; the model
/// entry wins on conflicts.
pub(crate) fn merged_extra(
    creds: &ProviderCredentials,
    model: &Model,
) -> serde_json::Map<String, serde_json::Value> {
    let mut merged = creds.extra.clone();
    for (k, v) in &model.extra_param {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Shape checks shared by every adapter.
pub(crate) fn validate_common(request: &StandardRequest, model: &Model) -> Result<()> {
    if request.messages.is_empty() {
        return Err(RelayError::Validation("messages must not be empty".into()));
    }
    for msg in &request.messages {
        if msg.role == relay_core::Role::Tool && msg.tool_call_id.is_none() {
            return Err(RelayError::Validation(
                "tool message is missing tool_call_id".into(),
            ));
        }
    }
    if request.has_tools() && !model.support_tool_calling {
        return Err(RelayError::Validation(format!(
            "model {} does not support tool calling",
            model.model_id
        )));
    }
    if request.has_images() && !model.support_vision {
        return Err(RelayError::Validation(format!(
            "model {} does not support image input",
            model.model_id
        )));
    }
    Ok(())
}

/// Classify a reqwest transport failure.
pub(crate) fn classify_transport(err: reqwest::Error, timeout: Duration) -> RelayError {
    if err.is_timeout() {
        RelayError::Timeout {
            ms: timeout.as_millis() as u64,
        }
    } else {
        RelayError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_ref_passthrough_and_missing() {
        assert_eq!(resolve_env_ref("literal").unwrap(), "literal");
        let err = resolve_env_ref("${RELAY_TEST_UNSET_VAR_XYZ}").unwrap_err();
        assert_eq!(err.kind(), relay_core::ErrorKind::Configuration);
    }

    #[test]
    fn env_ref_resolves_set_variable() {
        // Safety: test-local variable name, no concurrent reader depends on it.
        unsafe { std::env::set_var("RELAY_TEST_SET_VAR", "resolved") };
        assert_eq!(resolve_env_ref("${RELAY_TEST_SET_VAR}").unwrap(), "resolved");
    }
}
