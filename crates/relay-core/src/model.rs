use serde::{Deserialize, Serialize};

/// The closed set of wire protocols the gateway speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    Openai,
    AzureOpenai,
    AnthropicNative,
    BedrockAnthropic,
    VertexAnthropic,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Openai => "openai",
            AdapterKind::AzureOpenai => "azure-openai",
            AdapterKind::AnthropicNative => "anthropic-native",
            AdapterKind::BedrockAnthropic => "bedrock-anthropic",
            AdapterKind::VertexAnthropic => "vertex-anthropic",
        }
    }

    /// Adapters sharing the anthropic translation core.
    pub fn is_anthropic_family(&self) -> bool {
        matches!(
            self,
            AdapterKind::AnthropicNative
                | AdapterKind::BedrockAnthropic
                | AdapterKind::VertexAnthropic
        )
    }
}

/// One row of the model table: a `(model_id, provider)` combination with the
/// protocol, pricing, and capabilities needed to serve it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub model_id: String,
    pub provider: String,
    pub adapter: AdapterKind,
    /// The identifier the backend itself uses.
    pub provider_model_id: String,
    pub context_window: u32,
    #[serde(default)]
    pub support_tool_calling: bool,
    #[serde(default)]
    pub support_vision: bool,
    pub price_per_input_token: f64,
    pub price_per_output_token: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_per_cached_token: Option<f64>,
    /// Free-form per-combination parameters (endpoints, deployments, regions).
    /// String values may reference environment variables as `${VAR}`.
    #[serde(default)]
    pub extra_param: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Model {
    pub fn key(&self) -> (&str, &str) {
        (&self.model_id, &self.provider)
    }

    /// Summed per-token price, the scalar the selector's price axis uses.
    pub fn price_sum(&self) -> f64 {
        self.price_per_input_token + self.price_per_output_token
    }

    pub fn matches_id(&self, requested: &str) -> bool {
        self.model_id == requested || self.provider_model_id == requested
    }
}

/// Selector output: a rankable provider combination with the metrics that
/// scored it.
#[derive(Debug, Clone)]
pub struct ProviderCombination {
    pub model: Model,
    pub price_sum: f64,
    pub throughput_median_ts: Option<f64>,
    pub latency_median_ms: Option<f64>,
    pub caching_boost: bool,
    pub distance_score: f64,
}
