use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use relay_core::Model;

/// Root configuration — maps to `relay.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    /// Provider credential blocks keyed by provider name.
    pub providers: HashMap<String, ProviderConfig>,
    /// The model table the registry serves.
    pub models: Vec<Model>,
    pub notifications: NotificationConfig,
    pub logging: LoggingConfig,
}

// ── Server ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            cors: true,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── Gateway ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Minimum balance (USD) required to accept a request.
    pub minimal_fund: f64,
    /// Hard bound on one upstream attempt (non-streaming execution or
    /// stream establishment).
    pub request_timeout_secs: u64,
    /// Per-user balance cache; invalidated on debit.
    pub balance_cache_ttl_secs: u64,
    /// Per-key auth cache.
    pub auth_cache_ttl_secs: u64,
    /// Coarse model-snapshot refresh interval.
    pub model_refresh_secs: u64,
    /// Median window for performance queries.
    pub performance_window: usize,
    /// Path to the families YAML document.
    pub families_path: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            minimal_fund: 0.0,
            request_timeout_secs: 30,
            balance_cache_ttl_secs: 60,
            auth_cache_ttl_secs: 600,
            model_refresh_secs: 3600,
            performance_window: 10,
            families_path: None,
        }
    }
}

// ── Auth ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret for caller bearer tokens. Bearer auth is rejected when
    /// unset.
    pub jwt_secret: Option<String>,
    pub api_keys: Vec<ApiKeyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub key: String,
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Seed balance for the built-in wallet ledger. Ignored when an external
    /// ledger is wired in.
    #[serde(default)]
    pub initial_balance: f64,
}

// ── Providers ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
    /// Merged into each model's `extra_param` at adapter configure time.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ── Notifications ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Webhook receiving upstream 5xx/timeout alerts. Unset disables.
    pub webhook_url: Option<String>,
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

impl RelayConfig {
    /// Validate the config. Returns warnings for suspicious-but-workable
    /// settings; errors abort startup.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if self.models.is_empty() {
            warnings.push("no models configured; every completion will fail with NO_PROVIDERS".into());
        }
        for model in &self.models {
            if model.price_per_input_token < 0.0 || model.price_per_output_token < 0.0 {
                return Err(format!(
                    "model {}/{} has negative pricing",
                    model.model_id, model.provider
                ));
            }
            if let Some(cached) = model.price_per_cached_token {
                if cached > model.price_per_input_token {
                    warnings.push(format!(
                        "model {}/{}: cached-token price exceeds input price",
                        model.model_id, model.provider
                    ));
                }
            }
            if model.context_window == 0 {
                return Err(format!(
                    "model {}/{} has a zero context window",
                    model.model_id, model.provider
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if !seen.insert((model.model_id.clone(), model.provider.clone())) {
                return Err(format!(
                    "duplicate model entry {}/{}",
                    model.model_id, model.provider
                ));
            }
        }

        if self.auth.api_keys.is_empty() && self.auth.jwt_secret.is_none() {
            warnings.push("no api keys or jwt secret configured; all requests will be rejected".into());
        }

        Ok(warnings)
    }
}
