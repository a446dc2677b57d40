use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::schema::{ProviderConfig, RelayConfig};

/// Loads the gateway configuration and applies environment overrides.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Resolve the config path: explicit path > RELAY_CONFIG env > ./relay.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("RELAY_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("relay.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> relay_core::Result<RelayConfig> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<RelayConfig>(&raw).map_err(|e| {
                relay_core::RelayError::Config(format!(
                    "failed to parse {}: {}",
                    config_path.display(),
                    e
                ))
            })?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            RelayConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(relay_core::RelayError::Config(e));
            }
        }

        Ok(config)
    }

    /// Apply env var overrides (PORT, HOST, MINIMAL_FUND, cache TTLs, and
    /// provider API keys). Config file values take priority for credentials;
    /// env is the fallback.
    pub fn apply_env_overrides(mut config: RelayConfig) -> RelayConfig {
        if let Ok(v) = std::env::var("HOST") {
            config.server.host = v;
        }
        if let Ok(v) = std::env::var("PORT") {
            if let Ok(port) = v.parse::<u16>() {
                config.server.port = port;
            }
        }
        if let Ok(v) = std::env::var("MINIMAL_FUND") {
            if let Ok(fund) = v.parse::<f64>() {
                config.gateway.minimal_fund = fund;
            }
        }
        if let Ok(v) = std::env::var("CACHE_TTL_SECONDS") {
            if let Ok(ttl) = v.parse::<u64>() {
                config.gateway.auth_cache_ttl_secs = ttl;
            }
        }
        if let Ok(v) = std::env::var("BALANCE_CACHE_TTL_SECONDS") {
            if let Ok(ttl) = v.parse::<u64>() {
                config.gateway.balance_cache_ttl_secs = ttl;
            }
        }
        if let Ok(v) = std::env::var("RELAY_LOG_LEVEL") {
            config.logging.level = v;
        }

        // Provider credentials: env fills in when the config file doesn't
        // carry the key.
        for (provider, env_name) in [
            ("openai", "API_KEY_OPENAI"),
            ("anthropic", "API_KEY_ANTHROPIC"),
        ] {
            let entry = config
                .providers
                .entry(provider.to_string())
                .or_insert_with(ProviderConfig::default);
            if entry.api_key.is_none() {
                if let Ok(v) = std::env::var(env_name) {
                    entry.api_key = Some(v);
                }
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_toml_with_models() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
[server]
port = 9090

[[models]]
model_id = "gpt-4o"
provider = "openai"
adapter = "openai"
provider_model_id = "gpt-4o"
context_window = 128000
support_tool_calling = true
support_vision = true
price_per_input_token = 0.0000025
price_per_output_token = 0.00001

[[auth.api_keys]]
key = "sk_test"
user_id = "u1"
name = "test"
"#
        )
        .unwrap();

        let config = ConfigLoader::load(Some(f.path())).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.models.len(), 1);
        assert_eq!(config.models[0].model_id, "gpt-4o");
    }

    #[test]
    fn rejects_duplicate_combinations() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
[[models]]
model_id = "m"
provider = "p"
adapter = "openai"
provider_model_id = "m"
context_window = 1000
price_per_input_token = 0.0
price_per_output_token = 0.0

[[models]]
model_id = "m"
provider = "p"
adapter = "openai"
provider_model_id = "m"
context_window = 1000
price_per_input_token = 0.0
price_per_output_token = 0.0
"#
        )
        .unwrap();

        assert!(ConfigLoader::load(Some(f.path())).is_err());
    }
}
