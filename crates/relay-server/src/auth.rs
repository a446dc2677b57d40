use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::warn;

use relay_config::schema::{ApiKeyEntry, AuthConfig};
use relay_core::{
    ApiKeyInfo, AuthData, AuthMethod, RelayError, Result, TtlCache, UserInfo, WalletLedger,
};

const KEY_PREFIXES: [&str; 4] = ["sk_", "ak_", "api_", "key_"];

/// Classify an auth token. Anything with a key-like prefix, or without the
/// three dot-separated segments of a JWT, is treated as an API key.
pub fn classify_token(token: &str) -> AuthMethod {
    if KEY_PREFIXES.iter().any(|p| token.starts_with(p)) || token.split('.').count() != 3 {
        AuthMethod::ApiKey
    } else {
        AuthMethod::BearerToken
    }
}

/// Authenticates a caller from request headers.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthData>;
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

/// Auth provider backed by the config's API-key table and an optional HS256
/// JWT secret. Key lookups are cached; balances are filled by the caller
/// from the wallet so the 60s balance TTL stays in one place.
pub struct ConfigAuthProvider {
    keys: HashMap<String, ApiKeyEntry>,
    jwt_secret: Option<String>,
    wallet: Arc<dyn WalletLedger>,
    cache: TtlCache<String, AuthData>,
}

impl ConfigAuthProvider {
    pub fn new(config: &AuthConfig, wallet: Arc<dyn WalletLedger>, cache_ttl: Duration) -> Self {
        let keys = config
            .api_keys
            .iter()
            .map(|entry| (entry.key.clone(), entry.clone()))
            .collect();
        Self {
            keys,
            jwt_secret: config.jwt_secret.clone(),
            wallet,
            cache: TtlCache::new(cache_ttl),
        }
    }

    fn extract_token(headers: &HeaderMap) -> Result<String> {
        if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
            return Ok(key.to_string());
        }
        if let Some(bearer) = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        {
            return Ok(bearer.to_string());
        }
        Err(RelayError::Authentication(
            "missing X-API-Key or Authorization header".into(),
        ))
    }

    fn authenticate_api_key(&self, token: &str) -> Result<AuthData> {
        let entry = self.keys.get(token).ok_or_else(|| {
            warn!("rejected request with unknown api key");
            RelayError::Authentication("unknown api key".into())
        })?;
        Ok(AuthData {
            user: UserInfo {
                id: entry.user_id.clone(),
                balance: 0.0,
                email: entry.email.clone(),
            },
            api_key: Some(ApiKeyInfo {
                id: entry.key.clone(),
                name: entry.name.clone(),
            }),
            method: AuthMethod::ApiKey,
        })
    }

    fn authenticate_jwt(&self, token: &str) -> Result<AuthData> {
        let secret = self.jwt_secret.as_ref().ok_or_else(|| {
            RelayError::Authentication("bearer tokens are not enabled".into())
        })?;
        let decoded = jsonwebtoken::decode::<JwtClaims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|e| RelayError::Authentication(format!("invalid bearer token: {e}")))?;

        Ok(AuthData {
            user: UserInfo {
                id: decoded.claims.sub,
                balance: 0.0,
                email: decoded.claims.email,
            },
            api_key: None,
            method: AuthMethod::BearerToken,
        })
    }
}

#[async_trait]
impl AuthProvider for ConfigAuthProvider {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthData> {
        let token = Self::extract_token(headers)?;

        if let Some(cached) = self.cache.get(&token) {
            return Ok(cached);
        }

        let mut auth = match classify_token(&token) {
            AuthMethod::ApiKey => self.authenticate_api_key(&token)?,
            AuthMethod::BearerToken => self.authenticate_jwt(&token)?,
        };
        // Snapshot the balance so downstream consumers of AuthData see
        // something sensible; the orchestrator re-reads through its own
        // 60s cache before admitting the request.
        auth.user.balance = self.wallet.balance(&auth.user.id).await.unwrap_or(0.0);

        self.cache.insert(token, auth.clone());
        Ok(auth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_tokens_are_api_keys() {
        assert_eq!(classify_token("sk_live_abc"), AuthMethod::ApiKey);
        assert_eq!(classify_token("ak_123"), AuthMethod::ApiKey);
        assert_eq!(classify_token("api_456"), AuthMethod::ApiKey);
        assert_eq!(classify_token("key_789"), AuthMethod::ApiKey);
    }

    #[test]
    fn three_segments_without_prefix_is_a_jwt() {
        assert_eq!(classify_token("aaa.bbb.ccc"), AuthMethod::BearerToken);
        // A key-like prefix wins even with three segments.
        assert_eq!(classify_token("sk_a.b.c"), AuthMethod::ApiKey);
    }

    #[test]
    fn wrong_segment_count_is_an_api_key() {
        assert_eq!(classify_token("opaque-token"), AuthMethod::ApiKey);
        assert_eq!(classify_token("a.b"), AuthMethod::ApiKey);
        assert_eq!(classify_token("a.b.c.d"), AuthMethod::ApiKey);
    }
}
