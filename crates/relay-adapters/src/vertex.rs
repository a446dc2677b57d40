use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use relay_core::{
    AdapterKind, Model, RelayError, Result, StandardRequest, StandardResponse,
};

use crate::adapter::*;
use crate::anthropic::{build_messages_body, parse_message_response, pump_sse_stream};

const VERTEX_ANTHROPIC_VERSION: &str = "vertex-2023-10-16";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const CLOUD_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Anthropic models served through Vertex AI. Credentials come either from
/// an explicit service-account triple (client_email, private_key,
/// project_id) or from default GCP discovery via the metadata server.
#[derive(Debug)]
pub struct VertexAdapter {
    client: Client,
    project_id: String,
    region: String,
    service_account: Option<ServiceAccount>,
    token: Mutex<Option<CachedToken>>,
    timeout: Duration,
}

#[derive(Clone, Debug)]
struct ServiceAccount {
    client_email: String,
    private_key: String,
}

#[derive(Clone, Debug)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Serialize)]
struct JwtClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    3600
}

impl VertexAdapter {
    pub fn configure(creds: &ProviderCredentials, model: &Model) -> Result<Self> {
        let extra = merged_extra(creds, model);

        let project_id = match optional_extra(&extra, "project_id")? {
            Some(p) => p,
            None => std::env::var("GCP_PROJECT_ID").map_err(|_| {
                RelayError::Configuration(
                    "vertex: no project_id configured and GCP_PROJECT_ID unset".into(),
                )
            })?,
        };
        let region = optional_extra(&extra, "region")?.unwrap_or_else(|| "us-east5".into());

        let client_email =
            optional_extra(&extra, "client_email")?.or_else(|| std::env::var("GCP_CLIENT_EMAIL").ok());
        let private_key =
            optional_extra(&extra, "private_key")?.or_else(|| std::env::var("GCP_PRIVATE_KEY").ok());
        let service_account = match (client_email, private_key) {
            (Some(client_email), Some(private_key)) => Some(ServiceAccount {
                client_email,
                // Keys exported through env vars carry literal \n sequences.
                private_key: private_key.replace("\\n", "\n"),
            }),
            (None, None) => None,
            _ => {
                return Err(RelayError::Configuration(
                    "vertex: client_email and private_key must be provided together".into(),
                ));
            }
        };

        let timeout = creds.timeout();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            project_id,
            region,
            service_account,
            token: Mutex::new(None),
            timeout,
        })
    }

    fn endpoint(&self, provider_model_id: &str, streaming: bool) -> String {
        let verb = if streaming { "streamRawPredict" } else { "rawPredict" };
        format!(
            "https://{region}-aiplatform.googleapis.com/v1/projects/{project}/locations/{region}/publishers/anthropic/models/{model}:{verb}",
            region = self.region,
            project = self.project_id,
            model = provider_model_id,
        )
    }

    /// Get a bearer token, refreshing when within a minute of expiry.
    async fn access_token(&self) -> Result<String> {
        if let Some(cached) = self.token.lock().clone() {
            if cached.expires_at > Instant::now() + Duration::from_secs(60) {
                return Ok(cached.access_token);
            }
        }

        let fetched = match &self.service_account {
            Some(sa) => self.exchange_service_account(sa).await?,
            None => self.metadata_token().await?,
        };

        let token = fetched.access_token.clone();
        *self.token.lock() = Some(CachedToken {
            access_token: fetched.access_token,
            expires_at: Instant::now() + Duration::from_secs(fetched.expires_in),
        });
        Ok(token)
    }

    /// Signed-JWT grant: RS256 assertion exchanged at the OAuth endpoint.
    async fn exchange_service_account(&self, sa: &ServiceAccount) -> Result<TokenResponse> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let claims = JwtClaims {
            iss: sa.client_email.clone(),
            scope: CLOUD_SCOPE.into(),
            aud: OAUTH_TOKEN_URL.into(),
            iat: now,
            exp: now + 3600,
        };
        let key = EncodingKey::from_rsa_pem(sa.private_key.as_bytes()).map_err(|e| {
            RelayError::Configuration(format!("vertex: invalid service account key: {e}"))
        })?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| {
                RelayError::Configuration(format!("vertex: failed to sign assertion: {e}"))
            })?;

        let resp = self
            .client
            .post(OAUTH_TOKEN_URL)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| classify_transport(e, self.timeout))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(RelayError::Configuration(format!(
                "vertex: token exchange failed (HTTP {status}): {text}"
            )));
        }
        resp.json::<TokenResponse>()
            .await
            .map_err(|e| classify_transport(e, self.timeout))
    }

    /// Default discovery on GCP compute: the instance metadata server.
    async fn metadata_token(&self) -> Result<TokenResponse> {
        let resp = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|_| {
                RelayError::Configuration(
                    "vertex: no service account configured and metadata server unreachable".into(),
                )
            })?;
        if !resp.status().is_success() {
            return Err(RelayError::Configuration(
                "vertex: metadata server refused token request".into(),
            ));
        }
        resp.json::<TokenResponse>()
            .await
            .map_err(|e| classify_transport(e, self.timeout))
    }

    fn wire_body(request: &StandardRequest) -> Result<serde_json::Value> {
        let mut body = build_messages_body(request)?;
        body["anthropic_version"] = json!(VERTEX_ANTHROPIC_VERSION);
        Ok(body)
    }
}

#[async_trait]
impl ProtocolAdapter for VertexAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::VertexAnthropic
    }

    fn is_configured(&self) -> bool {
        !self.project_id.is_empty()
    }

    fn validate(&self, request: &StandardRequest, model: &Model) -> Result<()> {
        validate_common(request, model)
    }

    async fn execute(&self, request: &StandardRequest, model: &Model) -> Result<StandardResponse> {
        let body = Self::wire_body(request)?;
        let token = self.access_token().await?;
        debug!(model = %model.provider_model_id, region = %self.region, "sending vertex request");

        let resp = self
            .client
            .post(self.endpoint(&model.provider_model_id, false))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(e, self.timeout))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(RelayError::from_upstream_status(status, text));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| classify_transport(e, self.timeout))?;
        parse_message_response(&data, &model.model_id)
    }

    async fn execute_stream(
        &self,
        request: &StandardRequest,
        model: &Model,
    ) -> Result<AdapterStream> {
        let mut body = Self::wire_body(request)?;
        body["stream"] = json!(true);
        let token = self.access_token().await?;

        let resp = self
            .client
            .post(self.endpoint(&model.provider_model_id, true))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(e, self.timeout))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(RelayError::from_upstream_status(status, text));
        }

        let (tx, rx) = tokio::sync::mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(pump_sse_stream(resp, model.model_id.clone(), tx));
        Ok(AdapterStream { rx })
    }
}
