use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use relay_core::{
    AdapterKind, Model, RelayError, Result, StandardRequest, StandardResponse,
};

use crate::adapter::*;
use crate::openai::{parse_openai_chunk, parse_openai_response, to_wire_body};
use crate::stream::SseBuffer;

/// Azure deployments can legitimately take much longer than the default.
const MAX_TIMEOUT_SECS: u64 = 500;

/// Azure OpenAI adapter: the OpenAI wire shape, but authenticated with an
/// `api-key` header and addressed per deployment. Endpoint, deployment,
/// api-version, and key come from the model's `extra_param` and may
/// reference environment variables.
#[derive(Debug)]
pub struct AzureAdapter {
    client: Client,
    api_key: String,
    url: String,
    timeout: std::time::Duration,
}

impl AzureAdapter {
    pub fn configure(creds: &ProviderCredentials, model: &Model) -> Result<Self> {
        let extra = merged_extra(creds, model);
        let endpoint = required_extra(&extra, "endpoint")?;
        let deployment = required_extra(&extra, "deployment")?;
        let api_version = required_extra(&extra, "api_version")?;
        let api_key = match optional_extra(&extra, "api_key")? {
            Some(key) => key,
            None => creds.api_key.clone().ok_or_else(|| {
                RelayError::Configuration("azure-openai: no api key configured".into())
            })?,
        };

        let timeout_secs = extra
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .or(creds.timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT.as_secs())
            .min(MAX_TIMEOUT_SECS);
        let timeout = std::time::Duration::from_secs(timeout_secs);

        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            endpoint.trim_end_matches('/'),
            deployment,
            api_version
        );
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Configuration(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            url,
            timeout,
        })
    }
}

#[async_trait]
impl ProtocolAdapter for AzureAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::AzureOpenai
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn validate(&self, request: &StandardRequest, model: &Model) -> Result<()> {
        validate_common(request, model)
    }

    async fn execute(&self, request: &StandardRequest, model: &Model) -> Result<StandardResponse> {
        let body = to_wire_body(request, &model.provider_model_id, false)?;
        debug!(url = %self.url, "sending azure-openai request");

        let resp = self
            .client
            .post(&self.url)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(e, self.timeout))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            // A 404 here means the deployment is missing or misnamed, which
            // from_upstream_status already treats as a configuration error,
            // keeping fallback open.
            return Err(RelayError::from_upstream_status(status, text));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| classify_transport(e, self.timeout))?;
        parse_openai_response(data, &model.model_id)
    }

    async fn execute_stream(
        &self,
        request: &StandardRequest,
        model: &Model,
    ) -> Result<AdapterStream> {
        let body = to_wire_body(request, &model.provider_model_id, true)?;

        let resp = self
            .client
            .post(&self.url)
            .header("api-key", &self.api_key)
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
        let model_id = model.model_id.clone();

        tokio::spawn(async move {
            use futures::StreamExt;
            let mut bytes = resp.bytes_stream();
            let mut buffer = SseBuffer::new();

            while let Some(chunk_result) = bytes.next().await {
                match chunk_result {
                    Ok(data) => {
                        for payload in buffer.push(&data) {
                            if payload.trim() == "[DONE]" {
                                return;
                            }
                            let Ok(value) = serde_json::from_str::<serde_json::Value>(&payload)
                            else {
                                continue;
                            };
                            // Azure prepends an empty content-filter chunk
                            // with no choices; pass it through harmlessly.
                            match parse_openai_chunk(value, &model_id) {
                                Ok(chunk) => {
                                    if tx.send(Ok(chunk)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    let _ = tx.send(Err(e)).await;
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(RelayError::Network(e.to_string()))).await;
                        return;
                    }
                }
            }
        });

        Ok(AdapterStream { rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::Model;

    fn azure_model(extra: serde_json::Value) -> Model {
        Model {
            model_id: "gpt-4o".into(),
            provider: "azure".into(),
            adapter: AdapterKind::AzureOpenai,
            provider_model_id: "gpt-4o".into(),
            context_window: 128_000,
            support_tool_calling: true,
            support_vision: true,
            price_per_input_token: 2.5e-6,
            price_per_output_token: 1e-5,
            price_per_cached_token: None,
            extra_param: extra.as_object().cloned().unwrap_or_default(),
            active: true,
        }
    }

    #[test]
    fn builds_deployment_url() {
        let model = azure_model(serde_json::json!({
            "endpoint": "https://example.openai.azure.com/",
            "deployment": "gpt4o-prod",
            "api_version": "2024-06-01",
            "api_key": "azkey"
        }));
        let adapter = AzureAdapter::configure(&ProviderCredentials::default(), &model).unwrap();
        assert_eq!(
            adapter.url,
            "https://example.openai.azure.com/openai/deployments/gpt4o-prod/chat/completions?api-version=2024-06-01"
        );
        assert!(adapter.is_configured());
    }

    #[test]
    fn missing_deployment_is_a_configuration_error() {
        let model = azure_model(serde_json::json!({
            "endpoint": "https://example.openai.azure.com",
            "api_version": "2024-06-01",
            "api_key": "azkey"
        }));
        let err = AzureAdapter::configure(&ProviderCredentials::default(), &model).unwrap_err();
        assert_eq!(err.kind(), relay_core::ErrorKind::Configuration);
        assert!(err.retryable());
    }

    #[test]
    fn timeout_is_capped() {
        let model = azure_model(serde_json::json!({
            "endpoint": "https://example.openai.azure.com",
            "deployment": "d",
            "api_version": "v",
            "api_key": "k",
            "timeout_secs": 9000
        }));
        let adapter = AzureAdapter::configure(&ProviderCredentials::default(), &model).unwrap();
        assert_eq!(adapter.timeout.as_secs(), MAX_TIMEOUT_SECS);
    }
}
