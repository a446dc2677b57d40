use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use relay_core::{
    AdapterKind, Model, RelayError, Result, StandardRequest, StandardResponse, StreamChunk,
};

use crate::adapter::*;
use crate::stream::SseBuffer;

/// OpenAI chat-completions adapter. The canonical shape is already this wire
/// format, so translation is a pass-through with the gateway's routing knobs
/// stripped.
pub struct OpenAiAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    timeout: std::time::Duration,
}

impl OpenAiAdapter {
    pub fn configure(creds: &ProviderCredentials, model: &Model) -> Result<Self> {
        let extra = merged_extra(creds, model);
        let api_key = match optional_extra(&extra, "api_key")? {
            Some(key) => key,
            None => creds.api_key.clone().ok_or_else(|| {
                RelayError::Configuration("openai: no api key configured".into())
            })?,
        };
        let base_url = match optional_extra(&extra, "base_url")? {
            Some(url) => url,
            None => creds
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".into()),
        };
        let timeout = creds.timeout();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Configuration(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            base_url,
            timeout,
        })
    }
}

/// Serialize a request into the OpenAI wire body: rewrite the model id,
/// strip gateway extension fields, and set stream options.
pub(crate) fn to_wire_body(
    request: &StandardRequest,
    provider_model_id: &str,
    streaming: bool,
) -> Result<serde_json::Value> {
    let mut body = serde_json::to_value(request)?;
    let obj = body
        .as_object_mut()
        .ok_or_else(|| RelayError::Validation("request must be a JSON object".into()))?;

    obj.insert("model".into(), serde_json::json!(provider_model_id));
    obj.remove("speed_vs_price");
    obj.remove("max_cost_per_token");
    obj.remove("providers");

    // Prompt-cache annotations are an anthropic-family concept.
    if let Some(tools) = obj.get_mut("tools").and_then(|t| t.as_array_mut()) {
        for tool in tools {
            if let Some(t) = tool.as_object_mut() {
                t.remove("cache_control");
            }
        }
    }
    if let Some(messages) = obj.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in messages {
            if let Some(parts) = msg.get_mut("content").and_then(|c| c.as_array_mut()) {
                for part in parts {
                    if let Some(p) = part.as_object_mut() {
                        p.remove("cache_control");
                    }
                }
            }
        }
    }

    if streaming {
        obj.insert("stream".into(), serde_json::json!(true));
        obj.insert(
            "stream_options".into(),
            serde_json::json!({ "include_usage": true }),
        );
    } else {
        obj.remove("stream");
    }

    Ok(body)
}

/// Parse an OpenAI-shaped response, rewriting the model to the gateway-facing
/// id and lifting the cached-token detail into the flat usage block.
pub(crate) fn parse_openai_response(
    data: serde_json::Value,
    model_id: &str,
) -> Result<StandardResponse> {
    let cached = data["usage"]["prompt_tokens_details"]["cached_tokens"]
        .as_u64()
        .map(|v| v as u32);
    let mut response: StandardResponse = serde_json::from_value(data)
        .map_err(|e| RelayError::Api {
            status: 502,
            message: format!("malformed completion response: {e}"),
        })?;
    response.model = model_id.to_string();
    if let Some(usage) = response.usage.as_mut() {
        if usage.cached_tokens.is_none() {
            usage.cached_tokens = cached;
        }
    }
    Ok(response)
}

pub(crate) fn parse_openai_chunk(data: serde_json::Value, model_id: &str) -> Result<StreamChunk> {
    let cached = data["usage"]["prompt_tokens_details"]["cached_tokens"]
        .as_u64()
        .map(|v| v as u32);
    let mut chunk: StreamChunk = serde_json::from_value(data).map_err(|e| RelayError::Api {
        status: 502,
        message: format!("malformed stream chunk: {e}"),
    })?;
    chunk.model = model_id.to_string();
    if let Some(usage) = chunk.usage.as_mut() {
        if usage.cached_tokens.is_none() {
            usage.cached_tokens = cached;
        }
    }
    Ok(chunk)
}

#[async_trait]
impl ProtocolAdapter for OpenAiAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Openai
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn validate(&self, request: &StandardRequest, model: &Model) -> Result<()> {
        validate_common(request, model)
    }

    async fn execute(&self, request: &StandardRequest, model: &Model) -> Result<StandardResponse> {
        let body = to_wire_body(request, &model.provider_model_id, false)?;
        debug!(model = %model.provider_model_id, "sending openai request");

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
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
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
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
                            let Ok(value) =
                                serde_json::from_str::<serde_json::Value>(&payload)
                            else {
                                continue;
                            };
                            match parse_openai_chunk(value, &model_id) {
                                Ok(chunk) => {
                                    if tx.send(Ok(chunk)).await.is_err() {
                                        // Client went away; stop reading upstream.
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
