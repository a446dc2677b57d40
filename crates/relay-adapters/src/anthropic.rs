use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use relay_core::{
    AdapterKind, ChatMessage, Choice, ContentPart, FinishReason, FunctionCall, MessageContent,
    Model, RelayError, ResponseMessage, Result, Role, StandardRequest, StandardResponse,
    ToolCallSpec, ToolChoice, ToolChoiceMode, Usage,
};

use crate::adapter::*;
use crate::prompt_cache;
use crate::stream::{AnthropicStreamTranslator, SseBuffer};

const ANTHROPIC_VERSION: &str = "2024-10-22";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic messages-API adapter. Bedrock and Vertex reuse the translation
/// core here and differ only in transport and authentication.
pub struct AnthropicAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    timeout: std::time::Duration,
}

impl AnthropicAdapter {
    pub fn configure(creds: &ProviderCredentials, model: &Model) -> Result<Self> {
        let extra = merged_extra(creds, model);
        let api_key = match optional_extra(&extra, "api_key")? {
            Some(key) => key,
            None => creds.api_key.clone().ok_or_else(|| {
                RelayError::Configuration("anthropic: no api key configured".into())
            })?,
        };
        let base_url = creds
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.anthropic.com/v1".into());
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

// ── Translation core (shared with bedrock/vertex) ──────────────

/// Build the anthropic wire body from a canonical request. The `model` and
/// transport-specific version fields are left to each adapter.
pub(crate) fn build_messages_body(request: &StandardRequest) -> Result<Value> {
    let mut system_blocks: Vec<Value> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for msg in &request.messages {
        match msg.role {
            Role::System => {
                let text = msg.text_content();
                if !text.is_empty() {
                    system_blocks.push(json!({ "type": "text", "text": text }));
                }
            }
            Role::User => {
                let blocks = user_content_blocks(msg)?;
                push_user_blocks(&mut messages, blocks);
            }
            Role::Assistant => {
                let mut blocks: Vec<Value> = Vec::new();
                let text = msg.text_content();
                if !text.is_empty() {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                for tc in &msg.tool_calls {
                    let input: Value =
                        serde_json::from_str(&tc.function.arguments).unwrap_or(json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.function.name,
                        "input": input,
                    }));
                }
                if !blocks.is_empty() {
                    messages.push(json!({ "role": "assistant", "content": blocks }));
                }
            }
            Role::Tool => {
                let tool_use_id = msg.tool_call_id.as_ref().ok_or_else(|| {
                    RelayError::Validation("tool message is missing tool_call_id".into())
                })?;
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": msg.text_content(),
                });
                push_user_blocks(&mut messages, vec![block]);
            }
        }
    }

    let mut body = json!({
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });

    if !system_blocks.is_empty() {
        body["system"] = json!(system_blocks);
    }
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = request.top_p {
        body["top_p"] = json!(p);
    }
    // frequency_penalty / presence_penalty have no anthropic equivalent and
    // are silently dropped.
    if let Some(stop) = &request.stop {
        body["stop_sequences"] = json!(stop.to_vec());
    }

    // tool_choice: none drops the tools entirely; auto is the upstream
    // default and is omitted.
    let mut drop_tools = false;
    let mut tool_choice: Option<Value> = None;
    match &request.tool_choice {
        Some(ToolChoice::Mode(ToolChoiceMode::None)) => drop_tools = true,
        Some(ToolChoice::Mode(ToolChoiceMode::Required | ToolChoiceMode::Any)) => {
            tool_choice = Some(json!({ "type": "any" }));
        }
        Some(ToolChoice::Named { function, .. }) => {
            tool_choice = Some(json!({ "type": "tool", "name": function.name }));
        }
        Some(ToolChoice::Mode(ToolChoiceMode::Auto)) | None => {}
    }

    if request.has_tools() && !drop_tools {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                let mut tool = json!({
                    "name": t.function.name,
                    "description": t.function.description.clone().unwrap_or_default(),
                    "input_schema": t.function.parameters,
                });
                if let Some(cc) = &t.cache_control {
                    tool["cache_control"] = cc.clone();
                }
                tool
            })
            .collect();
        body["tools"] = json!(tools);
        if let Some(tc) = tool_choice {
            body["tool_choice"] = tc;
        }
    }

    prompt_cache::apply_cache_annotations(&mut body);
    Ok(body)
}

/// User message content as anthropic blocks: text, and images from data-URIs
/// (base64) or plain URLs.
fn user_content_blocks(msg: &ChatMessage) -> Result<Vec<Value>> {
    let mut blocks = Vec::new();
    match &msg.content {
        None => {}
        Some(MessageContent::Text(text)) => {
            if !text.is_empty() {
                blocks.push(json!({ "type": "text", "text": text }));
            }
        }
        Some(MessageContent::Parts(parts)) => {
            for part in parts {
                match part {
                    ContentPart::Text {
                        text,
                        cache_control,
                    } => {
                        let mut block = json!({ "type": "text", "text": text });
                        if let Some(cc) = cache_control {
                            block["cache_control"] = cc.clone();
                        }
                        blocks.push(block);
                    }
                    ContentPart::ImageUrl { image_url } => {
                        blocks.push(image_block(&image_url.url));
                    }
                }
            }
        }
    }
    Ok(blocks)
}

fn image_block(url: &str) -> Value {
    if let Some((media_type, data)) = parse_data_uri(url) {
        json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data }
        })
    } else {
        json!({
            "type": "image",
            "source": { "type": "url", "url": url }
        })
    }
}

/// Split `data:<media-type>;base64,<payload>`. Media type defaults to
/// image/jpeg when the prefix omits it.
fn parse_data_uri(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (prefix, payload) = rest.split_once(";base64,")?;
    let media_type = if prefix.is_empty() {
        "image/jpeg".to_string()
    } else {
        prefix.to_string()
    };
    Some((media_type, payload.to_string()))
}

/// Append blocks to the trailing user message, or open a new one. This is
/// what coalesces tool results with surrounding user content.
fn push_user_blocks(messages: &mut Vec<Value>, blocks: Vec<Value>) {
    if blocks.is_empty() {
        return;
    }
    if let Some(last) = messages.last_mut() {
        if last["role"] == "user" {
            if let Some(content) = last["content"].as_array_mut() {
                content.extend(blocks);
                return;
            }
        }
    }
    messages.push(json!({ "role": "user", "content": blocks }));
}

pub(crate) fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "tool_use" => FinishReason::ToolCalls,
        "max_tokens" => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

/// Parse a non-streaming anthropic response into the canonical shape.
pub(crate) fn parse_message_response(data: &Value, model_id: &str) -> Result<StandardResponse> {
    let blocks = data["content"].as_array().ok_or_else(|| RelayError::Api {
        status: 502,
        message: "anthropic response missing content".into(),
    })?;

    let text: String = blocks
        .iter()
        .filter_map(|b| {
            (b["type"] == "text").then(|| b["text"].as_str().unwrap_or("").to_string())
        })
        .collect::<Vec<_>>()
        .join("");

    let tool_calls: Vec<ToolCallSpec> = blocks
        .iter()
        .filter(|b| b["type"] == "tool_use")
        .map(|b| ToolCallSpec {
            id: b["id"].as_str().unwrap_or("").to_string(),
            kind: "function".into(),
            function: FunctionCall {
                name: b["name"].as_str().unwrap_or("").to_string(),
                arguments: b["input"].to_string(),
            },
        })
        .collect();

    let finish_reason = data["stop_reason"].as_str().map(map_stop_reason);

    let usage_data = &data["usage"];
    let input = usage_data["input_tokens"].as_u64().unwrap_or(0) as u32;
    let cache_read = usage_data["cache_read_input_tokens"].as_u64().unwrap_or(0) as u32;
    let cache_write = usage_data["cache_creation_input_tokens"]
        .as_u64()
        .unwrap_or(0) as u32;
    let output = usage_data["output_tokens"].as_u64().unwrap_or(0) as u32;
    let usage = Usage::new(
        input + cache_read + cache_write,
        output,
        (cache_read > 0).then_some(cache_read),
    );

    let mut response = StandardResponse::new(model_id);
    if let Some(id) = data["id"].as_str() {
        response.id = id.to_string();
    }
    response.choices.push(Choice {
        index: 0,
        message: ResponseMessage {
            role: Role::Assistant,
            content: (!text.is_empty()).then_some(text),
            tool_calls,
        },
        finish_reason,
    });
    response.usage = Some(usage);
    Ok(response)
}

/// Drive a translated anthropic SSE stream into a chunk channel. Shared by
/// the native and vertex adapters; bedrock re-frames its SDK events into the
/// same SSE shape first.
pub(crate) async fn pump_sse_stream(
    resp: reqwest::Response,
    model_id: String,
    tx: tokio::sync::mpsc::Sender<Result<relay_core::StreamChunk>>,
) {
    use futures::StreamExt;
    let mut translator = AnthropicStreamTranslator::new(model_id);
    let mut buffer = SseBuffer::new();
    let mut bytes = resp.bytes_stream();

    while let Some(chunk_result) = bytes.next().await {
        match chunk_result {
            Ok(data) => {
                for payload in buffer.push(&data) {
                    let Ok(event) = serde_json::from_str::<Value>(&payload) else {
                        continue;
                    };
                    if event["type"] == "error" {
                        let message = event["error"]["message"]
                            .as_str()
                            .unwrap_or("unknown stream error")
                            .to_string();
                        let _ = tx.send(Err(RelayError::Api { status: 502, message })).await;
                        return;
                    }
                    for chunk in translator.translate(&event) {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    if translator.is_finished() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(Err(RelayError::Network(e.to_string()))).await;
                return;
            }
        }
    }
}

#[async_trait]
impl ProtocolAdapter for AnthropicAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::AnthropicNative
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn validate(&self, request: &StandardRequest, model: &Model) -> Result<()> {
        validate_common(request, model)
    }

    async fn execute(&self, request: &StandardRequest, model: &Model) -> Result<StandardResponse> {
        let mut body = build_messages_body(request)?;
        body["model"] = json!(model.provider_model_id);
        debug!(model = %model.provider_model_id, "sending anthropic request");

        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(e, self.timeout))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(RelayError::from_upstream_status(status, text));
        }

        let data: Value = resp
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
        let mut body = build_messages_body(request)?;
        body["model"] = json!(model.provider_model_id);
        body["stream"] = json!(true);

        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
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
        tokio::spawn(pump_sse_stream(resp, model_id, tx));
        Ok(AdapterStream { rx })
    }
}
