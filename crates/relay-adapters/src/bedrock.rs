use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_bedrockruntime::Client;
use aws_sdk_bedrockruntime::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::types::ResponseStream;
use serde_json::json;
use tracing::debug;

use relay_core::{
    AdapterKind, Model, RelayError, Result, StandardRequest, StandardResponse,
};

use crate::adapter::*;
use crate::anthropic::{build_messages_body, parse_message_response};
use crate::stream::{AnthropicStreamTranslator, SseBuffer};

const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

/// Anthropic models served through the AWS invoke-model API. The request
/// body is the shared anthropic shape (minus the model id, which rides in
/// the SDK call); streaming events are the same anthropic events, re-framed
/// as SSE so the common translator consumes them identically.
pub struct BedrockAdapter {
    client: Client,
    timeout: std::time::Duration,
}

impl BedrockAdapter {
    pub async fn configure(creds: &ProviderCredentials, model: &Model) -> Result<Self> {
        let extra = merged_extra(creds, model);
        let region = match optional_extra(&extra, "region")? {
            Some(r) => r,
            None => std::env::var("AWS_REGION").map_err(|_| {
                RelayError::Configuration("bedrock: no region configured and AWS_REGION unset".into())
            })?,
        };

        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region))
            .load()
            .await;
        Ok(Self {
            client: Client::new(&shared),
            timeout: creds.timeout(),
        })
    }

    fn wire_body(request: &StandardRequest) -> Result<Vec<u8>> {
        let mut body = build_messages_body(request)?;
        body["anthropic_version"] = json!(BEDROCK_ANTHROPIC_VERSION);
        Ok(serde_json::to_vec(&body)?)
    }
}

fn classify_aws<E, R>(err: &SdkError<E, R>) -> RelayError
where
    E: ProvideErrorMetadata,
{
    let code = err.code().unwrap_or("");
    let message = err
        .message()
        .map(String::from)
        .unwrap_or_else(|| format!("bedrock call failed ({code})"));
    match code {
        "ValidationException" => RelayError::Validation(message),
        "ThrottlingException" | "ServiceQuotaExceededException" => {
            RelayError::RateLimited { retry_after_secs: 30 }
        }
        "ModelTimeoutException" => RelayError::Timeout { ms: 0 },
        "ResourceNotFoundException" | "AccessDeniedException" | "ModelNotReadyException" => {
            RelayError::Configuration(message)
        }
        "" => RelayError::Network(message),
        _ => RelayError::Api {
            status: 502,
            message: format!("{code}: {message}"),
        },
    }
}

#[async_trait]
impl ProtocolAdapter for BedrockAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::BedrockAnthropic
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn validate(&self, request: &StandardRequest, model: &Model) -> Result<()> {
        validate_common(request, model)
    }

    async fn execute(&self, request: &StandardRequest, model: &Model) -> Result<StandardResponse> {
        let body = Self::wire_body(request)?;
        debug!(model = %model.provider_model_id, "invoking bedrock model");

        let call = self
            .client
            .invoke_model()
            .model_id(&model.provider_model_id)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(body))
            .send();

        let output = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| RelayError::Timeout {
                ms: self.timeout.as_millis() as u64,
            })?
            .map_err(|e| classify_aws(&e))?;

        let data: serde_json::Value = serde_json::from_slice(output.body().as_ref())
            .map_err(|e| RelayError::Api {
                status: 502,
                message: format!("malformed bedrock response: {e}"),
            })?;
        parse_message_response(&data, &model.model_id)
    }

    async fn execute_stream(
        &self,
        request: &StandardRequest,
        model: &Model,
    ) -> Result<AdapterStream> {
        let body = Self::wire_body(request)?;

        let call = self
            .client
            .invoke_model_with_response_stream()
            .model_id(&model.provider_model_id)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(body))
            .send();

        let output = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| RelayError::Timeout {
                ms: self.timeout.as_millis() as u64,
            })?
            .map_err(|e| classify_aws(&e))?;

        let (tx, rx) = tokio::sync::mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let model_id = model.model_id.clone();

        tokio::spawn(async move {
            let mut event_stream = output.body;
            let mut buffer = SseBuffer::new();
            let mut translator = AnthropicStreamTranslator::new(model_id);

            loop {
                match event_stream.recv().await {
                    Ok(Some(ResponseStream::Chunk(part))) => {
                        let Some(blob) = part.bytes() else { continue };
                        // Re-frame the SDK payload as an SSE data line so the
                        // shared anthropic pipeline applies unchanged.
                        let framed =
                            format!("data: {}\n\n", String::from_utf8_lossy(blob.as_ref()));
                        for payload in buffer.push(framed.as_bytes()) {
                            let Ok(event) =
                                serde_json::from_str::<serde_json::Value>(&payload)
                            else {
                                continue;
                            };
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
                    Ok(Some(_)) => continue,
                    Ok(None) => return,
                    Err(e) => {
                        let _ = tx.send(Err(classify_aws(&e))).await;
                        return;
                    }
                }
            }
        });

        Ok(AdapterStream { rx })
    }
}
