use std::collections::HashMap;

use relay_core::{
    ChunkChoice, Delta, DeltaFunction, DeltaToolCall, FinishReason, Role, StreamChunk, Usage,
};

/// Accumulates raw bytes and yields complete SSE `data:` payloads.
/// `event:` lines and comments are skipped; the JSON payloads are
/// self-describing via their `type` field.
pub(crate) struct SseBuffer {
    buf: String,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self { buf: String::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
        let mut payloads = Vec::new();
        while let Some(newline_pos) = self.buf.find('\n') {
            let line = self.buf[..newline_pos].trim().to_string();
            self.buf = self.buf[newline_pos + 1..].to_string();

            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data: ") {
                payloads.push(data.to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

/// State machine translating anthropic streaming events into OpenAI-shaped
/// chunks. One instance per stream; `message_start` usage is held so the
/// full usage block can be reconstructed at `message_delta`.
pub struct AnthropicStreamTranslator {
    id: String,
    model: String,
    created: i64,
    input_tokens: u32,
    cached_tokens: u32,
    /// Upstream content-block index → OpenAI tool-call slot.
    tool_slots: HashMap<u64, u32>,
    next_slot: u32,
    finished: bool,
}

impl AnthropicStreamTranslator {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            input_tokens: 0,
            cached_tokens: 0,
            tool_slots: HashMap::new(),
            next_slot: 0,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn chunk(&self) -> StreamChunk {
        StreamChunk::new(self.id.clone(), self.model.clone(), self.created)
    }

    fn chunk_with(&self, delta: Delta, finish_reason: Option<FinishReason>) -> StreamChunk {
        let mut chunk = self.chunk();
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        });
        chunk
    }

    /// Translate one upstream event into zero or more chunks.
    /// Unknown event types (ping, content_block_stop) translate to nothing.
    pub fn translate(&mut self, event: &serde_json::Value) -> Vec<StreamChunk> {
        match event["type"].as_str() {
            Some("message_start") => {
                let usage = &event["message"]["usage"];
                let input = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
                let cache_read = usage["cache_read_input_tokens"].as_u64().unwrap_or(0) as u32;
                let cache_write =
                    usage["cache_creation_input_tokens"].as_u64().unwrap_or(0) as u32;
                self.input_tokens = input + cache_read + cache_write;
                self.cached_tokens = cache_read;

                vec![self.chunk_with(
                    Delta {
                        role: Some(Role::Assistant),
                        ..Default::default()
                    },
                    None,
                )]
            }
            Some("content_block_start") => {
                let block = &event["content_block"];
                if block["type"].as_str() != Some("tool_use") {
                    return vec![];
                }
                let upstream_index = event["index"].as_u64().unwrap_or(0);
                let slot = self.next_slot;
                self.next_slot += 1;
                self.tool_slots.insert(upstream_index, slot);

                vec![self.chunk_with(
                    Delta {
                        tool_calls: vec![DeltaToolCall {
                            index: slot,
                            id: block["id"].as_str().map(String::from),
                            kind: Some("function".into()),
                            function: Some(DeltaFunction {
                                name: block["name"].as_str().map(String::from),
                                arguments: Some(String::new()),
                            }),
                        }],
                        ..Default::default()
                    },
                    None,
                )]
            }
            Some("content_block_delta") => {
                let delta = &event["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let Some(text) = delta["text"].as_str() else {
                            return vec![];
                        };
                        vec![self.chunk_with(
                            Delta {
                                content: Some(text.to_string()),
                                ..Default::default()
                            },
                            None,
                        )]
                    }
                    Some("input_json_delta") => {
                        let Some(partial) = delta["partial_json"].as_str() else {
                            return vec![];
                        };
                        let upstream_index = event["index"].as_u64().unwrap_or(0);
                        let Some(&slot) = self.tool_slots.get(&upstream_index) else {
                            return vec![];
                        };
                        vec![self.chunk_with(
                            Delta {
                                tool_calls: vec![DeltaToolCall {
                                    index: slot,
                                    id: None,
                                    kind: None,
                                    function: Some(DeltaFunction {
                                        name: None,
                                        arguments: Some(partial.to_string()),
                                    }),
                                }],
                                ..Default::default()
                            },
                            None,
                        )]
                    }
                    _ => vec![],
                }
            }
            Some("message_delta") => {
                let finish = event["delta"]["stop_reason"]
                    .as_str()
                    .map(crate::anthropic::map_stop_reason);
                let mut chunk = self.chunk_with(Delta::default(), finish);
                if let Some(output) = event["usage"]["output_tokens"].as_u64() {
                    let cached = (self.cached_tokens > 0).then_some(self.cached_tokens);
                    chunk.usage = Some(Usage::new(self.input_tokens, output as u32, cached));
                }
                vec![chunk]
            }
            Some("message_stop") => {
                self.finished = true;
                self.tool_slots.clear();
                vec![self.chunk_with(Delta::default(), Some(FinishReason::Stop))]
            }
            _ => vec![],
        }
    }
}
