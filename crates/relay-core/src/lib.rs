//! # relay-core
//!
//! Core types, traits, and primitives for the Relay LLM gateway.
//! This crate defines the shared vocabulary used by every other crate in the
//! workspace: the canonical request/response shapes, the model table row, the
//! error taxonomy, and the traits for external collaborators (wallet,
//! metrics store, notifier, tokenizer).

pub mod auth;
pub mod cache;
pub mod error;
pub mod metrics;
pub mod model;
pub mod ports;
pub mod request;
pub mod response;

pub use auth::{ApiKeyInfo, AuthData, AuthMethod, UserInfo};
pub use cache::TtlCache;
pub use error::{ErrorKind, RelayError, Result};
pub use metrics::{CallOutcome, MetricsSample, MetricsStore, PerfStats};
pub use model::{AdapterKind, Model, ProviderCombination};
pub use ports::{DebitMeta, HeuristicTokenizer, Notifier, Severity, Tokenizer, WalletLedger};
pub use request::{
    ChatMessage, ContentPart, FunctionCall, FunctionDef, ImageUrl, MessageContent, ModelRef,
    NamedFunction, Role, StandardRequest, StopSpec, ToolCallSpec, ToolChoice, ToolChoiceMode,
    ToolSpec,
};
pub use response::{
    Choice, ChunkChoice, Delta, DeltaFunction, DeltaToolCall, FinishReason, ResponseMessage,
    StandardResponse, StreamChunk, Usage,
};
