use async_trait::async_trait;

use crate::error::Result;
use crate::request::ChatMessage;

/// Metadata attached to a wallet movement. `request_id` is the idempotency
/// key: the ledger must apply at most one debit per id.
#[derive(Debug, Clone)]
pub struct DebitMeta {
    pub request_id: String,
    pub model: String,
    pub provider: String,
}

/// The external billing ledger. Debits are serialized per user by the
/// implementation.
#[async_trait]
pub trait WalletLedger: Send + Sync {
    async fn balance(&self, user_id: &str) -> Result<f64>;

    /// Idempotent on `meta.request_id`.
    async fn debit(&self, user_id: &str, amount: f64, meta: DebitMeta) -> Result<()>;

    async fn credit(&self, user_id: &str, amount: f64, meta: DebitMeta) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Fire-and-forget notification channel for upstream 5xx/timeouts.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, severity: Severity, message: &str);
}

/// Prompt-size estimation. Approximations are acceptable; the estimate only
/// feeds the context-window filter and cost previews.
pub trait Tokenizer: Send + Sync {
    fn estimate_tokens(&self, messages: &[ChatMessage]) -> u32;
}

/// Default tokenizer: ~4 chars per token for English text, with a small
/// per-message overhead for role markers.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenizer;

impl Tokenizer for HeuristicTokenizer {
    fn estimate_tokens(&self, messages: &[ChatMessage]) -> u32 {
        let mut chars = 0usize;
        for msg in messages {
            chars += 16;
            chars += msg.text_content().len();
            if let Some(id) = &msg.tool_call_id {
                chars += id.len();
            }
            for tc in &msg.tool_calls {
                chars += tc.id.len();
                chars += tc.function.name.len();
                chars += tc.function.arguments.len();
            }
            if msg.has_image() {
                // Images count against the window as a flat block.
                chars += 4000;
            }
        }
        ((chars / 4).max(1)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Role;

    #[test]
    fn heuristic_scales_with_text() {
        let t = HeuristicTokenizer;
        let short = vec![ChatMessage::text(Role::User, "hi")];
        let long = vec![ChatMessage::text(Role::User, "word ".repeat(400))];
        assert!(t.estimate_tokens(&long) > t.estimate_tokens(&short) * 10);
    }
}
