//! # relay-gateway
//!
//! The end-to-end request pipeline: resolve the model (expanding family
//! aliases), rank providers, walk the ranking with fallback, stream the
//! winning response through without buffering, account cost, debit the
//! wallet, and emit metrics.
//!
//! Also home to the in-memory implementations of the external collaborators
//! (wallet ledger, metrics store, notifier) used by the default wiring and
//! the test suite.

pub mod cost;
pub mod evaluator;
pub mod metrics_store;
pub mod notify;
pub mod orchestrator;
pub mod wallet;

pub use cost::compute_cost;
pub use evaluator::AdapterEvaluator;
pub use metrics_store::InMemoryMetricsStore;
pub use notify::{NullNotifier, WebhookNotifier};
pub use orchestrator::{
    Completion, CostEstimate, Orchestrator, OrchestratorConfig, StreamEvent, StreamingCompletion,
};
pub use wallet::InMemoryWallet;
