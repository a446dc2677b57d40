//! # relay-adapters
//!
//! One adapter per upstream wire protocol. Each adapter translates the
//! canonical request into its backend's native format, executes it (plain or
//! streaming), translates the response back, and classifies failures into
//! the gateway's error taxonomy.
//!
//! The set is closed: construction is a match on [`relay_core::AdapterKind`].

pub mod adapter;
pub mod anthropic;
pub mod azure;
pub mod bedrock;
pub mod mock;
pub mod openai;
pub mod prompt_cache;
pub mod stream;
pub mod vertex;

pub use adapter::{
    AdapterFactory, AdapterStream, DefaultAdapterFactory, ProtocolAdapter, ProviderCredentials,
};

use relay_core::{AdapterKind, Model, Result};

/// Build a configured adapter for a model. Fails with a configuration error
/// when required credentials or environment references are unresolved.
pub async fn configure_adapter(
    credentials: &ProviderCredentials,
    model: &Model,
) -> Result<Box<dyn ProtocolAdapter>> {
    Ok(match model.adapter {
        AdapterKind::Openai => Box::new(openai::OpenAiAdapter::configure(credentials, model)?),
        AdapterKind::AzureOpenai => Box::new(azure::AzureAdapter::configure(credentials, model)?),
        AdapterKind::AnthropicNative => {
            Box::new(anthropic::AnthropicAdapter::configure(credentials, model)?)
        }
        AdapterKind::BedrockAnthropic => {
            Box::new(bedrock::BedrockAdapter::configure(credentials, model).await?)
        }
        AdapterKind::VertexAnthropic => {
            Box::new(vertex::VertexAdapter::configure(credentials, model)?)
        }
    })
}
