//! # relay-config
//!
//! Configuration for the Relay gateway: the `relay.toml` document (server,
//! gateway knobs, provider credentials, the model table) and the
//! `families.yaml` routing document for meta-model aliases.

pub mod families;
pub mod loader;
pub mod schema;

pub use families::{FamiliesDocument, FamilyEntry, FamilySettings, RoutingConfig, ScoreRange};
pub use loader::ConfigLoader;
pub use schema::{
    ApiKeyEntry, AuthConfig, GatewayConfig, LoggingConfig, NotificationConfig, ProviderConfig,
    RelayConfig, ServerConfig,
};
