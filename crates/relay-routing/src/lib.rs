//! # relay-routing
//!
//! Everything that decides *where* a request goes: the model registry
//! snapshot, the 3-D provider selector, and the family router that expands
//! meta-model aliases through an evaluator call.

pub mod family;
pub mod registry;
pub mod selector;

pub use family::{ComplexityEvaluator, FamilyRouter, RoutedTarget};
pub use registry::{ModelRegistry, ModelSource, StaticModelSource};
pub use selector::{ProviderSelector, DEFAULT_SPEED_VS_PRICE};
