//! Inference — model providers and the handles they produce.
//!
//! This module owns everything between the conversation engine and a model
//! endpoint:
//! - `ModelHandle`, the invocation seam the engine calls
//! - `ProviderRegistry`, built-ins plus YAML-manifest plugins
//! - An OpenAI-compatible HTTP client shared by every provider, with SSE
//!   streaming
//!
//! Switching providers is a config change, not a code change.

pub mod builtin;
pub mod client;
pub mod discovery;
pub mod errors;
pub mod handle;
pub mod registry;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use client::{EndpointSettings, OpenAiCompatHandle};
pub use discovery::{discover_plugins, register_plugins, ProviderManifest};
pub use errors::InferenceError;
pub use handle::ModelHandle;
pub use registry::{
    ConfigValidator, ModelFactory, ProviderConfig, ProviderDescriptor, ProviderInfo,
    ProviderRegistry,
};
pub use types::{Message, Role, StreamEvent, ToolArguments, ToolCall, ToolSpec};
