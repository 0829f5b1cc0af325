//! Agent Core error types.
//!
//! Two tiers:
//! - [`ToolError`] — capability-level faults. Always recovered locally into a
//!   tool-result message; never escape a turn.
//! - [`AgentError`] — turn, session, pipeline and construction faults.

use thiserror::Error;

use crate::inference::InferenceError;

/// Faults raised while dispatching a single tool call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    /// The model named a capability the agent does not have.
    #[error("unknown capability: '{name}'{}", format_suggestions(suggestions))]
    UnknownCapability {
        name: String,
        suggestions: Vec<String>,
    },

    /// The capability did not finish within its timeout.
    #[error("tool '{tool}' timed out after {timeout_ms}ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    /// The capability raised a fault.
    #[error("tool '{tool}' failed ({kind}): {message}")]
    ToolExecutionError {
        tool: String,
        kind: String,
        message: String,
    },

    /// The turn was cancelled while the capability was running.
    #[error("tool '{tool}' cancelled before completing")]
    Cancelled { tool: String },

    /// The user declined the call. Nothing was executed.
    #[error(
        "Permission denied: the user declined '{tool}'{}. The action was not performed.",
        format_scope(path_scope)
    )]
    PermissionDenied {
        tool: String,
        path_scope: Option<String>,
    },
}

fn format_scope(path_scope: &Option<String>) -> String {
    match path_scope {
        Some(scope) => format!(" on {scope}"),
        None => String::new(),
    }
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {}?)", suggestions.join(", "))
    }
}

/// Errors that can occur during agent core operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The turn exceeded its model/tool round-trip budget.
    #[error("recursion limit of {limit} steps exceeded")]
    RecursionLimitExceeded { limit: u32 },

    /// A model invocation failed mid-turn.
    #[error("model invocation failed: {0}")]
    Model(#[source] InferenceError),

    /// Provider resolution or validation failed at construction time.
    #[error("provider configuration error: {0}")]
    ProviderConfig(#[source] InferenceError),

    /// A pipeline stage could not produce an output.
    #[error("pipeline stage '{stage}' failed: {reason}")]
    PipelineStageFailure { stage: String, reason: String },

    /// A stored checkpoint could not be decoded.
    #[error("checkpoint for thread '{thread_id}' is corrupt: {reason}")]
    CheckpointCorruption { thread_id: String, reason: String },

    /// Database operation failed.
    #[error("database error: {reason}")]
    DatabaseError { reason: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },

    /// Another engine or pipeline holds this thread id.
    #[error("thread '{thread_id}' is already active")]
    ThreadBusy { thread_id: String },

    /// The thread id names a pipeline run, not a conversation.
    #[error("thread '{thread_id}' belongs to a pipeline run")]
    PipelineThread { thread_id: String },

    /// The turn was cancelled by the caller.
    #[error("turn cancelled")]
    Cancelled,

    /// The approval channel went away before answering.
    #[error("approval channel closed: {reason}")]
    ApprovalChannelClosed { reason: String },

    /// No agent is configured under this name.
    #[error("unknown agent: '{name}'")]
    UnknownAgent { name: String },

    /// No pipeline is configured under this name.
    #[error("unknown pipeline: '{name}'")]
    UnknownPipeline { name: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::DatabaseError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}

impl From<InferenceError> for AgentError {
    fn from(e: InferenceError) -> Self {
        if e.is_construction_error() {
            AgentError::ProviderConfig(e)
        } else {
            AgentError::Model(e)
        }
    }
}
