//! Agent Core — orchestration layer for Ally.
//!
//! Submodules:
//! - `conversation`: Turn state machine driving model and tool round trips
//! - `permissions`: Permission arbiter (once / session / bypass) and approval channels
//! - `tool_invoker`: Capability registry and bounded tool execution
//! - `checkpoint`: Versioned session and pipeline checkpoints (memory, SQLite)
//! - `orchestrator`: Multi-stage pipelines with bounded refinement
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod checkpoint;
pub mod conversation;
pub mod errors;
pub mod orchestrator;
pub mod permissions;
pub mod tool_invoker;
pub mod types;

// Re-exports for convenience
pub use checkpoint::{
    CheckpointRecord, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore, ThreadLeases,
};
pub use conversation::{ConversationEngine, RetrievedDocument, Retriever};
pub use errors::{AgentError, ToolError};
pub use orchestrator::{
    AlwaysAccept, CompletionPredicate, FnPredicate, PipelineContext, PipelineDefinition,
    PipelineOrchestrator, PipelineOutcome, PipelineStatus, ReviewChannel, ReviewerApproval,
    StageVerdict,
};
pub use permissions::{ApprovalChannel, ChannelApproval, PendingApproval, PermissionArbiter};
pub use tool_invoker::{Capability, CapabilityDescriptor, CapabilityError, CapabilitySet, ToolInvoker};
pub use types::{
    AgentConfig, ApprovalRequest, ApprovalResponse, DecisionLifetime, PermissionDecision, Session,
    TurnState, Verdict,
};
