//! Shared types for the agent core.
//!
//! Session state, permission decisions, approval requests and agent
//! configuration used across the engine, arbiter and orchestrator.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::inference::types::{Message, ToolArguments};

// ─── Sessions ───────────────────────────────────────────────────────────────

/// Durable, resumable conversation state for one thread id.
///
/// History is append-only: the only mutator is [`Session::append`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    thread_id: String,
    history: Vec<Message>,
    step_count: u32,
    created_at: DateTime<Utc>,
}

impl Session {
    /// A fresh, empty session.
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            history: Vec::new(),
            step_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Rebuild a session from persisted state.
    pub fn restore(
        thread_id: impl Into<String>,
        history: Vec<Message>,
        step_count: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            history,
            step_count,
            created_at,
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Content of the most recent user message, if any.
    pub fn last_user_input(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == crate::inference::types::Role::User)
            .map(|m| m.content.as_str())
    }

    pub(crate) fn append(&mut self, message: Message) {
        self.history.push(message);
    }

    pub(crate) fn reset_steps(&mut self) {
        self.step_count = 0;
    }

    pub(crate) fn increment_steps(&mut self) -> u32 {
        self.step_count += 1;
        self.step_count
    }
}

// ─── Permissions ────────────────────────────────────────────────────────────

/// Outcome of a permission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
}

/// How long a decision stays in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionLifetime {
    /// Applies to this call only; never cached.
    Once,
    /// Cached until the session is cleared.
    Session,
    /// Process-wide bypass set at startup.
    ForeverBypass,
}

/// A resolved verdict for `(tool_name, path_scope)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub tool_name: String,
    pub path_scope: Option<String>,
    pub verdict: Verdict,
    pub lifetime: DecisionLifetime,
}

impl PermissionDecision {
    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }
}

/// Answer from the human (or UI) on the approval channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalResponse {
    AllowOnce,
    AllowSession,
    Deny,
}

/// Request sent over the approval channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// Unique request ID for matching responses.
    pub request_id: String,
    pub thread_id: String,
    pub tool_name: String,
    pub path_scope: Option<String>,
    pub arguments: ToolArguments,
    /// Human-readable preview of what will happen.
    pub preview: String,
    /// Whether this is a destructive action (delete, overwrite).
    pub is_destructive: bool,
}

// ─── Agent Configuration ────────────────────────────────────────────────────

/// Retrieval mode settings for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSettings {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub collections: Vec<String>,
}

fn default_top_k() -> usize {
    4
}

/// Immutable configuration of one agent (one engine instance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Empty selects the provider's default model.
    #[serde(default)]
    pub model_name: String,
    pub provider: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub system_prompt: String,
    /// Capability names this agent may call.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub retrieval: Option<RetrievalSettings>,
    /// Provider-specific options passed to the factory.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

fn default_temperature() -> f32 {
    0.1
}

impl AgentConfig {
    /// Minimal config for `provider` with no capabilities.
    pub fn new(provider: &str, model_name: &str, system_prompt: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            provider: provider.to_string(),
            temperature: default_temperature(),
            api_key: None,
            system_prompt: system_prompt.to_string(),
            capabilities: BTreeSet::new(),
            retrieval: None,
            options: serde_json::Map::new(),
        }
    }

    /// Builder: allow a capability by name.
    pub fn with_capability(mut self, name: &str) -> Self {
        self.capabilities.insert(name.to_string());
        self
    }

    /// Builder: enable retrieval mode.
    pub fn with_retrieval(mut self, top_k: usize, collections: &[&str]) -> Self {
        self.retrieval = Some(RetrievalSettings {
            top_k,
            collections: collections.iter().map(|c| c.to_string()).collect(),
        });
        self
    }
}

// ─── Turn State ─────────────────────────────────────────────────────────────

/// Engine state machine. Initial state is `AwaitingModel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    AwaitingModel,
    ExecutingTools,
    Done,
    Failed,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Done | TurnState::Failed)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
