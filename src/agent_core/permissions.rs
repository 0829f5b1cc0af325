//! Permission Arbiter — the single authority on whether a tool call may run.
//!
//! Resolution order for `decide()`:
//! 1. **Bypass** — process-wide flag fixed at construction. Allows immediately.
//! 2. **Session cache** — decisions keyed by `(tool_name, path_scope)`, scoped
//!    to one thread id. Never shared across sessions.
//! 3. **Approval channel** — human-in-the-loop. The turn blocks until answered.
//!
//! Only `AllowSession` answers are cached. `AllowOnce` and `Deny` apply to the
//! current call only, so a denied tool is asked about again next time.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::errors::AgentError;
use super::types::{
    ApprovalRequest, ApprovalResponse, DecisionLifetime, PermissionDecision, Verdict,
};
use crate::inference::types::ToolArguments;

// ─── Approval Channel ───────────────────────────────────────────────────────

/// Source of human approval for tool calls.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Ask for a decision. May wait indefinitely.
    async fn request(&self, request: ApprovalRequest) -> Result<ApprovalResponse, AgentError>;
}

/// An approval request awaiting an answer from the UI side.
#[derive(Debug)]
pub struct PendingApproval {
    pub request: ApprovalRequest,
    responder: oneshot::Sender<ApprovalResponse>,
}

impl PendingApproval {
    /// Answer the request. Returns `false` if the requester has gone away.
    pub fn respond(self, response: ApprovalResponse) -> bool {
        self.responder.send(response).is_ok()
    }
}

/// mpsc/oneshot bridge between the arbiter and a UI event loop.
#[derive(Debug, Clone)]
pub struct ChannelApproval {
    tx: mpsc::Sender<PendingApproval>,
}

impl ChannelApproval {
    /// Create the channel. The receiver yields one `PendingApproval` per
    /// solicitation.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ApprovalChannel for ChannelApproval {
    async fn request(&self, request: ApprovalRequest) -> Result<ApprovalResponse, AgentError> {
        let (responder, answer) = oneshot::channel();
        self.tx
            .send(PendingApproval { request, responder })
            .await
            .map_err(|_| AgentError::ApprovalChannelClosed {
                reason: "approval receiver dropped".into(),
            })?;
        answer.await.map_err(|_| AgentError::ApprovalChannelClosed {
            reason: "approval dropped without an answer".into(),
        })
    }
}

// ─── PermissionArbiter ──────────────────────────────────────────────────────

type DecisionKey = (String, Option<String>);

/// Brokers approval for capability invocations.
pub struct PermissionArbiter {
    bypass: bool,
    channel: std::sync::Arc<dyn ApprovalChannel>,
    /// thread id → (tool, scope) → cached decision.
    cache: Mutex<HashMap<String, HashMap<DecisionKey, PermissionDecision>>>,
}

impl PermissionArbiter {
    pub fn new(channel: std::sync::Arc<dyn ApprovalChannel>, bypass: bool) -> Self {
        if bypass {
            tracing::warn!("permission bypass enabled: tool calls will run without approval");
        }
        Self {
            bypass,
            channel,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn bypass_enabled(&self) -> bool {
        self.bypass
    }

    /// Resolve a decision for one tool call in `thread_id`.
    ///
    /// Never fails: an approval channel error is treated as a denial.
    pub async fn decide(
        &self,
        thread_id: &str,
        tool_name: &str,
        path_scope: Option<&str>,
        arguments: &ToolArguments,
    ) -> PermissionDecision {
        if self.bypass {
            return PermissionDecision {
                tool_name: tool_name.to_string(),
                path_scope: path_scope.map(String::from),
                verdict: Verdict::Allow,
                lifetime: DecisionLifetime::ForeverBypass,
            };
        }

        let key: DecisionKey = (tool_name.to_string(), path_scope.map(String::from));
        if let Some(cached) = self.lookup(thread_id, &key) {
            tracing::debug!(
                thread_id,
                tool = tool_name,
                scope = ?path_scope,
                "permission served from session cache"
            );
            return cached;
        }

        let request = ApprovalRequest {
            request_id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            tool_name: tool_name.to_string(),
            path_scope: path_scope.map(String::from),
            arguments: arguments.clone(),
            preview: generate_preview(tool_name, arguments),
            is_destructive: is_destructive_action(tool_name),
        };
        tracing::info!(
            thread_id,
            request_id = %request.request_id,
            tool = tool_name,
            scope = ?path_scope,
            destructive = request.is_destructive,
            "soliciting approval"
        );

        let response = match self.channel.request(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(thread_id, tool = tool_name, error = %e, "approval failed, denying");
                ApprovalResponse::Deny
            }
        };

        let (verdict, lifetime) = match response {
            ApprovalResponse::AllowOnce => (Verdict::Allow, DecisionLifetime::Once),
            ApprovalResponse::AllowSession => (Verdict::Allow, DecisionLifetime::Session),
            ApprovalResponse::Deny => (Verdict::Deny, DecisionLifetime::Once),
        };
        let decision = PermissionDecision {
            tool_name: key.0.clone(),
            path_scope: key.1.clone(),
            verdict,
            lifetime,
        };

        if lifetime != DecisionLifetime::Once {
            self.lock_cache()
                .entry(thread_id.to_string())
                .or_default()
                .insert(key, decision.clone());
        }

        tracing::info!(
            thread_id,
            tool = tool_name,
            verdict = ?verdict,
            lifetime = ?lifetime,
            "permission decided"
        );
        decision
    }

    /// Drop every cached decision for `thread_id`.
    pub fn clear_session(&self, thread_id: &str) {
        let removed = self.lock_cache().remove(thread_id);
        if let Some(decisions) = removed {
            tracing::info!(thread_id, cleared = decisions.len(), "session permissions cleared");
        }
    }

    /// Revoke one cached decision. Returns whether anything was removed.
    pub fn revoke(&self, thread_id: &str, tool_name: &str, path_scope: Option<&str>) -> bool {
        let key: DecisionKey = (tool_name.to_string(), path_scope.map(String::from));
        let removed = self
            .lock_cache()
            .get_mut(thread_id)
            .and_then(|decisions| decisions.remove(&key))
            .is_some();
        if removed {
            tracing::info!(thread_id, tool = tool_name, scope = ?path_scope, "permission revoked");
        }
        removed
    }

    /// Cached decisions for `thread_id`, sorted by tool then scope.
    pub fn session_decisions(&self, thread_id: &str) -> Vec<PermissionDecision> {
        let mut decisions: Vec<PermissionDecision> = self
            .lock_cache()
            .get(thread_id)
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default();
        decisions.sort_by(|a, b| {
            a.tool_name
                .cmp(&b.tool_name)
                .then_with(|| a.path_scope.cmp(&b.path_scope))
        });
        decisions
    }

    fn lookup(&self, thread_id: &str, key: &DecisionKey) -> Option<PermissionDecision> {
        self.lock_cache()
            .get(thread_id)
            .and_then(|decisions| decisions.get(key))
            .cloned()
    }

    fn lock_cache(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<DecisionKey, PermissionDecision>>> {
        // The cache holds plain data; a poisoned lock still has a usable map.
        self.cache.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ─── Previews ───────────────────────────────────────────────────────────────

/// Whether a tool performs a destructive action (delete, overwrite, exec).
pub fn is_destructive_action(tool_name: &str) -> bool {
    let name = tool_name.split('.').next_back().unwrap_or(tool_name);
    name.starts_with("delete")
        || name.starts_with("remove")
        || matches!(name, "write_file" | "run_shell" | "git_push" | "git_reset")
}

/// Generate a human-readable preview for a tool call.
pub fn generate_preview(tool_name: &str, arguments: &ToolArguments) -> String {
    let name = tool_name.split('.').next_back().unwrap_or(tool_name);
    let arg = |key: &str| {
        arguments
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("<unknown>")
            .to_string()
    };

    match name {
        "create_file" => format!("Create file: {}", arg("path")),
        "write_file" => format!("Write to file: {}", arg("path")),
        "delete_file" => format!("Delete file: {}", arg("path")),
        "move_file" => format!("Move: {} → {}", arg("source"), arg("destination")),
        "run_shell" => format!("Run command: {}", arg("command")),
        _ => {
            let rendered = serde_json::Value::Object(arguments.clone()).to_string();
            format!(
                "{tool_name}({})",
                crate::agent_core::tool_invoker::truncate_utf8(&rendered, 200)
            )
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
