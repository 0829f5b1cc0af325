//! Tool Invoker — dispatches approved tool calls to capabilities.
//!
//! Responsibilities:
//! - Look up the capability in the agent's `CapabilitySet`
//! - Validate required arguments against the descriptor's input schema
//! - Execute with a hard timeout, racing the turn's cancellation token
//! - Render every outcome (success or `ToolError`) as tool-result text
//!
//! Nothing here returns an engine-level error: every fault becomes a
//! `ToolError`, which the engine appends as a tool-result message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::errors::ToolError;
use crate::inference::types::{ToolArguments, ToolSpec};

/// Maximum bytes of tool output appended to history.
pub const MAX_TOOL_RESULT_BYTES: usize = 6000;

/// Maximum "did you mean" suggestions for an unknown capability.
const MAX_SUGGESTIONS: usize = 3;

// ─── Capability Interface ───────────────────────────────────────────────────

/// How a capability's permission is scoped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PermissionScope {
    /// One decision covers every invocation.
    Global,
    /// Decisions are keyed by the path found under the first present key.
    PathSensitive { keys: Vec<String> },
}

/// Static description of a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,
    pub permission_scope: PermissionScope,
    /// JSON Schema of the arguments object.
    pub input_schema: serde_json::Value,
}

impl CapabilityDescriptor {
    /// A global-scope capability with an empty object schema.
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            permission_scope: PermissionScope::Global,
            input_schema: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }

    /// Builder: scope decisions by the path under `keys`.
    pub fn path_sensitive(mut self, keys: &[&str]) -> Self {
        self.permission_scope = PermissionScope::PathSensitive {
            keys: keys.iter().map(|k| k.to_string()).collect(),
        };
        self
    }

    pub fn with_schema(mut self, input_schema: serde_json::Value) -> Self {
        self.input_schema = input_schema;
        self
    }

    /// The path scope for a call with `arguments`, if path-sensitive.
    pub fn extract_path_scope(&self, arguments: &ToolArguments) -> Option<String> {
        match &self.permission_scope {
            PermissionScope::Global => None,
            PermissionScope::PathSensitive { keys } => keys
                .iter()
                .find_map(|k| arguments.get(k).and_then(|v| v.as_str()))
                .map(String::from),
        }
    }

    /// Names listed in `input_schema.required` that are absent.
    pub fn missing_arguments(&self, arguments: &ToolArguments) -> Vec<String> {
        self.input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|required| {
                required
                    .iter()
                    .filter_map(|v| v.as_str())
                    .filter(|k| !arguments.contains_key(*k))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn to_tool_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }
}

/// Fault raised by a capability implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct CapabilityError {
    pub kind: String,
    pub message: String,
}

impl CapabilityError {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

/// An external, side-effecting operation the model can invoke.
#[async_trait]
pub trait Capability: Send + Sync {
    fn descriptor(&self) -> &CapabilityDescriptor;

    async fn execute(&self, arguments: &ToolArguments) -> Result<String, CapabilityError>;
}

// ─── CapabilitySet ──────────────────────────────────────────────────────────

/// Named collection of capabilities. Last registration wins.
#[derive(Clone, Default)]
pub struct CapabilitySet {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under its descriptor name.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.descriptor().name.clone();
        if self.capabilities.insert(name.clone(), capability).is_some() {
            tracing::warn!(capability = %name, "capability registration overrides existing entry");
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities.get(name)
    }

    /// Sorted capability names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// The subset named in `allowed`. Names with no capability are logged and
    /// skipped.
    pub fn subset<'a>(&self, allowed: impl IntoIterator<Item = &'a String>) -> CapabilitySet {
        let mut subset = CapabilitySet::new();
        for name in allowed {
            match self.capabilities.get(name) {
                Some(cap) => {
                    subset.capabilities.insert(name.clone(), cap.clone());
                }
                None => {
                    tracing::warn!(capability = %name, "agent config names an unregistered capability");
                }
            }
        }
        subset
    }

    /// Tool specs advertised to the model, sorted by name.
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.names()
            .iter()
            .filter_map(|n| self.capabilities.get(n))
            .map(|c| c.descriptor().to_tool_spec())
            .collect()
    }

    /// Capability names similar to `name`, closest first.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let mut scored: Vec<(String, f64)> = self
            .capabilities
            .keys()
            .map(|n| (n.clone(), similarity(name, n)))
            .filter(|(_, score)| *score > 0.3)
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(max_results);
        scored.into_iter().map(|(n, _)| n).collect()
    }
}

// ─── ToolInvoker ────────────────────────────────────────────────────────────

/// Executes tool calls against one agent's capability set.
#[derive(Clone)]
pub struct ToolInvoker {
    capabilities: CapabilitySet,
}

impl ToolInvoker {
    pub fn new(capabilities: CapabilitySet) -> Self {
        Self { capabilities }
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Look up a capability, or build the `UnknownCapability` error.
    pub fn lookup(&self, name: &str) -> Result<&Arc<dyn Capability>, ToolError> {
        self.capabilities
            .get(name)
            .ok_or_else(|| ToolError::UnknownCapability {
                name: name.to_string(),
                suggestions: self.capabilities.find_similar(name, MAX_SUGGESTIONS),
            })
    }

    /// Execute `name` with `arguments`, bounded by `timeout` and `cancel`.
    ///
    /// On success the output is truncated to `MAX_TOOL_RESULT_BYTES`.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: &ToolArguments,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        let capability = self.lookup(name)?;

        let missing = capability.descriptor().missing_arguments(arguments);
        if !missing.is_empty() {
            return Err(ToolError::ToolExecutionError {
                tool: name.to_string(),
                kind: "invalid_arguments".into(),
                message: format!("missing required argument(s): {}", missing.join(", ")),
            });
        }

        let start = std::time::Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ToolError::Cancelled { tool: name.to_string() }),
            result = tokio::time::timeout(timeout, capability.execute(arguments)) => match result {
                Ok(Ok(output)) => Ok(truncate_output(&output)),
                Ok(Err(e)) => Err(ToolError::ToolExecutionError {
                    tool: name.to_string(),
                    kind: e.kind,
                    message: e.message,
                }),
                Err(_) => Err(ToolError::ToolTimeout {
                    tool: name.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            },
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &outcome {
            Ok(output) => {
                tracing::info!(tool = name, elapsed_ms, output_len = output.len(), "tool executed");
            }
            Err(e) => tracing::warn!(tool = name, elapsed_ms, error = %e, "tool failed"),
        }
        outcome
    }
}

// ─── Output Formatting ──────────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes`, respecting UTF-8 char boundaries.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_TOOL_RESULT_BYTES {
        return output.to_string();
    }
    format!(
        "{}\n\n[Output truncated: {} of {} bytes shown]",
        truncate_utf8(output, MAX_TOOL_RESULT_BYTES),
        MAX_TOOL_RESULT_BYTES,
        output.len()
    )
}

/// Content of the tool-result message for an invocation outcome.
pub fn render_tool_result(outcome: &Result<String, ToolError>) -> String {
    match outcome {
        Ok(output) => output.clone(),
        Err(e) => format!("Error: {e}"),
    }
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Normalized similarity (0.0 = unrelated, 1.0 = identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingCapability, SleepingCapability};

    fn invoker() -> (ToolInvoker, Arc<RecordingCapability>) {
        let create = Arc::new(RecordingCapability::create_file());
        let mut set = CapabilitySet::new();
        set.register(create.clone());
        set.register(Arc::new(SleepingCapability::new("slow_op", Duration::from_secs(5))));
        (ToolInvoker::new(set), create)
    }

    fn path_args(path: &str) -> ToolArguments {
        let mut a = ToolArguments::new();
        a.insert("path".into(), serde_json::json!(path));
        a
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let (invoker, create) = invoker();
        let out = invoker
            .invoke("create_file", &path_args("/tmp/a"), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "created /tmp/a");
        assert_eq!(create.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_capability_suggests() {
        let (invoker, _) = invoker();
        let err = invoker
            .invoke("create_fille", &ToolArguments::new(), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ToolError::UnknownCapability { name, suggestions } => {
                assert_eq!(name, "create_fille");
                assert_eq!(suggestions.first().map(String::as_str), Some("create_file"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_required_argument() {
        let (invoker, create) = invoker();
        let err = invoker
            .invoke("create_file", &ToolArguments::new(), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ToolExecutionError { ref kind, .. } if kind == "invalid_arguments"));
        assert!(create.calls().is_empty());
    }

    #[tokio::test]
    async fn test_timeout() {
        let (invoker, _) = invoker();
        let err = invoker
            .invoke("slow_op", &ToolArguments::new(), Duration::from_millis(20), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ToolError::ToolTimeout {
                tool: "slow_op".into(),
                timeout_ms: 20
            }
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_execution() {
        let (invoker, _) = invoker();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = invoker
            .invoke("slow_op", &ToolArguments::new(), Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_capability_fault_is_wrapped() {
        let failing = Arc::new(RecordingCapability::failing("flaky", "io", "disk full"));
        let mut set = CapabilitySet::new();
        set.register(failing);
        let invoker = ToolInvoker::new(set);
        let err = invoker
            .invoke("flaky", &ToolArguments::new(), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(render_tool_result(&Err(err)), "Error: tool 'flaky' failed (io): disk full");
    }

    #[test]
    fn test_path_scope_extraction() {
        let global = CapabilityDescriptor::new("git_status", "status");
        assert_eq!(global.extract_path_scope(&path_args("/x")), None);

        let scoped = CapabilityDescriptor::new("move_file", "move").path_sensitive(&["source", "path"]);
        assert_eq!(scoped.extract_path_scope(&path_args("/x")).as_deref(), Some("/x"));
        assert_eq!(scoped.extract_path_scope(&ToolArguments::new()), None);
    }

    #[test]
    fn test_subset_skips_unknown_names() {
        let (invoker, _) = invoker();
        let wanted = vec!["create_file".to_string(), "ghost".to_string()];
        let subset = invoker.capabilities().subset(&wanted);
        assert_eq!(subset.names(), vec!["create_file".to_string()]);
        assert_eq!(subset.tool_specs()[0].name, "create_file");
    }

    #[test]
    fn test_truncate_output_on_char_boundary() {
        let long = "é".repeat(MAX_TOOL_RESULT_BYTES);
        let out = truncate_output(&long);
        assert!(out.contains("[Output truncated"));
        assert!(out.len() < long.len());

        assert_eq!(truncate_utf8("héllo", 2), "h");
        assert_eq!(truncate_output("short"), "short");
    }

    #[test]
    fn test_render_tool_result() {
        assert_eq!(render_tool_result(&Ok("created".into())), "created");
        let denied = render_tool_result(&Err(ToolError::PermissionDenied {
            tool: "create_file".into(),
            path_scope: Some("/tmp/x".into()),
        }));
        assert!(denied.starts_with("Error: Permission denied"));
        assert!(denied.contains("/tmp/x"));
    }

    #[test]
    fn test_similarity() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert!((similarity("abc", "abc") - 1.0).abs() < f64::EPSILON);
    }
}
