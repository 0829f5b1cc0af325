//! ConversationEngine — one agent's turn-taking loop.
//!
//! A turn runs:
//! 1. Append the user message
//! 2. Invoke the model with `(system_prompt, history)` and append the reply
//! 3. No tool calls → `Done`, the reply is the turn's output
//! 4. Otherwise, per call in order: permission gate → invoke → append result
//! 5. Increment `step_count`; past the recursion limit → `Failed`
//! 6. Loop to 2 with no new user input
//!
//! Every append is followed by a checkpoint, so an interrupted turn can be
//! picked up by [`ConversationEngine::resume_turn`]. Tool faults and denials
//! always become tool-result messages; only turn-level faults (recursion
//! limit, model failure, cancellation, storage) surface as `AgentError`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::checkpoint::{CheckpointRecord, CheckpointStore};
use super::errors::{AgentError, ToolError};
use super::permissions::PermissionArbiter;
use super::tool_invoker::{render_tool_result, CapabilitySet, ToolInvoker};
use super::types::{AgentConfig, Session, TurnState};
use crate::inference::types::{Message, Role, StreamEvent, ToolCall};
use crate::inference::{InferenceError, ModelHandle};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Default maximum model/tool round trips per turn.
pub const DEFAULT_RECURSION_LIMIT: u32 = 25;

/// Default hard timeout for one capability execution.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Retrieval ──────────────────────────────────────────────────────────────

/// A passage returned by a retriever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub content: String,
    #[serde(default)]
    pub source: Option<String>,
}

/// Retrieval-augmented context source.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Up to `top_k` passages relevant to `query`, best first.
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        collections: &[String],
    ) -> Result<Vec<RetrievedDocument>, AgentError>;
}

/// Append retrieved passages to a system prompt, constraining the model to
/// answer from them.
pub fn merge_passages(system_prompt: &str, documents: &[RetrievedDocument]) -> String {
    let mut prompt = String::with_capacity(system_prompt.len() + 256);
    prompt.push_str(system_prompt);
    prompt.push_str(
        "\n\nAnswer ONLY from the passages below. If they do not contain the answer, say so.\n",
    );
    for (i, doc) in documents.iter().enumerate() {
        match &doc.source {
            Some(source) => prompt.push_str(&format!("\n[{}] ({source})\n{}\n", i + 1, doc.content)),
            None => prompt.push_str(&format!("\n[{}]\n{}\n", i + 1, doc.content)),
        }
    }
    prompt
}

// ─── ConversationEngine ─────────────────────────────────────────────────────

/// Per-agent state machine. One engine drives one session at a time.
pub struct ConversationEngine {
    agent_name: String,
    config: AgentConfig,
    model: Arc<dyn ModelHandle>,
    arbiter: Arc<PermissionArbiter>,
    invoker: ToolInvoker,
    store: Arc<dyn CheckpointStore>,
    retriever: Option<Arc<dyn Retriever>>,
    token_sink: Option<mpsc::UnboundedSender<String>>,
    recursion_limit: u32,
    tool_timeout: Duration,
    state: TurnState,
}

impl ConversationEngine {
    /// Build an engine for `config`. Only capabilities named in
    /// `config.capabilities` are visible to the model.
    pub fn new(
        agent_name: &str,
        config: AgentConfig,
        model: Arc<dyn ModelHandle>,
        arbiter: Arc<PermissionArbiter>,
        capabilities: &CapabilitySet,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        let invoker = ToolInvoker::new(capabilities.subset(&config.capabilities));
        Self {
            agent_name: agent_name.to_string(),
            config,
            model,
            arbiter,
            invoker,
            store,
            retriever: None,
            token_sink: None,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            state: TurnState::AwaitingModel,
        }
    }

    pub fn with_recursion_limit(mut self, limit: u32) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    /// Forward model text fragments to `sink` as they stream in.
    pub fn with_token_sink(mut self, sink: mpsc::UnboundedSender<String>) -> Self {
        self.token_sink = Some(sink);
        self
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Current state of the turn state machine.
    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Load the session for `thread_id` from the store, or start a new one.
    ///
    /// Fails with `PipelineThread` when the id holds a pipeline run record.
    pub async fn open_session(&self, thread_id: &str) -> Result<Session, AgentError> {
        match self.store.load(thread_id).await? {
            Some(record) if record.pipeline_context.is_some() => {
                tracing::warn!(
                    agent = %self.agent_name,
                    thread_id,
                    "refusing to open a pipeline run as a session"
                );
                Err(AgentError::PipelineThread {
                    thread_id: thread_id.to_string(),
                })
            }
            Some(record) => {
                tracing::info!(
                    agent = %self.agent_name,
                    thread_id,
                    messages = record.history.len(),
                    "session restored from checkpoint"
                );
                Ok(record.into_session())
            }
            None => Ok(Session::new(thread_id)),
        }
    }

    /// Run one turn for `user_input` to completion or a bounded failure.
    pub async fn run_turn(
        &mut self,
        session: &mut Session,
        user_input: &str,
        cancel: &CancellationToken,
    ) -> Result<Message, AgentError> {
        tracing::info!(
            agent = %self.agent_name,
            thread_id = %session.thread_id(),
            input_len = user_input.len(),
            "turn started"
        );
        session.reset_steps();
        self.close_interrupted_calls(session).await?;
        session.append(Message::user(user_input));
        self.checkpoint(session).await?;

        let result = self.drive(session, cancel, Vec::new()).await;
        self.finish(session, result)
    }

    /// Continue a turn interrupted before completion.
    ///
    /// Returns `Ok(None)` when the history ends with a final assistant reply
    /// (nothing to resume). Tool calls without results are dispatched first,
    /// each still going through the permission gate.
    pub async fn resume_turn(
        &mut self,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> Result<Option<Message>, AgentError> {
        let Some(pending) = pending_tool_calls(session) else {
            return Ok(None);
        };
        if session.step_count() > self.recursion_limit {
            // The turn already failed on its budget; only a new turn may continue.
            let exceeded = Err(AgentError::RecursionLimitExceeded {
                limit: self.recursion_limit,
            });
            return self.finish(session, exceeded).map(Some);
        }
        tracing::info!(
            agent = %self.agent_name,
            thread_id = %session.thread_id(),
            pending_calls = pending.len(),
            step_count = session.step_count(),
            "resuming interrupted turn"
        );
        let result = self.drive(session, cancel, pending).await;
        self.finish(session, result).map(Some)
    }

    /// Answer tool calls an interrupted turn left without a result, so the
    /// next user message never directly follows an unanswered call.
    async fn close_interrupted_calls(&self, session: &mut Session) -> Result<(), AgentError> {
        let unanswered = pending_tool_calls(session).unwrap_or_default();
        for call in unanswered {
            tracing::info!(
                agent = %self.agent_name,
                thread_id = %session.thread_id(),
                tool = %call.name,
                call_id = %call.id,
                "closing tool call left by an interrupted turn"
            );
            let content = render_tool_result(&Err(ToolError::Cancelled {
                tool: call.name.clone(),
            }));
            session.append(Message::tool_result(call.id, content));
            self.checkpoint(session).await?;
        }
        Ok(())
    }

    fn finish(
        &mut self,
        session: &Session,
        result: Result<Message, AgentError>,
    ) -> Result<Message, AgentError> {
        match &result {
            Ok(_) => {
                self.transition(session, TurnState::Done);
            }
            Err(e) => {
                self.transition(session, TurnState::Failed);
                tracing::warn!(
                    agent = %self.agent_name,
                    thread_id = %session.thread_id(),
                    error = %e,
                    "turn failed"
                );
            }
        }
        result
    }

    /// The model/tool loop. `pending` holds calls to dispatch before the next
    /// model invocation.
    async fn drive(
        &mut self,
        session: &mut Session,
        cancel: &CancellationToken,
        mut pending: Vec<ToolCall>,
    ) -> Result<Message, AgentError> {
        loop {
            if !pending.is_empty() {
                self.transition(session, TurnState::ExecutingTools);
                for call in pending.drain(..) {
                    let content = self.dispatch(session.thread_id(), &call, cancel).await?;
                    session.append(Message::tool_result(call.id, content));
                    self.checkpoint(session).await?;
                }

                let step = session.increment_steps();
                self.checkpoint(session).await?;
                if step > self.recursion_limit {
                    return Err(AgentError::RecursionLimitExceeded {
                        limit: self.recursion_limit,
                    });
                }
            }

            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            self.transition(session, TurnState::AwaitingModel);
            let system_prompt = self.system_prompt(session).await;
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                reply = self.call_model(&system_prompt, session.history()) => reply?,
            };

            tracing::info!(
                agent = %self.agent_name,
                thread_id = %session.thread_id(),
                step = session.step_count(),
                tool_calls = reply.tool_calls.len(),
                content_len = reply.content.len(),
                "model responded"
            );

            pending = reply.tool_calls.clone();
            session.append(reply.clone());
            self.checkpoint(session).await?;

            if pending.is_empty() {
                return Ok(reply);
            }
        }
    }

    /// Gate and execute one tool call, returning the tool-result content.
    ///
    /// Only cancellation escapes as an error.
    async fn dispatch(
        &self,
        thread_id: &str,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        // Unknown names are reported without soliciting approval.
        let capability = match self.invoker.lookup(&call.name) {
            Ok(capability) => capability,
            Err(e) => {
                tracing::warn!(thread_id, tool = %call.name, error = %e, "model requested unknown capability");
                return Ok(render_tool_result(&Err(e)));
            }
        };
        let path_scope = capability.descriptor().extract_path_scope(&call.arguments);

        let decision = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            decision = self.arbiter.decide(thread_id, &call.name, path_scope.as_deref(), &call.arguments) => decision,
        };
        if !decision.is_allowed() {
            tracing::info!(thread_id, tool = %call.name, scope = ?path_scope, "tool call denied");
            return Ok(render_tool_result(&Err(ToolError::PermissionDenied {
                tool: call.name.clone(),
                path_scope,
            })));
        }

        let outcome = self
            .invoker
            .invoke(&call.name, &call.arguments, self.tool_timeout, cancel)
            .await;
        if let Err(ToolError::Cancelled { .. }) = outcome {
            return Err(AgentError::Cancelled);
        }
        Ok(render_tool_result(&outcome))
    }

    async fn call_model(
        &self,
        system_prompt: &str,
        history: &[Message],
    ) -> Result<Message, AgentError> {
        let tools = self.invoker.capabilities().tool_specs();
        let Some(sink) = &self.token_sink else {
            return self
                .model
                .invoke(system_prompt, history, &tools)
                .await
                .map_err(AgentError::Model);
        };

        let mut stream = self
            .model
            .invoke_stream(system_prompt, history, &tools)
            .await
            .map_err(AgentError::Model)?;
        let mut final_message = None;
        while let Some(event) = stream.next().await {
            match event.map_err(AgentError::Model)? {
                StreamEvent::Token(text) => {
                    // A dropped receiver only means nobody is watching.
                    let _ = sink.send(text);
                }
                StreamEvent::Done(message) => final_message = Some(message),
            }
        }
        final_message.ok_or_else(|| {
            AgentError::Model(InferenceError::ResponseParseError {
                reason: "stream ended without a final message".into(),
            })
        })
    }

    /// The configured system prompt, with retrieved passages merged in when
    /// retrieval mode is on. Retrieval failures fall back to the bare prompt.
    async fn system_prompt(&self, session: &Session) -> String {
        let base = self.config.system_prompt.as_str();
        let (Some(settings), Some(retriever)) = (&self.config.retrieval, &self.retriever) else {
            return base.to_string();
        };
        let Some(query) = session.last_user_input() else {
            return base.to_string();
        };

        match retriever
            .retrieve(query, settings.top_k, &settings.collections)
            .await
        {
            Ok(documents) if !documents.is_empty() => {
                tracing::debug!(
                    agent = %self.agent_name,
                    passages = documents.len(),
                    "retrieved passages merged into prompt"
                );
                merge_passages(base, &documents)
            }
            Ok(_) => base.to_string(),
            Err(e) => {
                tracing::warn!(agent = %self.agent_name, error = %e, "retrieval failed, continuing without passages");
                base.to_string()
            }
        }
    }

    async fn checkpoint(&self, session: &Session) -> Result<(), AgentError> {
        self.store
            .save(&CheckpointRecord::from_session(session))
            .await
    }

    fn transition(&mut self, session: &Session, next: TurnState) {
        if self.state != next {
            tracing::debug!(
                agent = %self.agent_name,
                thread_id = %session.thread_id(),
                from = ?self.state,
                to = ?next,
                "turn state transition"
            );
            self.state = next;
        }
    }
}

/// Work left over from an interrupted turn.
///
/// `None` when the history is empty or ends with a final assistant reply.
/// Otherwise the calls of the last assistant message that have no result yet
/// (possibly empty, meaning the model is owed a new invocation).
fn pending_tool_calls(session: &Session) -> Option<Vec<ToolCall>> {
    let history = session.history();
    let last = history.last()?;
    if last.role == Role::Assistant && !last.has_tool_calls() {
        return None;
    }

    let Some(idx) = history.iter().rposition(|m| m.role == Role::Assistant) else {
        return Some(Vec::new());
    };
    let answered: Vec<&str> = history[idx + 1..]
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    Some(
        history[idx]
            .tool_calls
            .iter()
            .filter(|c| !answered.contains(&c.id.as_str()))
            .cloned()
            .collect(),
    )
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::checkpoint::MemoryCheckpointStore;
    use crate::agent_core::types::ApprovalResponse;
    use crate::test_support::{
        tool_call_reply, RecordingCapability, ScriptedApproval, ScriptedModel, SleepingCapability,
        StaticRetriever,
    };

    struct Harness {
        model: Arc<ScriptedModel>,
        approval: Arc<ScriptedApproval>,
        create: Arc<RecordingCapability>,
        store: Arc<MemoryCheckpointStore>,
        engine: ConversationEngine,
    }

    fn harness(script: Vec<Message>, approvals: Vec<ApprovalResponse>, bypass: bool) -> Harness {
        harness_with_model(Arc::new(ScriptedModel::new(script)), approvals, bypass)
    }

    fn harness_with_model(
        model: Arc<ScriptedModel>,
        approvals: Vec<ApprovalResponse>,
        bypass: bool,
    ) -> Harness {
        let approval = Arc::new(ScriptedApproval::new(approvals));
        let create = Arc::new(RecordingCapability::create_file());
        let mut caps = CapabilitySet::new();
        caps.register(create.clone());
        caps.register(Arc::new(SleepingCapability::new(
            "slow_op",
            Duration::from_secs(5),
        )));
        let store = Arc::new(MemoryCheckpointStore::new());
        let config = AgentConfig::new("test", "scripted", "You are a helpful agent.")
            .with_capability("create_file")
            .with_capability("slow_op");
        let engine = ConversationEngine::new(
            "coder",
            config,
            model.clone(),
            Arc::new(PermissionArbiter::new(approval.clone(), bypass)),
            &caps,
            store.clone(),
        );
        Harness {
            model,
            approval,
            create,
            store,
            engine,
        }
    }

    fn create_call(path: &str) -> Message {
        tool_call_reply("create_file", serde_json::json!({ "path": path }))
    }

    #[tokio::test]
    async fn test_plain_reply_is_done() {
        let mut h = harness(vec![Message::assistant("hello")], vec![], false);
        let mut session = Session::new("t");
        let reply = h
            .engine
            .run_turn(&mut session, "hi", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.content, "hello");
        assert_eq!(h.engine.state(), TurnState::Done);
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.step_count(), 0);
    }

    #[tokio::test]
    async fn test_denied_create_file_is_reported_to_model() {
        let mut h = harness(
            vec![create_call("/tmp/x"), Message::assistant("understood")],
            vec![ApprovalResponse::Deny],
            false,
        );
        let mut session = Session::new("t");
        let reply = h
            .engine
            .run_turn(&mut session, "create /tmp/x", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.content, "understood");
        assert!(h.create.calls().is_empty(), "no file may be created");
        assert_eq!(h.approval.request_count(), 1);

        let tool_msg = &session.history()[2];
        assert_eq!(tool_msg.role, Role::Tool);
        assert!(tool_msg.content.contains("Permission denied"));
        assert!(tool_msg.content.contains("/tmp/x"));

        // The second model call saw the denial.
        let seen = h.model.history_at(1);
        assert!(seen.iter().any(|m| m.content.contains("Permission denied")));
    }

    #[tokio::test]
    async fn test_bypass_executes_without_approval() {
        let mut h = harness(
            vec![create_call("/tmp/x"), Message::assistant("created")],
            vec![],
            true,
        );
        let mut session = Session::new("t");
        h.engine
            .run_turn(&mut session, "create /tmp/x", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.approval.request_count(), 0);
        assert_eq!(h.create.calls().len(), 1);
        assert_eq!(session.history()[2].content, "created /tmp/x");
    }

    #[tokio::test]
    async fn test_timeout_becomes_tool_result() {
        let mut h = harness(
            vec![
                tool_call_reply("slow_op", serde_json::json!({})),
                Message::assistant("it timed out"),
            ],
            vec![ApprovalResponse::AllowOnce],
            false,
        );
        h.engine = h.engine.with_tool_timeout(Duration::from_millis(20));
        let mut session = Session::new("t");
        let reply = h
            .engine
            .run_turn(&mut session, "go", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.content, "it timed out");
        assert!(session.history()[2].content.contains("timed out after 20ms"));
        assert_eq!(h.engine.state(), TurnState::Done);
    }

    #[tokio::test]
    async fn test_unknown_capability_skips_approval() {
        let mut h = harness(
            vec![
                tool_call_reply("create_fiel", serde_json::json!({ "path": "/a" })),
                Message::assistant("sorry"),
            ],
            vec![],
            false,
        );
        let mut session = Session::new("t");
        h.engine
            .run_turn(&mut session, "go", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.approval.request_count(), 0);
        let content = &session.history()[2].content;
        assert!(content.contains("unknown capability"));
        assert!(content.contains("create_file"));
    }

    #[tokio::test]
    async fn test_recursion_limit_terminates_loop() {
        let model = Arc::new(ScriptedModel::looping(create_call("/tmp/loop")));
        let mut h = harness_with_model(model, vec![], true);
        h.engine = h.engine.with_recursion_limit(3);
        let mut session = Session::new("t");

        let err = h
            .engine
            .run_turn(&mut session, "loop forever", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::RecursionLimitExceeded { limit: 3 }));
        assert_eq!(h.engine.state(), TurnState::Failed);
        assert_eq!(session.step_count(), 4);
        assert_eq!(h.model.invocations(), 4);

        // The session is still usable for a new turn.
        let stored = h.store.load("t").await.unwrap().unwrap();
        assert_eq!(stored.history.len(), session.history().len());
        assert_eq!(stored.step_count, 4);
    }

    #[tokio::test]
    async fn test_session_allow_is_reused_within_turn() {
        let mut h = harness(
            vec![
                create_call("/tmp/a"),
                create_call("/tmp/a"),
                Message::assistant("done"),
            ],
            vec![ApprovalResponse::AllowSession],
            false,
        );
        let mut session = Session::new("t");
        h.engine
            .run_turn(&mut session, "twice", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.approval.request_count(), 1);
        assert_eq!(h.create.calls().len(), 2);
        assert_eq!(session.step_count(), 2);
    }

    #[tokio::test]
    async fn test_checkpoint_after_every_append() {
        let mut h = harness(
            vec![create_call("/tmp/a"), Message::assistant("ok")],
            vec![ApprovalResponse::AllowOnce],
            false,
        );
        let mut session = Session::new("t");
        h.engine
            .run_turn(&mut session, "go", &CancellationToken::new())
            .await
            .unwrap();
        let stored = h.store.load("t").await.unwrap().unwrap().into_session();
        assert_eq!(stored, session);
    }

    #[tokio::test]
    async fn test_cancel_before_model_call() {
        let mut h = harness(vec![Message::assistant("never")], vec![], false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut session = Session::new("t");
        let err = h.engine.run_turn(&mut session, "hi", &cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(h.model.invocations(), 0);

        // The user message was checkpointed and the turn can be resumed.
        let mut restored = h.engine.open_session("t").await.unwrap();
        assert_eq!(restored.history().len(), 1);
        let reply = h
            .engine
            .resume_turn(&mut restored, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.map(|m| m.content), Some("never".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_during_tool_leaves_call_pending() {
        let mut h = harness(
            vec![
                tool_call_reply("slow_op", serde_json::json!({})),
                Message::assistant("finished"),
            ],
            vec![ApprovalResponse::AllowOnce, ApprovalResponse::AllowOnce],
            false,
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let mut session = Session::new("t");
        let err = h.engine.run_turn(&mut session, "go", &cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        let pending = pending_tool_calls(&session).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "slow_op");
    }

    #[tokio::test]
    async fn test_new_turn_after_cancelled_tool_closes_the_call() {
        let mut h = harness(
            vec![
                tool_call_reply("slow_op", serde_json::json!({})),
                Message::assistant("answer"),
            ],
            vec![ApprovalResponse::AllowOnce],
            false,
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let mut session = Session::new("t");
        h.engine.run_turn(&mut session, "go", &cancel).await.unwrap_err();
        let call_id = session.history()[1].tool_calls[0].id.clone();

        let reply = h
            .engine
            .run_turn(&mut session, "next question", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.content, "answer");

        // The model saw a result for the interrupted call before the new input.
        let seen = h.model.history_at(1);
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[2].role, Role::Tool);
        assert_eq!(seen[2].tool_call_id.as_deref(), Some(call_id.as_str()));
        assert!(seen[2].content.contains("cancelled"));
        assert_eq!(seen[3].content, "next question");
        assert!(pending_tool_calls(&session).is_none());

        let stored = h.store.load("t").await.unwrap().unwrap().into_session();
        assert_eq!(stored, session);
    }

    #[tokio::test]
    async fn test_resume_after_recursion_limit_does_not_invoke_model() {
        let model = Arc::new(ScriptedModel::looping(create_call("/tmp/loop")));
        let mut h = harness_with_model(model, vec![], true);
        h.engine = h.engine.with_recursion_limit(3);
        let mut session = Session::new("t");
        h.engine
            .run_turn(&mut session, "loop forever", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(h.model.invocations(), 4);

        let err = h
            .engine
            .resume_turn(&mut session, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::RecursionLimitExceeded { limit: 3 }));
        assert_eq!(h.model.invocations(), 4);
        assert_eq!(session.step_count(), 4);
        assert_eq!(h.engine.state(), TurnState::Failed);

        // A fresh turn starts a new budget.
        h.engine
            .run_turn(&mut session, "again", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(h.model.invocations(), 8);
    }

    #[tokio::test]
    async fn test_resume_dispatches_unanswered_calls() {
        let mut h = harness(
            vec![Message::assistant("all done")],
            vec![ApprovalResponse::AllowOnce],
            false,
        );
        let call = create_call("/tmp/r");
        let mut session = Session::restore(
            "t",
            vec![Message::user("make it"), call],
            0,
            chrono::Utc::now(),
        );
        let reply = h
            .engine
            .resume_turn(&mut session, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.content, "all done");
        assert_eq!(h.create.calls().len(), 1);
        assert_eq!(session.history()[2].role, Role::Tool);
        assert_eq!(session.step_count(), 1);
    }

    #[tokio::test]
    async fn test_resume_completed_turn_is_noop() {
        let mut h = harness(vec![], vec![], false);
        let mut session = Session::restore(
            "t",
            vec![Message::user("hi"), Message::assistant("hello")],
            0,
            chrono::Utc::now(),
        );
        let resumed = h
            .engine
            .resume_turn(&mut session, &CancellationToken::new())
            .await
            .unwrap();
        assert!(resumed.is_none());
        assert_eq!(h.model.invocations(), 0);
    }

    #[tokio::test]
    async fn test_model_error_fails_turn() {
        let mut h = harness(vec![], vec![], false);
        let mut session = Session::new("t");
        let err = h
            .engine
            .run_turn(&mut session, "hi", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Model(_)));
        assert_eq!(h.engine.state(), TurnState::Failed);
    }

    #[tokio::test]
    async fn test_retrieval_merges_passages() {
        let mut h = harness(vec![Message::assistant("answer")], vec![], false);
        h.engine.config = h.engine.config.clone().with_retrieval(2, &["docs"]);
        let retriever = Arc::new(StaticRetriever::new(vec![RetrievedDocument {
            content: "The sky is blue.".into(),
            source: Some("facts.md".into()),
        }]));
        h.engine = h.engine.with_retriever(retriever.clone());

        let mut session = Session::new("t");
        h.engine
            .run_turn(&mut session, "what colour is the sky?", &CancellationToken::new())
            .await
            .unwrap();

        let prompt = h.model.system_prompt_at(0);
        assert!(prompt.starts_with("You are a helpful agent."));
        assert!(prompt.contains("Answer ONLY from the passages"));
        assert!(prompt.contains("[1] (facts.md)"));
        assert_eq!(
            retriever.queries(),
            vec![("what colour is the sky?".to_string(), 2, vec!["docs".to_string()])]
        );
    }

    #[tokio::test]
    async fn test_retrieval_failure_falls_back() {
        let mut h = harness(vec![Message::assistant("answer")], vec![], false);
        h.engine.config = h.engine.config.clone().with_retrieval(2, &[]);
        h.engine = h.engine.with_retriever(Arc::new(StaticRetriever::failing()));
        let mut session = Session::new("t");
        h.engine
            .run_turn(&mut session, "q", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.model.system_prompt_at(0), "You are a helpful agent.");
    }

    #[tokio::test]
    async fn test_token_sink_receives_stream() {
        let mut h = harness(vec![Message::assistant("streamed text")], vec![], false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.engine = h.engine.with_token_sink(tx);
        let mut session = Session::new("t");
        let reply = h
            .engine
            .run_turn(&mut session, "hi", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.content, "streamed text");
        assert_eq!(rx.recv().await.as_deref(), Some("streamed text"));
    }

    #[test]
    fn test_merge_passages_without_source() {
        let prompt = merge_passages(
            "sys",
            &[RetrievedDocument {
                content: "alpha".into(),
                source: None,
            }],
        );
        assert!(prompt.ends_with("[1]\nalpha\n"));
    }
}
