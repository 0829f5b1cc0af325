//! Scripted collaborators shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::agent_core::conversation::{RetrievedDocument, Retriever};
use crate::agent_core::errors::AgentError;
use crate::agent_core::orchestrator::{CompletionPredicate, PipelineContext, StageVerdict};
use crate::agent_core::permissions::ApprovalChannel;
use crate::agent_core::tool_invoker::{Capability, CapabilityDescriptor, CapabilityError};
use crate::agent_core::types::{ApprovalRequest, ApprovalResponse};
use crate::inference::types::{Message, ToolArguments, ToolCall, ToolSpec};
use crate::inference::{InferenceError, ModelHandle};

/// An assistant message carrying one tool call.
pub fn tool_call_reply(name: &str, arguments: serde_json::Value) -> Message {
    let arguments = match arguments {
        serde_json::Value::Object(map) => map,
        _ => ToolArguments::new(),
    };
    Message::assistant_with_calls(
        "",
        vec![ToolCall {
            id: format!("call_{}", Uuid::new_v4()),
            name: name.to_string(),
            arguments,
        }],
    )
}

// ─── Model ──────────────────────────────────────────────────────────────────

/// Model handle replaying a fixed script of replies.
pub struct ScriptedModel {
    script: Mutex<VecDeque<Message>>,
    /// Returned forever once the script is exhausted.
    fallback: Option<Message>,
    histories: Mutex<Vec<Vec<Message>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Message>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            histories: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A model that answers `reply` to every invocation.
    pub fn looping(reply: Message) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::new(Vec::new())
        }
    }

    pub fn invocations(&self) -> usize {
        self.histories.lock().unwrap().len()
    }

    /// History passed to the `n`th invocation.
    pub fn history_at(&self, n: usize) -> Vec<Message> {
        self.histories.lock().unwrap()[n].clone()
    }

    /// System prompt passed to the `n`th invocation.
    pub fn system_prompt_at(&self, n: usize) -> String {
        self.prompts.lock().unwrap()[n].clone()
    }
}

#[async_trait]
impl ModelHandle for ScriptedModel {
    fn model_name(&self) -> &str {
        "test/scripted"
    }

    async fn invoke(
        &self,
        system_prompt: &str,
        history: &[Message],
        _tools: &[ToolSpec],
    ) -> Result<Message, InferenceError> {
        self.histories.lock().unwrap().push(history.to_vec());
        self.prompts.lock().unwrap().push(system_prompt.to_string());

        let next = self.script.lock().unwrap().pop_front();
        let reply = next.or_else(|| self.fallback.clone()).ok_or(
            InferenceError::ResponseParseError {
                reason: "script exhausted".into(),
            },
        )?;

        // Fresh call ids per reply so looping scripts stay unambiguous.
        let tool_calls = reply
            .tool_calls
            .into_iter()
            .map(|c| ToolCall {
                id: format!("call_{}", Uuid::new_v4()),
                ..c
            })
            .collect();
        Ok(Message::assistant_with_calls(reply.content, tool_calls))
    }
}

// ─── Approval ───────────────────────────────────────────────────────────────

/// Approval channel answering from a script; denies once exhausted.
pub struct ScriptedApproval {
    responses: Mutex<VecDeque<ApprovalResponse>>,
    requests: Mutex<Vec<ApprovalRequest>>,
}

impl ScriptedApproval {
    pub fn new(responses: Vec<ApprovalResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ApprovalChannel for ScriptedApproval {
    async fn request(&self, request: ApprovalRequest) -> Result<ApprovalResponse, AgentError> {
        self.requests.lock().unwrap().push(request);
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ApprovalResponse::Deny))
    }
}

// ─── Capabilities ───────────────────────────────────────────────────────────

/// Capability recording every call; succeeds or fails as configured.
pub struct RecordingCapability {
    descriptor: CapabilityDescriptor,
    failure: Option<CapabilityError>,
    calls: Mutex<Vec<ToolArguments>>,
}

impl RecordingCapability {
    /// `create_file`: path-sensitive on `path`, which is required.
    pub fn create_file() -> Self {
        Self {
            descriptor: CapabilityDescriptor::new("create_file", "Create a file")
                .path_sensitive(&["path"])
                .with_schema(serde_json::json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"]
                })),
            failure: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(name: &str, kind: &str, message: &str) -> Self {
        Self {
            descriptor: CapabilityDescriptor::new(name, "Always fails"),
            failure: Some(CapabilityError::new(kind, message)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ToolArguments> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Capability for RecordingCapability {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn execute(&self, arguments: &ToolArguments) -> Result<String, CapabilityError> {
        self.calls.lock().unwrap().push(arguments.clone());
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        let path = arguments
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(format!("created {path}"))
    }
}

/// Capability that sleeps longer than any sensible timeout.
pub struct SleepingCapability {
    descriptor: CapabilityDescriptor,
    duration: Duration,
}

impl SleepingCapability {
    pub fn new(name: &str, duration: Duration) -> Self {
        Self {
            descriptor: CapabilityDescriptor::new(name, "Sleeps"),
            duration,
        }
    }
}

#[async_trait]
impl Capability for SleepingCapability {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn execute(&self, _arguments: &ToolArguments) -> Result<String, CapabilityError> {
        tokio::time::sleep(self.duration).await;
        Ok("woke up".into())
    }
}

// ─── Retrieval ──────────────────────────────────────────────────────────────

type RetrievalQuery = (String, usize, Vec<String>);

/// Retriever returning a fixed passage list (or always failing).
pub struct StaticRetriever {
    documents: Option<Vec<RetrievedDocument>>,
    queries: Mutex<Vec<RetrievalQuery>>,
}

impl StaticRetriever {
    pub fn new(documents: Vec<RetrievedDocument>) -> Self {
        Self {
            documents: Some(documents),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            documents: None,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<RetrievalQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Retriever for StaticRetriever {
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        collections: &[String],
    ) -> Result<Vec<RetrievedDocument>, AgentError> {
        self.queries
            .lock()
            .unwrap()
            .push((query.to_string(), top_k, collections.to_vec()));
        match &self.documents {
            Some(docs) => Ok(docs.iter().take(top_k).cloned().collect()),
            None => Err(AgentError::ConfigError {
                reason: "vector store offline".into(),
            }),
        }
    }
}

// ─── Predicates ─────────────────────────────────────────────────────────────

/// Predicate that never accepts and counts evaluations.
#[derive(Default)]
pub struct NeverSatisfied {
    evaluations: AtomicUsize,
}

impl NeverSatisfied {
    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionPredicate for NeverSatisfied {
    async fn evaluate(&self, stage: &str, _output: &str, _context: &PipelineContext) -> StageVerdict {
        let n = self.evaluations.fetch_add(1, Ordering::SeqCst) + 1;
        StageVerdict::refine(format!("{stage} attempt {n} rejected"))
    }
}
