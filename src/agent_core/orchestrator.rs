//! Pipeline Orchestrator — sequences agents into a multi-stage workflow.
//!
//! A pipeline is a fixed, ordered list of stages, each bound to one
//! `ConversationEngine` and one `CompletionPredicate`:
//!
//! ```text
//! spec ──accept──▶ generate ──accept──▶ verify ──accept──▶ Completed
//!   ▲                 │ refine (≤ max_refinements)
//!   └── re-entry ─────┘            exhausted ──▶ AbortedIncomplete
//! ```
//!
//! Artifacts are append-only per stage: every stage run adds a revision and
//! nothing is discarded, including on backward re-entry or abort. The
//! `PipelineContext` is checkpointed under the run id after every
//! transition, so an interrupted run can be resumed.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::checkpoint::{CheckpointRecord, CheckpointStore, ThreadLeases};
use super::conversation::ConversationEngine;
use super::errors::AgentError;

/// Default bound on refinement loops per run.
pub const DEFAULT_MAX_REFINEMENTS: u32 = 2;

// ─── Definitions ────────────────────────────────────────────────────────────

/// One named stage bound to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub agent: String,
}

/// A named, ordered list of stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub stages: Vec<StageDefinition>,
    #[serde(default = "default_max_refinements")]
    pub max_refinements: u32,
}

fn default_max_refinements() -> u32 {
    DEFAULT_MAX_REFINEMENTS
}

impl PipelineDefinition {
    /// Build from `(stage, agent)` pairs.
    pub fn new(name: &str, stages: &[(&str, &str)], max_refinements: u32) -> Self {
        Self {
            name: name.to_string(),
            stages: stages
                .iter()
                .map(|(stage, agent)| StageDefinition {
                    name: stage.to_string(),
                    agent: agent.to_string(),
                })
                .collect(),
            max_refinements,
        }
    }

    pub fn stage_index(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == stage)
    }

    /// At least one stage; stage names unique.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.stages.is_empty() {
            return Err(AgentError::ConfigError {
                reason: format!("pipeline '{}' has no stages", self.name),
            });
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if self.stages[..i].iter().any(|s| s.name == stage.name) {
                return Err(AgentError::ConfigError {
                    reason: format!(
                        "pipeline '{}' declares stage '{}' twice",
                        self.name, stage.name
                    ),
                });
            }
        }
        Ok(())
    }
}

// ─── Context ────────────────────────────────────────────────────────────────

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Running,
    Completed,
    AbortedIncomplete,
}

fn default_status() -> PipelineStatus {
    PipelineStatus::Running
}

/// Shared state of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    pub pipeline: String,
    /// Current stage name.
    pub stage: String,
    #[serde(default)]
    pub stage_index: usize,
    /// Stage name → revisions, oldest first.
    #[serde(default)]
    pub artifacts: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub refinement_count: u32,
    #[serde(default = "default_max_refinements")]
    pub max_refinements: u32,
    #[serde(default)]
    pub initial_input: String,
    /// Feedback merged into the current stage's next input.
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default = "default_status")]
    pub status: PipelineStatus,
}

impl PipelineContext {
    pub fn new(definition: &PipelineDefinition, initial_input: &str) -> Self {
        Self {
            pipeline: definition.name.clone(),
            stage: definition
                .stages
                .first()
                .map(|s| s.name.clone())
                .unwrap_or_default(),
            stage_index: 0,
            artifacts: BTreeMap::new(),
            refinement_count: 0,
            max_refinements: definition.max_refinements,
            initial_input: initial_input.to_string(),
            feedback: None,
            status: PipelineStatus::Running,
        }
    }

    /// Most recent artifact of `stage`.
    pub fn latest_artifact(&self, stage: &str) -> Option<&str> {
        self.artifacts
            .get(stage)
            .and_then(|revisions| revisions.last())
            .map(String::as_str)
    }

    pub fn revisions(&self, stage: &str) -> usize {
        self.artifacts.get(stage).map_or(0, Vec::len)
    }

    fn record_artifact(&mut self, stage: &str, content: String) {
        self.artifacts.entry(stage.to_string()).or_default().push(content);
    }
}

// ─── Completion Predicates ──────────────────────────────────────────────────

/// Result of evaluating a stage's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageVerdict {
    Accept,
    /// Run again. `reenter` names an earlier stage to go back to; `None`
    /// repeats the current stage.
    Refine {
        feedback: Option<String>,
        reenter: Option<String>,
    },
}

impl StageVerdict {
    /// Repeat the current stage with `feedback`.
    pub fn refine(feedback: impl Into<String>) -> Self {
        StageVerdict::Refine {
            feedback: Some(feedback.into()),
            reenter: None,
        }
    }

    /// Go back to `stage` with `feedback`.
    pub fn reenter(stage: &str, feedback: impl Into<String>) -> Self {
        StageVerdict::Refine {
            feedback: Some(feedback.into()),
            reenter: Some(stage.to_string()),
        }
    }
}

/// Decides whether a stage's output lets the pipeline advance.
#[async_trait]
pub trait CompletionPredicate: Send + Sync {
    async fn evaluate(&self, stage: &str, output: &str, context: &PipelineContext)
        -> StageVerdict;
}

/// Accepts every output.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAccept;

#[async_trait]
impl CompletionPredicate for AlwaysAccept {
    async fn evaluate(&self, _stage: &str, _output: &str, _context: &PipelineContext) -> StageVerdict {
        StageVerdict::Accept
    }
}

/// Predicate backed by a synchronous closure (e.g. "output parses as JSON").
pub struct FnPredicate<F>(pub F);

#[async_trait]
impl<F> CompletionPredicate for FnPredicate<F>
where
    F: Fn(&str, &str, &PipelineContext) -> StageVerdict + Send + Sync,
{
    async fn evaluate(&self, stage: &str, output: &str, context: &PipelineContext) -> StageVerdict {
        (self.0)(stage, output, context)
    }
}

/// What a reviewer is asked to judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    pub pipeline: String,
    pub stage: String,
    pub output: String,
    pub refinement_count: u32,
    pub max_refinements: u32,
}

/// A reviewer's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewResponse {
    Accept,
    Revise {
        feedback: String,
        #[serde(default)]
        reenter: Option<String>,
    },
}

/// Human review of stage output ("specification accepted by user").
#[async_trait]
pub trait ReviewChannel: Send + Sync {
    async fn review(&self, request: ReviewRequest) -> Result<ReviewResponse, AgentError>;
}

/// Predicate that defers to a `ReviewChannel`. A failed review counts as a
/// refinement request without feedback.
pub struct ReviewerApproval {
    channel: Arc<dyn ReviewChannel>,
}

impl ReviewerApproval {
    pub fn new(channel: Arc<dyn ReviewChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl CompletionPredicate for ReviewerApproval {
    async fn evaluate(&self, stage: &str, output: &str, context: &PipelineContext) -> StageVerdict {
        let request = ReviewRequest {
            pipeline: context.pipeline.clone(),
            stage: stage.to_string(),
            output: output.to_string(),
            refinement_count: context.refinement_count,
            max_refinements: context.max_refinements,
        };
        match self.channel.review(request).await {
            Ok(ReviewResponse::Accept) => StageVerdict::Accept,
            Ok(ReviewResponse::Revise { feedback, reenter }) => StageVerdict::Refine {
                feedback: Some(feedback),
                reenter,
            },
            Err(e) => {
                tracing::warn!(stage, error = %e, "review failed, treating as refinement");
                StageVerdict::Refine {
                    feedback: None,
                    reenter: None,
                }
            }
        }
    }
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

/// A stage with its engine and predicate, ready to run.
pub struct PipelineStage {
    pub definition: StageDefinition,
    pub engine: ConversationEngine,
    pub predicate: Arc<dyn CompletionPredicate>,
}

/// Terminal result of a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub run_id: String,
    pub status: PipelineStatus,
    pub context: PipelineContext,
}

/// Drives the stages of one pipeline definition.
pub struct PipelineOrchestrator {
    definition: PipelineDefinition,
    stages: Vec<PipelineStage>,
    store: Arc<dyn CheckpointStore>,
    leases: ThreadLeases,
}

impl PipelineOrchestrator {
    /// Assemble an orchestrator. `stages` must match the definition's stage
    /// order; engines are expected to be fully constructed already.
    pub fn new(
        definition: PipelineDefinition,
        stages: Vec<PipelineStage>,
        store: Arc<dyn CheckpointStore>,
        leases: ThreadLeases,
    ) -> Result<Self, AgentError> {
        definition.validate()?;
        let matches = stages.len() == definition.stages.len()
            && stages
                .iter()
                .zip(&definition.stages)
                .all(|(s, d)| s.definition.name == d.name);
        if !matches {
            return Err(AgentError::ConfigError {
                reason: format!(
                    "pipeline '{}' stages do not match their definition",
                    definition.name
                ),
            });
        }
        Ok(Self {
            definition,
            stages,
            store,
            leases,
        })
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Start a new run under a generated run id.
    pub async fn run(
        &mut self,
        initial_input: &str,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, AgentError> {
        let run_id = format!("{}-{}", self.definition.name, Uuid::new_v4());
        self.run_with_id(&run_id, initial_input, cancel).await
    }

    /// Start a new run under `run_id`, which must not exist yet.
    pub async fn run_with_id(
        &mut self,
        run_id: &str,
        initial_input: &str,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, AgentError> {
        let _lease = self.leases.acquire(run_id)?;
        if self.store.load(run_id).await?.is_some() {
            return Err(AgentError::ConfigError {
                reason: format!("pipeline run '{run_id}' already exists; resume it instead"),
            });
        }

        let context = PipelineContext::new(&self.definition, initial_input);
        let created_at = Utc::now();
        tracing::info!(
            pipeline = %self.definition.name,
            run_id,
            stages = self.stages.len(),
            max_refinements = self.definition.max_refinements,
            "pipeline run started"
        );
        self.save_context(run_id, &context, created_at).await?;
        self.execute(run_id, context, created_at, cancel, false).await
    }

    /// Continue an interrupted run from its last checkpoint. A run that
    /// already reached a terminal state is returned as-is.
    pub async fn resume(
        &mut self,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, AgentError> {
        let _lease = self.leases.acquire(run_id)?;
        let record = self
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| AgentError::UnknownPipeline {
                name: run_id.to_string(),
            })?;
        let created_at = record.created_at;
        let context = record
            .pipeline_context
            .ok_or_else(|| AgentError::CheckpointCorruption {
                thread_id: run_id.to_string(),
                reason: "record has no pipeline context".into(),
            })?;
        if context.pipeline != self.definition.name || context.stage_index >= self.stages.len() {
            return Err(AgentError::CheckpointCorruption {
                thread_id: run_id.to_string(),
                reason: format!(
                    "run belongs to pipeline '{}' at stage {}",
                    context.pipeline, context.stage_index
                ),
            });
        }

        if context.status != PipelineStatus::Running {
            return Ok(PipelineOutcome {
                run_id: run_id.to_string(),
                status: context.status,
                context,
            });
        }
        tracing::info!(
            pipeline = %self.definition.name,
            run_id,
            stage = %context.stage,
            refinement_count = context.refinement_count,
            "pipeline run resumed"
        );
        self.execute(run_id, context, created_at, cancel, true).await
    }

    async fn execute(
        &mut self,
        run_id: &str,
        mut ctx: PipelineContext,
        created_at: DateTime<Utc>,
        cancel: &CancellationToken,
        mut resuming: bool,
    ) -> Result<PipelineOutcome, AgentError> {
        loop {
            let idx = ctx.stage_index;
            let stage_name = self.stages[idx].definition.name.clone();
            let input = compose_stage_input(&self.definition, &ctx, &stage_name);
            let thread_id = stage_thread_id(run_id, &stage_name);

            tracing::info!(
                pipeline = %self.definition.name,
                run_id,
                stage = %stage_name,
                refinement_count = ctx.refinement_count,
                "stage started"
            );

            let stage = &mut self.stages[idx];
            let mut session = stage.engine.open_session(&thread_id).await?;
            let result = if std::mem::take(&mut resuming) {
                match stage.engine.resume_turn(&mut session, cancel).await {
                    Ok(Some(reply)) => Ok(reply),
                    Ok(None) => stage.engine.run_turn(&mut session, &input, cancel).await,
                    Err(e) => Err(e),
                }
            } else {
                stage.engine.run_turn(&mut session, &input, cancel).await
            };

            let verdict = match result {
                Ok(reply) => {
                    ctx.record_artifact(&stage_name, reply.content.clone());
                    stage
                        .predicate
                        .evaluate(&stage_name, &reply.content, &ctx)
                        .await
                }
                Err(e @ (AgentError::RecursionLimitExceeded { .. } | AgentError::Model(_))) => {
                    let failure = AgentError::PipelineStageFailure {
                        stage: stage_name.clone(),
                        reason: e.to_string(),
                    };
                    tracing::warn!(run_id, error = %failure, "stage failed");
                    StageVerdict::refine(failure.to_string())
                }
                Err(e) => {
                    self.save_context(run_id, &ctx, created_at).await?;
                    return Err(e);
                }
            };

            self.apply_verdict(&mut ctx, verdict);
            self.save_context(run_id, &ctx, created_at).await?;

            if ctx.status != PipelineStatus::Running {
                tracing::info!(
                    pipeline = %self.definition.name,
                    run_id,
                    status = ?ctx.status,
                    refinement_count = ctx.refinement_count,
                    artifacts = ctx.artifacts.len(),
                    "pipeline run finished"
                );
                return Ok(PipelineOutcome {
                    run_id: run_id.to_string(),
                    status: ctx.status,
                    context: ctx,
                });
            }
        }
    }

    fn apply_verdict(&self, ctx: &mut PipelineContext, verdict: StageVerdict) {
        let idx = ctx.stage_index;
        match verdict {
            StageVerdict::Accept => {
                ctx.feedback = None;
                if idx + 1 == self.stages.len() {
                    ctx.status = PipelineStatus::Completed;
                } else {
                    ctx.stage_index = idx + 1;
                    ctx.stage = self.definition.stages[idx + 1].name.clone();
                    tracing::debug!(stage = %ctx.stage, "stage accepted, advancing");
                }
            }
            StageVerdict::Refine { feedback, reenter } => {
                if ctx.refinement_count >= ctx.max_refinements {
                    tracing::warn!(
                        stage = %ctx.stage,
                        refinements = ctx.refinement_count,
                        "refinement budget exhausted"
                    );
                    ctx.status = PipelineStatus::AbortedIncomplete;
                    return;
                }

                let target = match reenter.as_deref() {
                    None => idx,
                    Some(name) => match self.definition.stage_index(name) {
                        Some(t) if t <= idx => t,
                        _ => {
                            tracing::warn!(
                                requested = name,
                                current = %ctx.stage,
                                "re-entry target is not an earlier stage, repeating current"
                            );
                            idx
                        }
                    },
                };
                ctx.refinement_count += 1;
                ctx.stage_index = target;
                ctx.stage = self.definition.stages[target].name.clone();
                ctx.feedback = feedback;
                tracing::info!(
                    stage = %ctx.stage,
                    refinement_count = ctx.refinement_count,
                    max_refinements = ctx.max_refinements,
                    "refinement requested"
                );
            }
        }
    }

    async fn save_context(
        &self,
        run_id: &str,
        ctx: &PipelineContext,
        created_at: DateTime<Utc>,
    ) -> Result<(), AgentError> {
        self.store
            .save(&CheckpointRecord::for_pipeline(run_id, ctx.clone(), created_at))
            .await
    }
}

/// Thread id of a stage's session within a run.
pub fn stage_thread_id(run_id: &str, stage: &str) -> String {
    format!("{run_id}/{stage}")
}

/// Stage input: the run's initial input, the latest artifact of every other
/// stage (pipeline order), then any pending feedback.
fn compose_stage_input(definition: &PipelineDefinition, ctx: &PipelineContext, stage: &str) -> String {
    let mut input = ctx.initial_input.clone();

    let others: Vec<(&str, &str)> = definition
        .stages
        .iter()
        .filter(|s| s.name != stage)
        .filter_map(|s| ctx.latest_artifact(&s.name).map(|a| (s.name.as_str(), a)))
        .collect();
    if !others.is_empty() {
        input.push_str("\n\n## Artifacts from other stages\n");
        for (name, artifact) in others {
            input.push_str(&format!("\n### {name}\n{artifact}\n"));
        }
    }

    if let Some(feedback) = &ctx.feedback {
        input.push_str(&format!("\n\n## Feedback\n{feedback}\n"));
    }
    input
}

// ─── Tests ──────────────────────────────────────────────────────────────────
