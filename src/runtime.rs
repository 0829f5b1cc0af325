//! Runtime bootstrap — wires configuration, providers and stores together.
//!
//! The `Runtime` owns everything shared across engines: the provider
//! registry, the permission arbiter (one per process, so session approvals
//! and the bypass flag are global), the capability set, the checkpoint store
//! and the thread leases. Engines and pipelines are built on demand from
//! their configured agents.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent_core::checkpoint::{CheckpointStore, SqliteCheckpointStore, ThreadLease, ThreadLeases};
use crate::agent_core::conversation::{ConversationEngine, Retriever};
use crate::agent_core::errors::AgentError;
use crate::agent_core::orchestrator::{
    AlwaysAccept, CompletionPredicate, PipelineOrchestrator, PipelineStage,
};
use crate::agent_core::permissions::{ApprovalChannel, PermissionArbiter};
use crate::agent_core::tool_invoker::CapabilitySet;
use crate::agent_core::types::Session;
use crate::config::RuntimeConfig;
use crate::inference::types::Message;
use crate::inference::{register_plugins, ProviderRegistry};

/// Shared services for every engine and pipeline in the process.
pub struct Runtime {
    config: RuntimeConfig,
    registry: ProviderRegistry,
    arbiter: Arc<PermissionArbiter>,
    capabilities: CapabilitySet,
    store: Arc<dyn CheckpointStore>,
    leases: ThreadLeases,
    retriever: Option<Arc<dyn Retriever>>,
}

impl Runtime {
    /// Build from config with the built-in providers plus any plugins found
    /// in `config.plugin_dir`.
    pub fn from_config(
        config: RuntimeConfig,
        approval: Arc<dyn ApprovalChannel>,
        capabilities: CapabilitySet,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, AgentError> {
        let mut registry = ProviderRegistry::with_builtins();
        if let Some(dir) = &config.plugin_dir {
            register_plugins(&mut registry, dir);
        }
        Self::with_registry(config, registry, approval, capabilities, store)
    }

    /// Build with an explicit provider registry.
    pub fn with_registry(
        config: RuntimeConfig,
        registry: ProviderRegistry,
        approval: Arc<dyn ApprovalChannel>,
        capabilities: CapabilitySet,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        registry.audit_snapshot();
        let arbiter = Arc::new(PermissionArbiter::new(approval, config.bypass_permissions));
        tracing::info!(
            agents = config.agents.len(),
            pipelines = config.pipelines.len(),
            capabilities = capabilities.len(),
            "runtime initialized"
        );
        Ok(Self {
            config,
            registry,
            arbiter,
            capabilities,
            store,
            leases: ThreadLeases::new(),
            retriever: None,
        })
    }

    /// Open the SQLite checkpoint store named by the config.
    pub fn open_store(config: &RuntimeConfig) -> Result<Arc<dyn CheckpointStore>, AgentError> {
        let path = config.checkpoint_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AgentError::DatabaseError {
                reason: format!("failed to create {}: {e}", parent.display()),
            })?;
        }
        let store = SqliteCheckpointStore::open(&path.to_string_lossy(), &config.checkpoint_namespace)?;
        Ok(Arc::new(store))
    }

    /// Retriever handed to agents that declare `retrieval` settings.
    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn arbiter(&self) -> &Arc<PermissionArbiter> {
        &self.arbiter
    }

    pub fn leases(&self) -> &ThreadLeases {
        &self.leases
    }

    /// Build an engine for a configured agent. Provider resolution and
    /// validation happen here, before any turn runs.
    pub fn engine(&self, agent_name: &str) -> Result<ConversationEngine, AgentError> {
        let agent = self
            .config
            .agents
            .get(agent_name)
            .ok_or_else(|| AgentError::UnknownAgent {
                name: agent_name.to_string(),
            })?;

        let model = self
            .registry
            .resolve(
                &agent.provider,
                &agent.model_name,
                agent.temperature,
                agent.api_key.as_deref(),
                &agent.options,
            )
            .map_err(AgentError::ProviderConfig)?;

        let unknown: Vec<&String> = agent
            .capabilities
            .iter()
            .filter(|name| self.capabilities.get(name).is_none())
            .collect();
        if !unknown.is_empty() {
            tracing::warn!(agent = agent_name, capabilities = ?unknown, "agent names unregistered capabilities");
        }

        let mut engine = ConversationEngine::new(
            agent_name,
            agent.clone(),
            model,
            self.arbiter.clone(),
            &self.capabilities,
            self.store.clone(),
        )
        .with_recursion_limit(self.config.recursion_limit)
        .with_tool_timeout(self.config.tool_timeout());

        if agent.retrieval.is_some() {
            match &self.retriever {
                Some(retriever) => engine = engine.with_retriever(retriever.clone()),
                None => tracing::warn!(
                    agent = agent_name,
                    "agent requests retrieval but no retriever is configured"
                ),
            }
        }
        Ok(engine)
    }

    /// Claim `thread_id` and open (or restore) its session with `agent_name`.
    pub async fn open_session(
        &self,
        agent_name: &str,
        thread_id: &str,
    ) -> Result<ActiveSession, AgentError> {
        let lease = self.leases.acquire(thread_id)?;
        let engine = self.engine(agent_name)?;
        let session = engine.open_session(thread_id).await?;
        Ok(ActiveSession {
            engine,
            session,
            arbiter: self.arbiter.clone(),
            _lease: lease,
        })
    }

    /// Build a configured pipeline. Stages without an entry in `predicates`
    /// accept any output. Every stage engine is built before returning.
    pub fn pipeline(
        &self,
        name: &str,
        predicates: &HashMap<String, Arc<dyn CompletionPredicate>>,
    ) -> Result<PipelineOrchestrator, AgentError> {
        let definition = self
            .config
            .pipelines
            .get(name)
            .ok_or_else(|| AgentError::UnknownPipeline {
                name: name.to_string(),
            })?
            .to_definition(name);

        let stages = definition
            .stages
            .iter()
            .map(|stage| {
                Ok(PipelineStage {
                    definition: stage.clone(),
                    engine: self.engine(&stage.agent)?,
                    predicate: predicates
                        .get(&stage.name)
                        .cloned()
                        .unwrap_or_else(|| Arc::new(AlwaysAccept)),
                })
            })
            .collect::<Result<Vec<_>, AgentError>>()?;

        PipelineOrchestrator::new(definition, stages, self.store.clone(), self.leases.clone())
    }
}

/// An engine bound to one leased session.
///
/// Dropping it forgets the session-scoped approvals granted on its thread.
pub struct ActiveSession {
    engine: ConversationEngine,
    session: Session,
    arbiter: Arc<PermissionArbiter>,
    _lease: ThreadLease,
}

impl ActiveSession {
    /// Run one turn for `input`.
    pub async fn send(
        &mut self,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<Message, AgentError> {
        self.engine.run_turn(&mut self.session, input, cancel).await
    }

    /// Finish a turn interrupted before completion, if any.
    pub async fn resume(&mut self, cancel: &CancellationToken) -> Result<Option<Message>, AgentError> {
        self.engine.resume_turn(&mut self.session, cancel).await
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn engine(&self) -> &ConversationEngine {
        &self.engine
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.arbiter.clear_session(self.session.thread_id());
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
