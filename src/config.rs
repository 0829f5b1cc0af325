//! Runtime configuration loading and validation.
//!
//! Reads `ally.yaml` and resolves environment variables. The file declares
//! the agents (provider, model, prompt, capabilities), the pipelines built
//! from them, and the engine limits shared by every turn.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent_core::conversation::{DEFAULT_RECURSION_LIMIT, DEFAULT_TOOL_TIMEOUT};
use crate::agent_core::errors::AgentError;
use crate::agent_core::orchestrator::{PipelineDefinition, StageDefinition, DEFAULT_MAX_REFINEMENTS};
use crate::agent_core::types::AgentConfig;

/// File name searched for by [`find_config_path`].
pub const CONFIG_FILE_NAME: &str = "ally.yaml";

/// Env var pointing directly at a config file.
pub const CONFIG_ENV_VAR: &str = "ALLY_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// One pipeline as written in the config file (its name is the map key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub stages: Vec<StageDefinition>,
    #[serde(default = "default_max_refinements")]
    pub max_refinements: u32,
}

fn default_max_refinements() -> u32 {
    DEFAULT_MAX_REFINEMENTS
}

impl PipelineConfig {
    pub fn to_definition(&self, name: &str) -> PipelineDefinition {
        PipelineDefinition {
            name: name.to_string(),
            stages: self.stages.clone(),
            max_refinements: self.max_refinements,
        }
    }
}

/// Top-level runtime configuration (mirrors `ally.yaml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Model/tool round trips allowed per turn.
    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: u32,
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    /// Skip every approval prompt for the process lifetime.
    #[serde(default)]
    pub bypass_permissions: bool,
    /// SQLite checkpoint database. Defaults to `<data_dir>/checkpoints.db`.
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
    #[serde(default = "default_namespace")]
    pub checkpoint_namespace: String,
    /// Directory of provider plugin manifests.
    #[serde(default)]
    pub plugin_dir: Option<PathBuf>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineConfig>,
}

fn default_recursion_limit() -> u32 {
    DEFAULT_RECURSION_LIMIT
}
fn default_tool_timeout_ms() -> u64 {
    DEFAULT_TOOL_TIMEOUT.as_millis() as u64
}
fn default_namespace() -> String {
    "default".into()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            recursion_limit: default_recursion_limit(),
            tool_timeout_ms: default_tool_timeout_ms(),
            bypass_permissions: false,
            checkpoint_path: None,
            checkpoint_namespace: default_namespace(),
            plugin_dir: None,
            agents: BTreeMap::new(),
            pipelines: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    /// Configured checkpoint database, or the platform default.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_path
            .clone()
            .unwrap_or_else(|| crate::data_dir().join("checkpoints.db"))
    }

    /// Structural checks that need no provider access.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.recursion_limit == 0 {
            return Err(AgentError::ConfigError {
                reason: "recursion_limit must be at least 1".into(),
            });
        }
        if self.tool_timeout_ms == 0 {
            return Err(AgentError::ConfigError {
                reason: "tool_timeout_ms must be positive".into(),
            });
        }
        for (name, agent) in &self.agents {
            if agent.provider.trim().is_empty() {
                return Err(AgentError::ConfigError {
                    reason: format!("agent '{name}' has no provider"),
                });
            }
        }
        for (name, pipeline) in &self.pipelines {
            pipeline.to_definition(name).validate()?;
            if let Some(stage) = pipeline
                .stages
                .iter()
                .find(|s| !self.agents.contains_key(&s.agent))
            {
                return Err(AgentError::ConfigError {
                    reason: format!(
                        "pipeline '{name}' stage '{}' references unknown agent '{}'",
                        stage.name, stage.agent
                    ),
                });
            }
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `ALLY_CONFIG` first, then searches upward from `start` for
/// `ally.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, AgentError> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "ALLY_CONFIG points at a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(AgentError::ConfigError {
        reason: format!("could not find {CONFIG_FILE_NAME}"),
    })
}

/// Load, interpolate, parse and validate the runtime configuration.
///
/// String values may use `${VAR_NAME}` or `${VAR_NAME:-default}`.
pub fn load_runtime_config(path: &Path) -> Result<RuntimeConfig, AgentError> {
    let raw = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    let config = parse_runtime_config(&raw)?;
    tracing::info!(
        path = %path.display(),
        agents = config.agents.len(),
        pipelines = config.pipelines.len(),
        bypass_permissions = config.bypass_permissions,
        "runtime config loaded"
    );
    Ok(config)
}

/// Parse config text (after env interpolation) and validate it.
pub fn parse_runtime_config(raw: &str) -> Result<RuntimeConfig, AgentError> {
    let interpolated = interpolate_env_vars(raw);
    let mut config: RuntimeConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| AgentError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    config.checkpoint_path = config
        .checkpoint_path
        .map(|p| PathBuf::from(expand_tilde(&p.to_string_lossy())));
    config.plugin_dir = config
        .plugin_dir
        .map(|p| PathBuf::from(expand_tilde(&p.to_string_lossy())));

    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                expr.push(c);
            }
            result.push_str(&resolve_var_expr(&expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
recursion_limit: 10
bypass_permissions: false
checkpoint_path: /tmp/ally-test/checkpoints.db
agents:
  writer:
    provider: Ollama
    system_prompt: "You write specs."
  coder:
    provider: openai
    model_name: gpt-4o
    temperature: 0.2
    capabilities: [create_file, read_file]
    retrieval:
      top_k: 6
      collections: [docs]
pipelines:
  build:
    stages:
      - { name: spec, agent: writer }
      - { name: generate, agent: coder }
"#;

    #[test]
    fn test_parse_sample() {
        let config = parse_runtime_config(SAMPLE).unwrap();
        assert_eq!(config.recursion_limit, 10);
        assert_eq!(config.tool_timeout(), DEFAULT_TOOL_TIMEOUT);
        assert_eq!(config.checkpoint_namespace, "default");
        assert_eq!(
            config.checkpoint_path(),
            PathBuf::from("/tmp/ally-test/checkpoints.db")
        );

        let writer = &config.agents["writer"];
        assert_eq!(writer.model_name, "");
        assert!((writer.temperature - 0.1).abs() < f32::EPSILON);
        let coder = &config.agents["coder"];
        assert!(coder.capabilities.contains("create_file"));
        assert_eq!(coder.retrieval.as_ref().unwrap().top_k, 6);

        let build = config.pipelines["build"].to_definition("build");
        assert_eq!(build.stages.len(), 2);
        assert_eq!(build.max_refinements, DEFAULT_MAX_REFINEMENTS);
    }

    #[test]
    fn test_demo_config_parses() {
        let config = parse_runtime_config(include_str!("../demos/ally.yaml")).unwrap();
        assert_eq!(config.pipelines["build"].stages[1].agent, "coder");
        assert!(config.agents["docs"].retrieval.is_some());
        assert!(!config.checkpoint_path().to_string_lossy().contains('$'));
    }

    #[test]
    fn test_unknown_stage_agent_rejected() {
        let raw = r#"
agents:
  a: { provider: ollama }
pipelines:
  p:
    stages: [{ name: s, agent: missing }]
"#;
        let err = parse_runtime_config(raw).unwrap_err();
        assert!(err.to_string().contains("unknown agent 'missing'"));
    }

    #[test]
    fn test_zero_recursion_limit_rejected() {
        assert!(parse_runtime_config("recursion_limit: 0").is_err());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = parse_runtime_config("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_interpolate_env_vars() {
        std::env::set_var("__ALLY_TEST_KEY__", "sk-test");
        std::env::remove_var("__ALLY_TEST_MISSING__");
        assert_eq!(interpolate_env_vars("key: ${__ALLY_TEST_KEY__}"), "key: sk-test");
        assert_eq!(
            interpolate_env_vars("dir: ${__ALLY_TEST_MISSING__:-/opt/plugins}"),
            "dir: /opt/plugins"
        );
        assert_eq!(interpolate_env_vars("no vars"), "no vars");
        std::env::remove_var("__ALLY_TEST_KEY__");
    }

    #[test]
    fn test_tilde_expanded_in_paths() {
        let config = parse_runtime_config("plugin_dir: ~/ally/plugins").unwrap();
        let dir = config.plugin_dir.unwrap();
        assert!(!dir.to_string_lossy().starts_with('~'));
        assert!(dir.ends_with("ally/plugins"));
    }

    #[test]
    fn test_load_and_find_config() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE_NAME), SAMPLE).unwrap();

        let found = find_config_path(&nested).unwrap();
        assert_eq!(found, tmp.path().join(CONFIG_FILE_NAME));
        let config = load_runtime_config(&found).unwrap();
        assert_eq!(config.agents.len(), 2);

        assert!(load_runtime_config(&tmp.path().join("nope.yaml")).is_err());
    }
}
