//! Provider plugin discovery — scan a directory of YAML manifests.
//!
//! Each `*.yaml` / `*.yml` file describes one OpenAI-compatible provider.
//! Discovered providers are registered over the built-ins, so a manifest
//! named `openai.yaml` replaces the built-in OpenAI entry (with a warning).
//!
//! ```yaml
//! name: minimax
//! display_name: MiniMax
//! base_url: https://api.minimax.io/v1
//! api_key_env: MINIMAX_API_KEY
//! default_model: minimax-m2
//! available_models: [minimax-m2]
//! extra_required_options:
//!   - key: group_id
//!     env: MINIMAX_GROUP_ID
//!     digits: 19
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use super::builtin::openai_compat_factory;
use super::errors::InferenceError;
use super::registry::{ProviderConfig, ProviderDescriptor, ProviderRegistry};

// ─── Manifest ────────────────────────────────────────────────────────────────

/// On-disk provider manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderManifest {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub available_models: Vec<String>,
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
    #[serde(default)]
    pub extra_required_options: Vec<ManifestOption>,
}

/// A provider-specific required option.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestOption {
    pub key: String,
    pub env: String,
    /// If set, the value must be exactly this many ASCII digits.
    #[serde(default)]
    pub digits: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl ProviderManifest {
    /// Parse a manifest from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, InferenceError> {
        let manifest: Self =
            serde_yaml::from_str(content).map_err(|e| InferenceError::ConfigError {
                reason: format!("invalid provider manifest: {e}"),
            })?;
        if manifest.name.trim().is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "provider manifest has an empty name".into(),
            });
        }
        Ok(manifest)
    }

    /// Convert into a registrable descriptor.
    pub fn into_descriptor(self) -> ProviderDescriptor {
        let factory = openai_compat_factory(&self.name, &self.base_url);
        let mut descriptor =
            ProviderDescriptor::new(&self.name, factory).with_streaming(self.supports_streaming);

        if let Some(display_name) = &self.display_name {
            descriptor = descriptor.with_display_name(display_name);
        }
        if let Some(env) = &self.api_key_env {
            descriptor = descriptor.with_api_key_env(env);
        }
        if let Some(default_model) = &self.default_model {
            let models: Vec<&str> = self.available_models.iter().map(String::as_str).collect();
            descriptor = descriptor.with_models(default_model, &models);
        } else {
            descriptor.available_models = self.available_models.clone();
        }
        for opt in &self.extra_required_options {
            descriptor = descriptor.with_required_option(&opt.key, &opt.env);
        }

        let digit_rules: Vec<ManifestOption> = self
            .extra_required_options
            .into_iter()
            .filter(|o| o.digits.is_some())
            .collect();
        if !digit_rules.is_empty() {
            descriptor = descriptor.with_validator(Arc::new(move |config: &ProviderConfig| {
                check_digit_rules(&digit_rules, config)
            }));
        }

        descriptor
    }
}

fn check_digit_rules(rules: &[ManifestOption], config: &ProviderConfig) -> Result<(), String> {
    for rule in rules {
        let (Some(expected), Some(value)) = (rule.digits, config.option_str(&rule.key)) else {
            continue;
        };
        if value.len() != expected || !value.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!(
                "{} should be a {expected}-digit number, got: {value}",
                rule.env
            ));
        }
    }
    Ok(())
}

// ─── Discovery ───────────────────────────────────────────────────────────────

/// Scan `plugin_dir` for provider manifests.
///
/// Skips files starting with `_` or `.`. A missing directory yields an empty
/// list; a malformed manifest is logged and skipped.
pub fn discover_plugins(plugin_dir: &Path) -> Vec<ProviderDescriptor> {
    let entries = match std::fs::read_dir(plugin_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(
                path = %plugin_dir.display(),
                error = %e,
                "plugin directory not found, skipping provider discovery"
            );
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_manifest_file(p))
        .collect();
    // Deterministic override order when two manifests share a name.
    paths.sort();

    let mut descriptors = Vec::new();
    for path in paths {
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read provider manifest");
                continue;
            }
        };
        match ProviderManifest::from_yaml(&content) {
            Ok(manifest) => {
                tracing::debug!(
                    provider = %manifest.name,
                    path = %path.display(),
                    "discovered provider plugin"
                );
                descriptors.push(manifest.into_descriptor());
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping provider manifest");
            }
        }
    }
    descriptors
}

/// Discover plugins and register them. Returns the number registered.
pub fn register_plugins(registry: &mut ProviderRegistry, plugin_dir: &Path) -> usize {
    let descriptors = discover_plugins(plugin_dir);
    let count = descriptors.len();
    let overrides = descriptors
        .into_iter()
        .map(|descriptor| registry.register(descriptor))
        .filter(|replaced| *replaced)
        .count();
    tracing::info!(count, overrides, path = %plugin_dir.display(), "provider plugins loaded");
    count
}

fn is_manifest_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('_') || name.starts_with('.') {
        return false;
    }
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

// ─── Tests ───────────────────────────────────────────────────────────────────
