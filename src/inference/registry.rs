//! Provider registry — the set of known model providers.
//!
//! Provides:
//! - Case-insensitive registration (last registration wins, with a warning)
//! - Config preparation (default model, credentials from the environment)
//! - Validation strictly before any handle construction
//! - Introspection for audit logging and settings screens
//!
//! The registry is populated once at startup (built-ins, then plugins) and is
//! shared read-only afterwards, typically behind an `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::errors::InferenceError;
use super::handle::ModelHandle;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Everything a factory needs to build a `ModelHandle`.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub model_name: String,
    pub temperature: f32,
    pub api_key: Option<String>,
    /// Provider-specific options (e.g. `group_id`, `base_url`).
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl ProviderConfig {
    /// String value of an option, if present and non-empty.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Builds a handle from an already-validated config.
pub type ModelFactory =
    Arc<dyn Fn(&ProviderConfig) -> Result<Arc<dyn ModelHandle>, InferenceError> + Send + Sync>;

/// Provider-specific validation, run after the default checks.
pub type ConfigValidator = Arc<dyn Fn(&ProviderConfig) -> Result<(), String> + Send + Sync>;

/// An option the provider requires, satisfiable from `options[key]` or `env`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredOption {
    pub key: String,
    pub env: String,
}

/// Registration record for one provider.
#[derive(Clone)]
pub struct ProviderDescriptor {
    pub name: String,
    pub display_name: String,
    /// Env var holding the API key, if the provider needs one.
    pub api_key_env: Option<String>,
    pub required_options: Vec<RequiredOption>,
    pub default_model: Option<String>,
    pub available_models: Vec<String>,
    pub supports_streaming: bool,
    factory: ModelFactory,
    validator: Option<ConfigValidator>,
}

impl fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("name", &self.name)
            .field("display_name", &self.display_name)
            .field("api_key_env", &self.api_key_env)
            .field("required_options", &self.required_options)
            .field("default_model", &self.default_model)
            .finish_non_exhaustive()
    }
}

impl ProviderDescriptor {
    /// A descriptor with no credentials, no models and the given factory.
    ///
    /// The name is normalized to lowercase.
    pub fn new(name: &str, factory: ModelFactory) -> Self {
        let name = name.to_lowercase();
        Self {
            display_name: capitalize(&name),
            name,
            api_key_env: None,
            required_options: Vec::new(),
            default_model: None,
            available_models: Vec::new(),
            supports_streaming: true,
            factory,
            validator: None,
        }
    }

    pub fn with_display_name(mut self, display_name: &str) -> Self {
        self.display_name = display_name.to_string();
        self
    }

    pub fn with_api_key_env(mut self, env: &str) -> Self {
        self.api_key_env = Some(env.to_string());
        self
    }

    pub fn with_required_option(mut self, key: &str, env: &str) -> Self {
        self.required_options.push(RequiredOption {
            key: key.to_string(),
            env: env.to_string(),
        });
        self
    }

    pub fn with_models(mut self, default_model: &str, available: &[&str]) -> Self {
        self.default_model = Some(default_model.to_string());
        self.available_models = available.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_validator(mut self, validator: ConfigValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_streaming(mut self, supported: bool) -> Self {
        self.supports_streaming = supported;
        self
    }

    /// All environment variables this provider reads credentials from.
    pub fn required_env_vars(&self) -> Vec<String> {
        self.api_key_env
            .iter()
            .cloned()
            .chain(self.required_options.iter().map(|o| o.env.clone()))
            .collect()
    }

    /// Fill gaps in a caller-supplied config from descriptor defaults and the
    /// process environment. Never fails; validation happens separately.
    pub fn prepare_config(
        &self,
        model_name: &str,
        temperature: f32,
        api_key: Option<&str>,
        options: &serde_json::Map<String, serde_json::Value>,
    ) -> ProviderConfig {
        let model_name = if model_name.trim().is_empty() {
            self.default_model.clone().unwrap_or_default()
        } else {
            model_name.to_string()
        };

        let api_key = api_key
            .filter(|k| !k.is_empty())
            .map(String::from)
            .or_else(|| {
                self.api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|k| !k.is_empty())
            });

        let mut options = options.clone();
        for opt in &self.required_options {
            let present = options
                .get(&opt.key)
                .and_then(|v| v.as_str())
                .is_some_and(|s| !s.is_empty());
            if !present {
                if let Ok(value) = std::env::var(&opt.env) {
                    options.insert(opt.key.clone(), serde_json::Value::String(value));
                }
            }
        }

        ProviderConfig {
            model_name,
            temperature,
            api_key,
            options,
        }
    }

    /// Validate a prepared config. Returns the human-readable reason on failure.
    pub fn validate(&self, config: &ProviderConfig) -> Result<(), String> {
        if config.model_name.trim().is_empty() {
            return Err(format!(
                "model_name is required for {} provider",
                self.display_name
            ));
        }

        if let Some(env) = &self.api_key_env {
            if config.api_key.as_deref().map_or(true, str::is_empty) {
                return Err(format!("{env} environment variable must be set"));
            }
        }

        for opt in &self.required_options {
            if config.option_str(&opt.key).is_none() {
                return Err(format!(
                    "{} environment variable (or option '{}') must be set",
                    opt.env, opt.key
                ));
            }
        }

        match &self.validator {
            Some(validator) => validator(config),
            None => Ok(()),
        }
    }

    /// Introspection record for this descriptor.
    pub fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            display_name: self.display_name.clone(),
            required_env_vars: self.required_env_vars(),
            default_model: self.default_model.clone(),
            available_models: self.available_models.clone(),
            supports_streaming: self.supports_streaming,
        }
    }
}

/// Serializable summary of a registered provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub display_name: String,
    pub required_env_vars: Vec<String>,
    pub default_model: Option<String>,
    pub available_models: Vec<String>,
    pub supports_streaming: bool,
}

// ─── ProviderRegistry ────────────────────────────────────────────────────────

/// Registry of model providers keyed by lowercase name.
#[derive(Debug, Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderDescriptor>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-populated with the built-in provider table.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for descriptor in super::builtin::builtin_descriptors() {
            registry.register(descriptor);
        }
        registry
    }

    /// Insert a descriptor. An existing entry with the same (case-insensitive)
    /// name is overwritten and a warning is logged; this never fails.
    ///
    /// Returns `true` if an existing entry was replaced.
    pub fn register(&mut self, mut descriptor: ProviderDescriptor) -> bool {
        let key = descriptor.name.to_lowercase();
        descriptor.name = key.clone();
        let replaced = self.providers.insert(key.clone(), descriptor).is_some();
        if replaced {
            tracing::warn!(provider = %key, "provider registration overrides existing provider");
        } else {
            tracing::debug!(provider = %key, "provider registered");
        }
        replaced
    }

    /// Look up a descriptor by name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&ProviderDescriptor> {
        self.providers.get(&name.to_lowercase())
    }

    /// Whether a provider is registered under `name`.
    pub fn is_available(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sorted list of registered provider names.
    pub fn list_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Introspection record for a provider.
    pub fn provider_info(&self, name: &str) -> Option<ProviderInfo> {
        self.get(name).map(ProviderDescriptor::info)
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Snapshot of the active provider set, logged for the audit trail.
    pub fn audit_snapshot(&self) -> Vec<ProviderInfo> {
        let infos: Vec<ProviderInfo> = self
            .list_providers()
            .iter()
            .filter_map(|n| self.provider_info(n))
            .collect();
        tracing::info!(
            count = infos.len(),
            providers = ?infos.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
            "active model providers"
        );
        infos
    }

    /// Resolve a provider and build a ready-to-use handle.
    ///
    /// Validation runs strictly before the factory, so a rejected config
    /// never causes a network or process side effect.
    pub fn resolve(
        &self,
        name: &str,
        model_name: &str,
        temperature: f32,
        api_key: Option<&str>,
        options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Arc<dyn ModelHandle>, InferenceError> {
        let descriptor = self.get(name).ok_or_else(|| InferenceError::UnknownProvider {
            name: name.to_string(),
            available: self.list_providers(),
        })?;

        let config = descriptor.prepare_config(model_name, temperature, api_key, options);
        descriptor
            .validate(&config)
            .map_err(|reason| InferenceError::ProviderConfigError {
                provider: descriptor.name.clone(),
                reason,
            })?;

        let handle = (descriptor.factory)(&config)?;
        tracing::info!(
            provider = %descriptor.name,
            model = %config.model_name,
            "model handle resolved"
        );
        Ok(handle)
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
