//! Built-in provider table.
//!
//! Every built-in speaks the OpenAI Chat Completions API, so each entry is
//! just an endpoint, a credential variable and a model list wired to
//! [`OpenAiCompatHandle`]. The `base_url` option overrides the endpoint
//! (e.g. a remote Ollama host or a proxy).

use std::sync::Arc;
use std::time::Duration;

use super::client::{EndpointSettings, OpenAiCompatHandle};
use super::errors::InferenceError;
use super::handle::ModelHandle;
use super::registry::{ModelFactory, ProviderConfig, ProviderDescriptor};

// ─── Endpoints ───────────────────────────────────────────────────────────────

pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
pub const CEREBRAS_BASE_URL: &str = "https://api.cerebras.ai/v1";

// ─── Factory ─────────────────────────────────────────────────────────────────

/// Factory producing an OpenAI-compatible handle for `provider`.
///
/// Recognized options: `base_url` (string), `max_tokens` (integer) and
/// `request_timeout_secs` (integer).
pub fn openai_compat_factory(provider: &str, default_base_url: &str) -> ModelFactory {
    let provider = provider.to_string();
    let default_base_url = default_base_url.to_string();
    Arc::new(move |config: &ProviderConfig| {
        build_handle(&provider, &default_base_url, config)
    })
}

fn build_handle(
    provider: &str,
    default_base_url: &str,
    config: &ProviderConfig,
) -> Result<Arc<dyn ModelHandle>, InferenceError> {
    let base_url = config.option_str("base_url").unwrap_or(default_base_url);
    let mut settings = EndpointSettings::new(
        provider,
        base_url,
        &config.model_name,
        config.temperature,
        config.api_key.clone(),
    );
    if let Some(max_tokens) = config.options.get("max_tokens").and_then(|v| v.as_u64()) {
        settings.max_tokens = u32::try_from(max_tokens).ok();
    }
    if let Some(secs) = config
        .options
        .get("request_timeout_secs")
        .and_then(|v| v.as_u64())
    {
        settings.request_timeout = Duration::from_secs(secs);
    }
    Ok(Arc::new(OpenAiCompatHandle::new(settings)?))
}

// ─── Table ───────────────────────────────────────────────────────────────────

/// The fixed set of providers registered before plugin discovery.
pub fn builtin_descriptors() -> Vec<ProviderDescriptor> {
    vec![
        ProviderDescriptor::new("ollama", openai_compat_factory("ollama", OLLAMA_BASE_URL))
            .with_display_name("Ollama (Local)")
            .with_models(
                "qwen2.5-coder:7b",
                &[
                    "qwen2.5-coder:7b",
                    "qwen2.5:latest",
                    "llama3.2:latest",
                    "codellama:latest",
                    "mistral:latest",
                ],
            ),
        ProviderDescriptor::new("openai", openai_compat_factory("openai", OPENAI_BASE_URL))
            .with_display_name("OpenAI")
            .with_api_key_env("OPENAI_API_KEY")
            .with_models(
                "gpt-4o",
                &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo", "gpt-3.5-turbo"],
            ),
        ProviderDescriptor::new(
            "anthropic",
            openai_compat_factory("anthropic", ANTHROPIC_BASE_URL),
        )
        .with_display_name("Anthropic (Claude)")
        .with_api_key_env("ANTHROPIC_API_KEY")
        .with_models(
            "claude-sonnet-4-5-20250929",
            &[
                "claude-sonnet-4-5-20250929",
                "claude-3-5-sonnet-20241022",
                "claude-3-5-haiku-20241022",
                "claude-3-opus-20240229",
            ],
        ),
        ProviderDescriptor::new("google", openai_compat_factory("google", GOOGLE_BASE_URL))
            .with_display_name("Google Gemini")
            .with_api_key_env("GOOGLE_GEN_AI_API_KEY")
            .with_models(
                "gemini-2.0-flash-exp",
                &[
                    "gemini-2.0-flash-exp",
                    "gemini-2.5-flash",
                    "gemini-1.5-pro",
                    "gemini-1.5-flash",
                ],
            ),
        ProviderDescriptor::new(
            "cerebras",
            openai_compat_factory("cerebras", CEREBRAS_BASE_URL),
        )
        .with_display_name("Cerebras")
        .with_api_key_env("CEREBRAS_API_KEY")
        .with_models("llama3.1-70b", &["llama3.1-70b", "llama3.1-8b"]),
    ]
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::inference::registry::ProviderRegistry;

    #[test]
    fn test_builtin_names() {
        let registry = ProviderRegistry::with_builtins();
        assert_eq!(
            registry.list_providers(),
            vec!["anthropic", "cerebras", "google", "ollama", "openai"]
        );
    }

    #[test]
    fn test_ollama_needs_no_credentials() {
        let registry = ProviderRegistry::with_builtins();
        let info = registry.provider_info("Ollama").unwrap();
        assert!(info.required_env_vars.is_empty());
        assert_eq!(info.default_model.as_deref(), Some("qwen2.5-coder:7b"));

        let handle = registry
            .resolve("ollama", "", 0.1, None, &Default::default())
            .unwrap();
        assert_eq!(handle.model_name(), "ollama/qwen2.5-coder:7b");
    }

    #[test]
    fn test_hosted_providers_require_keys() {
        let registry = ProviderRegistry::with_builtins();
        for (name, env) in [
            ("openai", "OPENAI_API_KEY"),
            ("anthropic", "ANTHROPIC_API_KEY"),
            ("google", "GOOGLE_GEN_AI_API_KEY"),
            ("cerebras", "CEREBRAS_API_KEY"),
        ] {
            let info = registry.provider_info(name).unwrap();
            assert_eq!(info.required_env_vars, vec![env.to_string()]);
        }
    }

    #[test]
    fn test_explicit_key_and_base_url_option() {
        let registry = ProviderRegistry::with_builtins();
        let mut options = serde_json::Map::new();
        options.insert("base_url".into(), serde_json::json!("http://proxy:8080/v1"));
        options.insert("max_tokens".into(), serde_json::json!(512));
        let handle = registry
            .resolve("OpenAI", "gpt-4o-mini", 0.0, Some("sk-test"), &options)
            .unwrap();
        assert_eq!(handle.model_name(), "openai/gpt-4o-mini");
    }
}
