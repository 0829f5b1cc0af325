//! OpenAI-compatible HTTP model handle.
//!
//! Every built-in provider (and every manifest plugin) speaks the Chat
//! Completions API at some base URL, so one client covers them all; only the
//! endpoint, model name and credential differ.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::header::ACCEPT;
use reqwest::Client as HttpClient;
use uuid::Uuid;

use super::errors::InferenceError;
use super::handle::ModelHandle;
use super::streaming::parse_sse_stream;
use super::types::{
    ChatCompletionRequest, ChatCompletionResponse, Message, StreamEvent, ToolArguments, ToolCall,
    ToolSpec, WireMessage, WireToolCall,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default total request timeout.
///
/// Large contexts on local runtimes can take minutes before the first token.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

// ─── Settings ────────────────────────────────────────────────────────────────

/// Connection settings for one OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    /// Provider name, used only for logging.
    pub provider: String,
    /// Base URL without the trailing `/chat/completions`.
    pub base_url: String,
    pub model_name: String,
    pub temperature: f32,
    pub api_key: Option<String>,
    pub max_tokens: Option<u32>,
    pub request_timeout: Duration,
}

impl EndpointSettings {
    /// Settings with the default timeout and no token cap.
    pub fn new(
        provider: &str,
        base_url: &str,
        model_name: &str,
        temperature: f32,
        api_key: Option<String>,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model_name: model_name.to_string(),
            temperature,
            api_key,
            max_tokens: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

// ─── OpenAiCompatHandle ──────────────────────────────────────────────────────

/// `ModelHandle` backed by an OpenAI-compatible chat completions endpoint.
pub struct OpenAiCompatHandle {
    http: HttpClient,
    settings: EndpointSettings,
    qualified_name: String,
}

impl OpenAiCompatHandle {
    /// Build the handle. Does NOT check connectivity; that happens on the
    /// first request.
    pub fn new(settings: EndpointSettings) -> Result<Self, InferenceError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: settings.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let qualified_name = format!("{}/{}", settings.provider, settings.model_name);
        Ok(Self {
            http,
            settings,
            qualified_name,
        })
    }

    /// The endpoint base URL.
    pub fn base_url(&self) -> &str {
        &self.settings.base_url
    }

    fn build_request(
        &self,
        system_prompt: &str,
        history: &[Message],
        tools: &[ToolSpec],
    ) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(WireMessage::system(system_prompt));
        messages.extend(history.iter().map(WireMessage::from));

        let tools = if tools.is_empty() {
            None
        } else {
            Some(tools.iter().map(ToolSpec::to_openai_tool).collect())
        };

        ChatCompletionRequest {
            model: self.settings.model_name.clone(),
            messages,
            tools,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            stream: false,
        }
    }

    /// POST `body` and return the response once its status is known to be 2xx.
    async fn send(
        &self,
        url: &str,
        body: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, InferenceError> {
        // Request metadata only; the body can be huge.
        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            stream = body.stream,
            "model request"
        );

        let mut request = self.http.post(url).json(body);
        if body.stream {
            request = request.header(ACCEPT, "text/event-stream");
        }
        if let Some(key) = &self.settings.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: self.settings.request_timeout.as_secs(),
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelHandle for OpenAiCompatHandle {
    fn model_name(&self) -> &str {
        &self.qualified_name
    }

    async fn invoke(
        &self,
        system_prompt: &str,
        history: &[Message],
        tools: &[ToolSpec],
    ) -> Result<Message, InferenceError> {
        let url = format!("{}/chat/completions", self.settings.base_url);
        let body = self.build_request(system_prompt, history, tools);
        let response = self.send(&url, &body).await?;

        let body_text = response
            .text()
            .await
            .map_err(|e| InferenceError::ResponseParseError {
                reason: format!("failed to read response body: {e}"),
            })?;

        parse_completion_response(&body_text)
    }

    async fn invoke_stream(
        &self,
        system_prompt: &str,
        history: &[Message],
        tools: &[ToolSpec],
    ) -> Result<BoxStream<'static, Result<StreamEvent, InferenceError>>, InferenceError> {
        let url = format!("{}/chat/completions", self.settings.base_url);
        let mut body = self.build_request(system_prompt, history, tools);
        body.stream = true;
        let response = self.send(&url, &body).await?;
        Ok(parse_sse_stream(response.bytes_stream()))
    }
}

// ─── Response Parsing ────────────────────────────────────────────────────────

/// Parse a non-streaming chat completion body into an assistant `Message`.
pub fn parse_completion_response(body: &str) -> Result<Message, InferenceError> {
    let resp: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::ResponseParseError {
            reason: format!("failed to parse completion response: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::ResponseParseError {
            reason: "empty choices array".into(),
        })?;

    let content = choice.message.content.unwrap_or_default();
    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(wire_to_tool_call)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Message::assistant_with_calls(content, tool_calls))
}

/// Decode one wire tool call, generating an ID when the model omitted it.
pub(super) fn wire_to_tool_call(tc: WireToolCall) -> Result<ToolCall, InferenceError> {
    let id = if tc.id.is_empty() {
        format!("call_{}", Uuid::new_v4())
    } else {
        tc.id
    };

    let raw = tc.function.arguments.trim();
    let arguments = if raw.is_empty() {
        ToolArguments::new()
    } else {
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(other) => {
                return Err(InferenceError::ResponseParseError {
                    reason: format!(
                        "tool call '{}' arguments are not an object: {other}",
                        tc.function.name
                    ),
                })
            }
            Err(e) => {
                return Err(InferenceError::ResponseParseError {
                    reason: format!("tool call '{}' arguments: {e}", tc.function.name),
                })
            }
        }
    };

    Ok(ToolCall {
        id,
        name: tc.function.name,
        arguments,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::Role;

    #[test]
    fn test_parse_text_response() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hello"},"finish_reason":"stop"}]}"#;
        let msg = parse_completion_response(body).unwrap();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content, "hello");
        assert!(msg.tool_calls.is_empty());
    }

    #[test]
    fn test_parse_tool_call_response() {
        let body = r#"{"choices":[{"message":{"content":null,"tool_calls":[
            {"id":"call_9","type":"function","function":{"name":"create_file","arguments":"{\"path\":\"/tmp/x\"}"}}
        ]}}]}"#;
        let msg = parse_completion_response(body).unwrap();
        assert_eq!(msg.content, "");
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].id, "call_9");
        assert_eq!(msg.tool_calls[0].arguments["path"], "/tmp/x");
    }

    #[test]
    fn test_parse_generates_missing_call_id() {
        let body = r#"{"choices":[{"message":{"tool_calls":[
            {"function":{"name":"list_dir","arguments":""}}
        ]}}]}"#;
        let msg = parse_completion_response(body).unwrap();
        assert!(msg.tool_calls[0].id.starts_with("call_"));
        assert!(msg.tool_calls[0].arguments.is_empty());
    }

    #[test]
    fn test_parse_rejects_non_object_arguments() {
        let body = r#"{"choices":[{"message":{"tool_calls":[
            {"id":"c","function":{"name":"x","arguments":"[1,2]"}}
        ]}}]}"#;
        assert!(matches!(
            parse_completion_response(body),
            Err(InferenceError::ResponseParseError { .. })
        ));
    }

    #[test]
    fn test_parse_empty_choices() {
        assert!(parse_completion_response(r#"{"choices":[]}"#).is_err());
    }

    #[test]
    fn test_build_request_prepends_system_prompt() {
        let handle = OpenAiCompatHandle::new(EndpointSettings::new(
            "ollama",
            "http://localhost:11434/v1/",
            "qwen2.5-coder:7b",
            0.1,
            None,
        ))
        .unwrap();
        assert_eq!(handle.base_url(), "http://localhost:11434/v1");
        assert_eq!(handle.model_name(), "ollama/qwen2.5-coder:7b");

        let req = handle.build_request("be brief", &[Message::user("hi")], &[]);
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.messages[1].content, "hi");
        assert!(req.tools.is_none());
    }
}
