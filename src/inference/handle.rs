//! `ModelHandle` — the invocation seam between the engine and a model provider.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use super::errors::InferenceError;
use super::types::{Message, StreamEvent, ToolSpec};

/// A ready-to-use model produced by a provider factory.
///
/// Handles are shared read-only across the engines of one agent config and
/// must be safe to call from any task.
#[async_trait]
pub trait ModelHandle: Send + Sync {
    /// Provider-qualified model name, for logging (e.g. `"openai/gpt-4o"`).
    fn model_name(&self) -> &str;

    /// Run one completion over `history` and return the assistant message.
    ///
    /// The returned message may carry tool calls; it is never appended by the
    /// handle itself.
    async fn invoke(
        &self,
        system_prompt: &str,
        history: &[Message],
        tools: &[ToolSpec],
    ) -> Result<Message, InferenceError>;

    /// Streaming variant: text fragments followed by exactly one
    /// `StreamEvent::Done` carrying the final message.
    ///
    /// Handles without native streaming fall back to a single fragment.
    async fn invoke_stream(
        &self,
        system_prompt: &str,
        history: &[Message],
        tools: &[ToolSpec],
    ) -> Result<BoxStream<'static, Result<StreamEvent, InferenceError>>, InferenceError> {
        let message = self.invoke(system_prompt, history, tools).await?;
        let mut events = Vec::with_capacity(2);
        if !message.content.is_empty() {
            events.push(Ok(StreamEvent::Token(message.content.clone())));
        }
        events.push(Ok(StreamEvent::Done(message)));
        Ok(stream::iter(events).boxed())
    }
}
