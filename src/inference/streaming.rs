//! SSE streaming response parser for OpenAI-compatible chat completions.
//!
//! Reads the HTTP body as a byte stream, splits it on SSE event boundaries
//! (`data: …\n\n`), parses each payload as a `ChatCompletionChunk` and
//! accumulates tool call fragments across deltas. Text fragments surface as
//! `StreamEvent::Token`; the assembled assistant message closes the stream as
//! `StreamEvent::Done`.

use futures::stream::{self, BoxStream, Stream, StreamExt};

use super::client::wire_to_tool_call;
use super::errors::InferenceError;
use super::types::{ChatCompletionChunk, Message, StreamEvent, WireFunctionCall, WireToolCall};

// ─── SSE event parser ────────────────────────────────────────────────────────

/// Parse raw SSE bytes into `StreamEvent`s.
///
/// Exactly one `Done` is emitted, on `[DONE]` or when the body ends without
/// it. A transport error or malformed chunk yields one `StreamError` and ends
/// the stream.
pub fn parse_sse_stream<S, B, E>(
    byte_stream: S,
) -> BoxStream<'static, Result<StreamEvent, InferenceError>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let byte_stream = Box::pin(byte_stream).fuse();

    stream::unfold(
        (byte_stream, StreamState::new(), Vec::<u8>::new()),
        |(mut byte_stream, mut state, mut buffer)| async move {
            if state.finished {
                return None;
            }
            loop {
                if let Some((end, delimiter)) = event_boundary(&buffer) {
                    let event: Vec<u8> = buffer.drain(..end + delimiter).take(end).collect();
                    match state.process_event(&event) {
                        Ok(Some(event)) => return Some((Ok(event), (byte_stream, state, buffer))),
                        Ok(None) => continue, // keep-alive or comment
                        Err(e) => {
                            state.finished = true;
                            return Some((Err(e), (byte_stream, state, buffer)));
                        }
                    }
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(bytes.as_ref()),
                    Some(Err(e)) => {
                        state.finished = true;
                        let err = InferenceError::StreamError {
                            reason: format!("stream read error: {e}"),
                        };
                        return Some((Err(err), (byte_stream, state, buffer)));
                    }
                    None => {
                        // Last event may lack its blank line.
                        if !buffer.is_empty() {
                            let event = std::mem::take(&mut buffer);
                            match state.process_event(&event) {
                                Ok(Some(event)) => {
                                    return Some((Ok(event), (byte_stream, state, buffer)))
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    state.finished = true;
                                    return Some((Err(e), (byte_stream, state, buffer)));
                                }
                            }
                        }
                        if state.finished {
                            return None;
                        }
                        tracing::debug!("stream ended without [DONE]");
                        let done = state.finish().map(StreamEvent::Done);
                        return Some((done, (byte_stream, state, buffer)));
                    }
                }
            }
        },
    )
    .boxed()
}

/// Position and length of the first event delimiter (`\n\n` or `\r\n\r\n`).
fn event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = find(buffer, b"\n\n").map(|i| (i, 2));
    let crlf = find(buffer, b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ─── Stream State ────────────────────────────────────────────────────────────

/// A tool call being assembled from fragments.
struct PendingCall {
    index: u32,
    id: String,
    name: String,
    arguments: String,
}

/// Mutable state carried across SSE events.
struct StreamState {
    content: String,
    pending_calls: Vec<PendingCall>,
    finished: bool,
}

impl StreamState {
    fn new() -> Self {
        Self {
            content: String::new(),
            pending_calls: Vec::new(),
            finished: false,
        }
    }

    /// Process one SSE event (may contain multiple `data:` lines).
    fn process_event(&mut self, raw: &[u8]) -> Result<Option<StreamEvent>, InferenceError> {
        let text = std::str::from_utf8(raw).map_err(|e| InferenceError::StreamError {
            reason: format!("event is not valid UTF-8: {e}"),
        })?;

        let mut data = String::new();
        for line in text.lines() {
            if let Some(payload) = line.strip_prefix("data:") {
                let payload = payload.trim();
                if payload == "[DONE]" {
                    return self.finish().map(|message| Some(StreamEvent::Done(message)));
                }
                data.push_str(payload);
            }
            // Other fields (event:, id:, comments) carry nothing we use.
        }

        if data.is_empty() {
            return Ok(None);
        }

        let chunk: ChatCompletionChunk =
            serde_json::from_str(&data).map_err(|e| InferenceError::StreamError {
                reason: format!("failed to parse SSE chunk: {e} (data: {data})"),
            })?;
        Ok(self.apply_chunk(chunk))
    }

    fn apply_chunk(&mut self, chunk: ChatCompletionChunk) -> Option<StreamEvent> {
        let choice = chunk.choices.into_iter().next()?;

        for fragment in choice.delta.tool_calls.unwrap_or_default() {
            let index = fragment.index.unwrap_or(0);
            let (name, arguments) = fragment
                .function
                .map(|f| (f.name.unwrap_or_default(), f.arguments.unwrap_or_default()))
                .unwrap_or_default();

            match self.pending_calls.iter_mut().find(|c| c.index == index) {
                Some(pending) => {
                    pending.name.push_str(&name);
                    pending.arguments.push_str(&arguments);
                    if let Some(id) = fragment.id {
                        pending.id = id;
                    }
                }
                None => self.pending_calls.push(PendingCall {
                    index,
                    id: fragment.id.unwrap_or_default(),
                    name,
                    arguments,
                }),
            }
        }

        match choice.delta.content {
            Some(token) if !token.is_empty() => {
                self.content.push_str(&token);
                Some(StreamEvent::Token(token))
            }
            _ => None,
        }
    }

    /// Assemble the final assistant message. Ends the stream.
    fn finish(&mut self) -> Result<Message, InferenceError> {
        self.finished = true;
        let mut pending = std::mem::take(&mut self.pending_calls);
        pending.sort_by_key(|c| c.index);

        let tool_calls = pending
            .into_iter()
            .map(|c| {
                wire_to_tool_call(WireToolCall {
                    id: c.id,
                    r#type: "function".to_string(),
                    function: WireFunctionCall {
                        name: c.name,
                        arguments: c.arguments,
                    },
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Message::assistant_with_calls(
            std::mem::take(&mut self.content),
            tool_calls,
        ))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
