//! LLM provider abstraction.

use std::{pin::Pin, sync::Arc};

use {async_trait::async_trait, tokio_stream::Stream};

use hearth_common::ToolError;

/// Events emitted during a streaming completion.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Text content delta.
    Delta(String),
    /// A tool call started.
    ToolCallStart { id: String, name: String, index: usize },
    /// JSON fragment to append to a tool call's arguments.
    ToolCallArgumentsDelta { index: usize, delta: String },
    /// Stream completed.
    Done(Usage),
    /// Stream failed.
    Error(String),
}

/// Response from one completion call.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// An LLM backend capable of chat completion with tool calling.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider family name (for logs and attribution).
    fn name(&self) -> &str;

    /// Model identifier as sent on the wire.
    fn id(&self) -> &str;

    async fn complete(
        &self,
        messages: &[serde_json::Value],
        tools: &[serde_json::Value],
        temperature: Option<f32>,
    ) -> Result<CompletionResponse, ToolError>;

    /// Context window size in tokens.
    fn context_window(&self) -> u32 {
        128_000
    }

    /// Stream a completion. The default implementation surfaces one
    /// `complete` call as a delta followed by `Done`.
    fn stream(
        &self,
        messages: Vec<serde_json::Value>,
        temperature: Option<f32>,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>> {
        Box::pin(futures::stream::unfold(
            FallbackState::Pending { messages, temperature },
            move |state| async move {
                match state {
                    FallbackState::Pending { messages, temperature } => {
                        match self.complete(&messages, &[], temperature).await {
                            Ok(response) => {
                                let usage = response.usage;
                                match response.text {
                                    Some(text) => Some((
                                        StreamEvent::Delta(text),
                                        FallbackState::Finishing { usage },
                                    )),
                                    None => Some((
                                        StreamEvent::Done(usage),
                                        FallbackState::Exhausted,
                                    )),
                                }
                            },
                            Err(e) => Some((
                                StreamEvent::Error(e.to_string()),
                                FallbackState::Exhausted,
                            )),
                        }
                    },
                    FallbackState::Finishing { usage } => {
                        Some((StreamEvent::Done(usage), FallbackState::Exhausted))
                    },
                    FallbackState::Exhausted => None,
                }
            },
        ))
    }
}

enum FallbackState {
    Pending {
        messages: Vec<serde_json::Value>,
        temperature: Option<f32>,
    },
    Finishing {
        usage: Usage,
    },
    Exhausted,
}

/// Resolves a session's model identifier (`providerId::modelId` or a bare
/// default) to a concrete provider instance.
pub trait ProviderResolver: Send + Sync {
    fn resolve(&self, model: &str) -> Result<Arc<dyn LlmProvider>, ToolError>;
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, tokio_stream::StreamExt};

    struct FixedProvider;

    #[async_trait]
    impl LlmProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        fn id(&self) -> &str {
            "fixed-model"
        }

        async fn complete(
            &self,
            _messages: &[serde_json::Value],
            _tools: &[serde_json::Value],
            _temperature: Option<f32>,
        ) -> Result<CompletionResponse, ToolError> {
            Ok(CompletionResponse {
                text: Some("hello".into()),
                tool_calls: vec![],
                usage: Usage {
                    input_tokens: 5,
                    output_tokens: 2,
                },
            })
        }
    }

    #[tokio::test]
    async fn default_stream_yields_delta_then_done() {
        let provider = FixedProvider;
        let events: Vec<StreamEvent> = provider.stream(vec![], None).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::Delta(s) if s == "hello"));
        assert!(matches!(&events[1], StreamEvent::Done(u) if u.input_tokens == 5));
    }
}
