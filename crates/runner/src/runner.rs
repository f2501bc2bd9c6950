//! The per-session agent loop: drive the LLM, execute requested tools,
//! feed results back, repeat until the model answers in plain text.

use std::sync::Arc;

use {
    futures::FutureExt,
    tokio::sync::mpsc::UnboundedSender,
    tracing::{debug, info, warn},
};

use {
    crate::model::{LlmProvider, Usage},
    hearth_common::{ToolError, ToolOutcome},
    hearth_protocol::ServerEvent,
    hearth_sessions::{SessionStore, StreamMessage},
    hearth_tools::{ToolCtx, ToolDispatcher},
};

/// Tool-call loop iterations before the runner gives up.
const MAX_ITERATIONS: usize = 25;

/// Everything one run needs, bundled so the orchestrator can spawn it.
pub struct RunContext {
    pub session_id: String,
    pub store: Arc<SessionStore>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub events: UnboundedSender<ServerEvent>,
    pub tool_ctx: ToolCtx,
    pub system_prompt: String,
    pub temperature: Option<f32>,
}

/// Outcome of a completed (non-aborted) run.
#[derive(Debug)]
pub struct RunOutcome {
    pub text: String,
    pub iterations: usize,
    pub tool_calls_made: usize,
    pub usage: Usage,
}

/// Record a message in the session log and mirror it to the host.
async fn record_and_emit(rc: &RunContext, message: StreamMessage) {
    let payload = serde_json::to_value(&message).unwrap_or_default();
    if let Some(index) = rc.store.record_message(&rc.session_id, message).await {
        let _ = rc.events.send(ServerEvent::StreamMessage {
            session_id: rc.session_id.clone(),
            index,
            message: payload,
        });
    }
}

/// Rebuild the chat-completion message list from the session log.
fn history_to_chat(messages: &[StreamMessage], system_prompt: &str) -> Vec<serde_json::Value> {
    let mut chat = vec![serde_json::json!({
        "role": "system",
        "content": system_prompt,
    })];

    for message in messages {
        match message {
            StreamMessage::UserPrompt { content } => {
                chat.push(serde_json::json!({"role": "user", "content": content}));
            },
            StreamMessage::AssistantText { content } => {
                chat.push(serde_json::json!({"role": "assistant", "content": content}));
            },
            StreamMessage::ToolCall { tool_use_id, name, arguments } => {
                chat.push(serde_json::json!({
                    "role": "assistant",
                    "tool_calls": [{
                        "id": tool_use_id,
                        "type": "function",
                        "function": {"name": name, "arguments": arguments.to_string()},
                    }],
                }));
            },
            StreamMessage::ToolResult { tool_use_id, content, .. } => {
                chat.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content.to_string(),
                }));
            },
            // Result and status markers are runner bookkeeping, not
            // conversation turns.
            StreamMessage::Result { .. } | StreamMessage::Status { .. } => {},
        }
    }
    chat
}

/// Run the loop to completion. Returns `Err` with a user-kind error when
/// aborted; the orchestrator distinguishes abort from real failure via the
/// context's cancellation token.
pub async fn run_session_loop(
    provider: Arc<dyn LlmProvider>,
    rc: &RunContext,
) -> Result<RunOutcome, ToolError> {
    let tool_schemas = rc
        .dispatcher
        .registry()
        .filtered(&rc.tool_ctx.allowed_tools)
        .list_schemas();

    let history = rc
        .store
        .get(&rc.session_id)
        .await
        .ok_or_else(|| ToolError::internal(format!("session vanished: {}", rc.session_id)))?
        .messages;
    let mut messages = history_to_chat(&history, &rc.system_prompt);

    info!(
        session = %rc.session_id,
        provider = provider.name(),
        model = provider.id(),
        tools = tool_schemas.len(),
        history = messages.len(),
        "starting runner loop"
    );

    let mut iterations = 0;
    let mut tool_calls_made = 0;
    let mut total = Usage::default();

    loop {
        iterations += 1;
        if iterations > MAX_ITERATIONS {
            warn!(session = %rc.session_id, "runner exceeded max iterations");
            return Err(ToolError::internal(format!(
                "runner exceeded {MAX_ITERATIONS} iterations"
            )));
        }

        let response = tokio::select! {
            response = provider.complete(&messages, &tool_schemas, rc.temperature) => response?,
            () = rc.tool_ctx.abort.cancelled() => {
                debug!(session = %rc.session_id, "runner aborted while awaiting LLM");
                return Err(ToolError::user("run aborted"));
            },
        };

        total.input_tokens += response.usage.input_tokens;
        total.output_tokens += response.usage.output_tokens;
        rc.store
            .add_usage(
                &rc.session_id,
                response.usage.input_tokens,
                response.usage.output_tokens,
            )
            .await;

        if let Some(ref text) = response.text {
            record_and_emit(rc, StreamMessage::AssistantText {
                content: text.clone(),
            })
            .await;
        }

        if response.tool_calls.is_empty() {
            let text = response.text.unwrap_or_default();
            info!(
                session = %rc.session_id,
                iterations,
                tool_calls = tool_calls_made,
                "runner loop complete"
            );
            return Ok(RunOutcome {
                text,
                iterations,
                tool_calls_made,
                usage: total,
            });
        }

        if let Some(ref text) = response.text {
            messages.push(serde_json::json!({"role": "assistant", "content": text}));
        }

        for call in &response.tool_calls {
            tool_calls_made += 1;

            record_and_emit(rc, StreamMessage::ToolCall {
                tool_use_id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            })
            .await;
            messages.push(serde_json::json!({
                "role": "assistant",
                "tool_calls": [{
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.name, "arguments": call.arguments.to_string()},
                }],
            }));

            if rc.tool_ctx.abort.cancelled().now_or_never().is_some() {
                return Err(ToolError::user("run aborted"));
            }

            let outcome: ToolOutcome = rc
                .dispatcher
                .dispatch(&call.name, &call.id, call.arguments.clone(), &rc.tool_ctx)
                .await;
            let outcome_json = serde_json::to_value(&outcome).unwrap_or_default();

            record_and_emit(rc, StreamMessage::ToolResult {
                tool_use_id: call.id.clone(),
                success: outcome.success,
                content: outcome_json.clone(),
            })
            .await;
            messages.push(serde_json::json!({
                "role": "tool",
                "tool_call_id": call.id,
                "content": outcome_json.to_string(),
            }));
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::model::{CompletionResponse, ToolCall},
        async_trait::async_trait,
        hearth_approval::{ApprovalCoordinator, ChatContext, CommandClassifier},
        hearth_guard::PathGuard,
        hearth_tools::{Tool, ToolRegistry},
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(
            &self,
            args: serde_json::Value,
            _ctx: &ToolCtx,
        ) -> Result<serde_json::Value, ToolError> {
            Ok(args)
        }
    }

    /// Calls `echo` once, then verifies the result came back and answers.
    struct ToolOnceProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for ToolOnceProvider {
        fn name(&self) -> &str {
            "mock"
        }
        fn id(&self) -> &str {
            "mock-model"
        }

        async fn complete(
            &self,
            messages: &[serde_json::Value],
            _tools: &[serde_json::Value],
            _temperature: Option<f32>,
        ) -> Result<CompletionResponse, ToolError> {
            match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(CompletionResponse {
                    text: None,
                    tool_calls: vec![ToolCall {
                        id: "call_1".into(),
                        name: "echo".into(),
                        arguments: serde_json::json!({"text": "ping"}),
                    }],
                    usage: Usage { input_tokens: 10, output_tokens: 5 },
                }),
                _ => {
                    let tool_msg = messages
                        .iter()
                        .find(|m| m["role"] == "tool")
                        .expect("tool result fed back");
                    let content = tool_msg["content"].as_str().unwrap();
                    assert!(content.contains("ping"), "tool result content: {content}");
                    Ok(CompletionResponse {
                        text: Some("Echoed!".into()),
                        tool_calls: vec![],
                        usage: Usage { input_tokens: 20, output_tokens: 3 },
                    })
                },
            }
        }
    }

    struct TextProvider;

    #[async_trait]
    impl LlmProvider for TextProvider {
        fn name(&self) -> &str {
            "mock"
        }
        fn id(&self) -> &str {
            "mock-model"
        }
        async fn complete(
            &self,
            _messages: &[serde_json::Value],
            _tools: &[serde_json::Value],
            _temperature: Option<f32>,
        ) -> Result<CompletionResponse, ToolError> {
            Ok(CompletionResponse {
                text: Some("Hi!".into()),
                tool_calls: vec![],
                usage: Usage { input_tokens: 4, output_tokens: 2 },
            })
        }
    }

    async fn run_context(store: Arc<SessionStore>, session_id: String) -> (
        RunContext,
        tokio::sync::mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let dispatcher = Arc::new(ToolDispatcher::new(
            registry,
            Arc::new(CommandClassifier::builtin()),
            Arc::new(ApprovalCoordinator::default()),
        ));
        let (events, rx) = tokio::sync::mpsc::unbounded_channel();
        let tool_ctx = ToolCtx::new(
            session_id.clone(),
            "chat1",
            ChatContext::Private,
            Arc::new(PathGuard::none()),
        );
        (
            RunContext {
                session_id,
                store,
                dispatcher,
                events,
                tool_ctx,
                system_prompt: "You are a test agent.".into(),
                temperature: None,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn plain_text_run() {
        let store = Arc::new(SessionStore::new(None));
        let session = store.create("t", None, "mock::m", vec![], None, None).await;
        let _ = store
            .record_message(&session.id, StreamMessage::UserPrompt { content: "hi".into() })
            .await;
        let (rc, _rx) = run_context(Arc::clone(&store), session.id.clone()).await;

        let outcome = run_session_loop(Arc::new(TextProvider), &rc).await.unwrap();
        assert_eq!(outcome.text, "Hi!");
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.tool_calls_made, 0);

        let messages = store.get(&session.id).await.unwrap().messages;
        // user prompt + assistant text
        assert_eq!(messages.len(), 2);
        assert!(matches!(&messages[1], StreamMessage::AssistantText { content } if content == "Hi!"));
    }

    #[tokio::test]
    async fn tool_call_round_trip() {
        let store = Arc::new(SessionStore::new(None));
        let session = store.create("t", None, "mock::m", vec![], None, None).await;
        let _ = store
            .record_message(&session.id, StreamMessage::UserPrompt {
                content: "echo ping".into(),
            })
            .await;
        let (rc, mut rx) = run_context(Arc::clone(&store), session.id.clone()).await;

        let provider = Arc::new(ToolOnceProvider { calls: AtomicUsize::new(0) });
        let outcome = run_session_loop(provider, &rc).await.unwrap();
        assert_eq!(outcome.text, "Echoed!");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.tool_calls_made, 1);
        assert_eq!(outcome.usage.input_tokens, 30);

        // Log: user, tool_call, tool_result, assistant.
        let messages = store.get(&session.id).await.unwrap().messages;
        assert!(matches!(messages[1], StreamMessage::ToolCall { .. }));
        assert!(
            matches!(&messages[2], StreamMessage::ToolResult { success: true, .. })
        );
        assert!(matches!(messages[3], StreamMessage::AssistantText { .. }));

        // Events mirror the log in order.
        let mut indexes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::StreamMessage { index, .. } = event {
                indexes.push(index);
            }
        }
        assert_eq!(indexes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn unknown_tool_surfaced_to_transcript() {
        struct BadToolProvider {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl LlmProvider for BadToolProvider {
            fn name(&self) -> &str {
                "mock"
            }
            fn id(&self) -> &str {
                "mock-model"
            }
            async fn complete(
                &self,
                messages: &[serde_json::Value],
                _tools: &[serde_json::Value],
                _temperature: Option<f32>,
            ) -> Result<CompletionResponse, ToolError> {
                match self.calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Ok(CompletionResponse {
                        text: None,
                        tool_calls: vec![ToolCall {
                            id: "call_1".into(),
                            name: "no_such_tool".into(),
                            arguments: serde_json::json!({}),
                        }],
                        usage: Usage::default(),
                    }),
                    _ => {
                        let tool_msg =
                            messages.iter().find(|m| m["role"] == "tool").unwrap();
                        assert!(tool_msg["content"]
                            .as_str()
                            .unwrap()
                            .contains("unknown tool"));
                        Ok(CompletionResponse {
                            text: Some("recovered".into()),
                            tool_calls: vec![],
                            usage: Usage::default(),
                        })
                    },
                }
            }
        }

        let store = Arc::new(SessionStore::new(None));
        let session = store.create("t", None, "mock::m", vec![], None, None).await;
        let (rc, _rx) = run_context(Arc::clone(&store), session.id.clone()).await;

        let outcome = run_session_loop(
            Arc::new(BadToolProvider { calls: AtomicUsize::new(0) }),
            &rc,
        )
        .await
        .unwrap();
        // The error became a transcript entry and the model recovered.
        assert_eq!(outcome.text, "recovered");
    }

    #[tokio::test]
    async fn abort_during_llm_wait() {
        struct SlowProvider;

        #[async_trait]
        impl LlmProvider for SlowProvider {
            fn name(&self) -> &str {
                "slow"
            }
            fn id(&self) -> &str {
                "slow"
            }
            async fn complete(
                &self,
                _messages: &[serde_json::Value],
                _tools: &[serde_json::Value],
                _temperature: Option<f32>,
            ) -> Result<CompletionResponse, ToolError> {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                Ok(CompletionResponse {
                    text: Some("too late".into()),
                    tool_calls: vec![],
                    usage: Usage::default(),
                })
            }
        }

        let store = Arc::new(SessionStore::new(None));
        let session = store.create("t", None, "mock::m", vec![], None, None).await;
        let (rc, _rx) = run_context(Arc::clone(&store), session.id.clone()).await;

        let abort = rc.tool_ctx.abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            abort.cancel();
        });

        let start = std::time::Instant::now();
        let err = run_session_loop(Arc::new(SlowProvider), &rc).await.unwrap_err();
        assert!(err.to_string().contains("aborted"));
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn runaway_tool_loop_capped() {
        struct LoopingProvider;

        #[async_trait]
        impl LlmProvider for LoopingProvider {
            fn name(&self) -> &str {
                "loop"
            }
            fn id(&self) -> &str {
                "loop"
            }
            async fn complete(
                &self,
                _messages: &[serde_json::Value],
                _tools: &[serde_json::Value],
                _temperature: Option<f32>,
            ) -> Result<CompletionResponse, ToolError> {
                Ok(CompletionResponse {
                    text: None,
                    tool_calls: vec![ToolCall {
                        id: uuid::Uuid::new_v4().to_string(),
                        name: "echo".into(),
                        arguments: serde_json::json!({"text": "again"}),
                    }],
                    usage: Usage::default(),
                })
            }
        }

        let store = Arc::new(SessionStore::new(None));
        let session = store.create("t", None, "mock::m", vec![], None, None).await;
        let (rc, _rx) = run_context(Arc::clone(&store), session.id.clone()).await;

        let err = run_session_loop(Arc::new(LoopingProvider), &rc).await.unwrap_err();
        assert!(err.to_string().contains("iterations"));
    }

    #[test]
    fn history_round_trip_into_chat() {
        let history = vec![
            StreamMessage::UserPrompt { content: "do it".into() },
            StreamMessage::ToolCall {
                tool_use_id: "t1".into(),
                name: "run_command".into(),
                arguments: serde_json::json!({"command": "ls"}),
            },
            StreamMessage::ToolResult {
                tool_use_id: "t1".into(),
                success: true,
                content: serde_json::json!({"stdout": "a.rs"}),
            },
            StreamMessage::Result {
                content: "done".into(),
                input_tokens: 1,
                output_tokens: 1,
            },
        ];
        let chat = history_to_chat(&history, "sys");
        assert_eq!(chat[0]["role"], "system");
        assert_eq!(chat[1]["role"], "user");
        assert_eq!(chat[2]["role"], "assistant");
        assert_eq!(chat[2]["tool_calls"][0]["id"], "t1");
        assert_eq!(chat[3]["role"], "tool");
        // Result markers do not become chat turns.
        assert_eq!(chat.len(), 4);
    }
}
