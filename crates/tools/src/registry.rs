//! The tool trait, registry, and dispatcher.

use std::{collections::HashMap, sync::Arc};

use {
    async_trait::async_trait,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    hearth_approval::{ApprovalCoordinator, ChatContext, CommandClassifier, CommandVerdict, PendingCommand},
    hearth_common::{truncate::truncate_middle, ToolError, ToolOutcome},
    hearth_guard::{PathGuard, UrlGuard},
    hearth_sessions::FileChange,
};

/// A command a tool wants to run, extracted for classification.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub cwd: String,
}

/// Callback invoked when a command needs operator approval, carrying the
/// pending record and the correlated tool-use id.
pub type PermissionFn = Arc<dyn Fn(PendingCommand, String) + Send + Sync>;

/// Callback receiving file changes produced by a tool call.
pub type FileChangeFn = Arc<dyn Fn(Vec<FileChange>) + Send + Sync>;

/// Per-invocation context handed to every tool.
#[derive(Clone)]
pub struct ToolCtx {
    pub session_id: String,
    pub chat_id: String,
    pub chat_context: ChatContext,
    pub path_guard: Arc<PathGuard>,
    pub url_guard: Arc<UrlGuard>,
    pub abort: CancellationToken,
    pub web_cache: Arc<crate::web::WebCache>,
    pub scheduler: Option<Arc<hearth_scheduler::SchedulerService>>,
    /// Session tool selector; empty means every registered tool.
    pub allowed_tools: Vec<String>,
    file_changes: Arc<std::sync::Mutex<Vec<FileChange>>>,
}

impl ToolCtx {
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        chat_id: impl Into<String>,
        chat_context: ChatContext,
        path_guard: Arc<PathGuard>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            chat_id: chat_id.into(),
            chat_context,
            path_guard,
            url_guard: Arc::new(UrlGuard::new()),
            abort: CancellationToken::new(),
            web_cache: Arc::new(crate::web::WebCache::default()),
            scheduler: None,
            allowed_tools: Vec::new(),
            file_changes: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn with_allowed_tools(mut self, allowed: Vec<String>) -> Self {
        self.allowed_tools = allowed;
        self
    }

    #[must_use]
    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    #[must_use]
    pub fn with_web_cache(mut self, cache: Arc<crate::web::WebCache>) -> Self {
        self.web_cache = cache;
        self
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<hearth_scheduler::SchedulerService>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Record a file change produced by the current tool call. The
    /// dispatcher drains these after execution.
    pub fn record_file_change(&self, change: FileChange) {
        if let Ok(mut sink) = self.file_changes.lock() {
            sink.push(change);
        }
    }

    fn drain_file_changes(&self) -> Vec<FileChange> {
        self.file_changes
            .lock()
            .map(|mut sink| std::mem::take(&mut *sink))
            .unwrap_or_default()
    }
}

/// An LLM-callable capability.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    /// True for tools in the file-operation set; the dispatcher rejects
    /// them when no workspace is configured.
    fn requires_workspace(&self) -> bool {
        false
    }

    /// For command tools: the shell command to classify before execution.
    fn command_request(&self, _args: &serde_json::Value) -> Option<CommandRequest> {
        None
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolCtx,
    ) -> Result<serde_json::Value, ToolError>;
}

/// Name → tool map. Cheap to clone for filtered child registries.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    #[must_use]
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas in the wire shape providers expect.
    #[must_use]
    pub fn list_schemas(&self) -> Vec<serde_json::Value> {
        self.tools
            .values()
            .map(|t| {
                serde_json::json!({
                    "name": t.name(),
                    "description": t.description(),
                    "parameters": t.parameters_schema(),
                })
            })
            .collect()
    }

    /// Copy restricted to an allowlist; an empty selector keeps everything.
    #[must_use]
    pub fn filtered(&self, allowed: &[String]) -> Self {
        if allowed.is_empty() {
            return self.clone();
        }
        let tools = self
            .tools
            .iter()
            .filter(|(name, _)| allowed.contains(name))
            .map(|(name, tool)| (name.clone(), Arc::clone(tool)))
            .collect();
        Self { tools }
    }
}

/// Routes invocations through the policy chain: lookup, workspace
/// precondition, classification, approval, execution, truncation.
pub struct ToolDispatcher {
    registry: ToolRegistry,
    classifier: Arc<CommandClassifier>,
    approvals: Arc<ApprovalCoordinator>,
    on_permission: Option<PermissionFn>,
    on_file_changes: Option<FileChangeFn>,
}

impl ToolDispatcher {
    #[must_use]
    pub fn new(
        registry: ToolRegistry,
        classifier: Arc<CommandClassifier>,
        approvals: Arc<ApprovalCoordinator>,
    ) -> Self {
        Self {
            registry,
            classifier,
            approvals,
            on_permission: None,
            on_file_changes: None,
        }
    }

    #[must_use]
    pub fn with_permission_handler(mut self, handler: PermissionFn) -> Self {
        self.on_permission = Some(handler);
        self
    }

    #[must_use]
    pub fn with_file_change_handler(mut self, handler: FileChangeFn) -> Self {
        self.on_file_changes = Some(handler);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    #[must_use]
    pub fn approvals(&self) -> &Arc<ApprovalCoordinator> {
        &self.approvals
    }

    /// Dispatch one invocation. Never panics, never throws past this
    /// boundary: every failure becomes a `ToolOutcome` the runner can put
    /// in the transcript.
    pub async fn dispatch(
        &self,
        name: &str,
        tool_use_id: &str,
        args: serde_json::Value,
        ctx: &ToolCtx,
    ) -> ToolOutcome {
        match self.try_dispatch(name, tool_use_id, args, ctx).await {
            Ok(output) => ToolOutcome::ok(output),
            Err(e) => {
                debug!(tool = name, error = %e, "tool call failed");
                ToolOutcome::err(&e)
            },
        }
    }

    async fn try_dispatch(
        &self,
        name: &str,
        tool_use_id: &str,
        args: serde_json::Value,
        ctx: &ToolCtx,
    ) -> Result<serde_json::Value, ToolError> {
        let Some(tool) = self.registry.get(name) else {
            return Err(ToolError::user(format!("unknown tool: {name}")));
        };

        if !ctx.allowed_tools.is_empty() && !ctx.allowed_tools.iter().any(|t| t == name) {
            return Err(ToolError::user(format!(
                "tool '{name}' is not enabled for this session"
            )));
        }

        if tool.requires_workspace() && !ctx.path_guard.has_workspace() {
            return Err(ToolError::user(
                "no workspace selected — choose a workspace folder first",
            ));
        }

        if let Some(request) = tool.command_request(&args) {
            self.gate_command(&request, tool_use_id, ctx).await?;
        }

        info!(tool = name, session = %ctx.session_id, "executing tool");
        let output = tool.execute(args, ctx).await?;
        let output = truncate_output_fields(output);

        let changes = ctx.drain_file_changes();
        if !changes.is_empty() {
            if let Some(ref handler) = self.on_file_changes {
                handler(changes);
            }
        }

        Ok(output)
    }

    /// Classification and, when required, the approval round-trip.
    async fn gate_command(
        &self,
        request: &CommandRequest,
        tool_use_id: &str,
        ctx: &ToolCtx,
    ) -> Result<(), ToolError> {
        match self.classifier.classify(&request.command, ctx.chat_context) {
            CommandVerdict::Safe => Ok(()),
            CommandVerdict::Blocked { reason } => {
                warn!(command = %request.command, reason = %reason, "command blocked");
                Err(ToolError::denied(format!(
                    "command blocked: {reason}"
                )))
            },
            CommandVerdict::NeedsApproval { reason } => {
                info!(command = %request.command, reason = %reason, "command needs approval");
                let (record, rx) = self
                    .approvals
                    .request(
                        &ctx.session_id,
                        &ctx.chat_id,
                        &request.command,
                        &request.cwd,
                        &reason,
                    )
                    .await;

                if let Some(ref handler) = self.on_permission {
                    handler(record, tool_use_id.to_string());
                }

                if self.approvals.wait(rx, &ctx.abort).await {
                    Ok(())
                } else {
                    Err(ToolError::denied(format!(
                        "command denied: {}",
                        request.command
                    )))
                }
            },
        }
    }
}

/// Apply head/tail truncation to every string field of the output object,
/// so one chatty command cannot blow the transcript.
fn truncate_output_fields(mut output: serde_json::Value) -> serde_json::Value {
    if let Some(obj) = output.as_object_mut() {
        for value in obj.values_mut() {
            if let Some(s) = value.as_str() {
                let truncated = truncate_middle(s);
                if truncated.len() != s.len() {
                    *value = serde_json::Value::String(truncated);
                }
            }
        }
    }
    output
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::time::Duration};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes its arguments"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }

        async fn execute(
            &self,
            args: serde_json::Value,
            _ctx: &ToolCtx,
        ) -> Result<serde_json::Value, ToolError> {
            Ok(args)
        }
    }

    struct NeedsWorkspaceTool;

    #[async_trait]
    impl Tool for NeedsWorkspaceTool {
        fn name(&self) -> &str {
            "read_file"
        }

        fn description(&self) -> &str {
            "file op"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }

        fn requires_workspace(&self) -> bool {
            true
        }

        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolCtx,
        ) -> Result<serde_json::Value, ToolError> {
            Ok(serde_json::json!({"content": "ok"}))
        }
    }

    struct FakeCommandTool;

    #[async_trait]
    impl Tool for FakeCommandTool {
        fn name(&self) -> &str {
            "run_command"
        }

        fn description(&self) -> &str {
            "shell"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }

        fn command_request(&self, args: &serde_json::Value) -> Option<CommandRequest> {
            Some(CommandRequest {
                command: args["command"].as_str().unwrap_or_default().to_string(),
                cwd: "/w".to_string(),
            })
        }

        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolCtx,
        ) -> Result<serde_json::Value, ToolError> {
            Ok(serde_json::json!({"stdout": "ran", "exit_code": 0}))
        }
    }

    struct BigOutputTool;

    #[async_trait]
    impl Tool for BigOutputTool {
        fn name(&self) -> &str {
            "big"
        }

        fn description(&self) -> &str {
            "emits a lot"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }

        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolCtx,
        ) -> Result<serde_json::Value, ToolError> {
            Ok(serde_json::json!({"stdout": "x".repeat(250 * 1024)}))
        }
    }

    fn dispatcher(tools: Vec<Arc<dyn Tool>>) -> ToolDispatcher {
        let mut registry = ToolRegistry::new();
        for t in tools {
            registry.register(t);
        }
        ToolDispatcher::new(
            registry,
            Arc::new(CommandClassifier::builtin()),
            Arc::new(ApprovalCoordinator::new(Duration::from_millis(50))),
        )
    }

    fn ctx() -> ToolCtx {
        ToolCtx::new("s1", "chat1", ChatContext::Private, Arc::new(PathGuard::none()))
    }

    fn ctx_with_workspace(dir: &tempfile::TempDir) -> ToolCtx {
        ToolCtx::new(
            "s1",
            "chat1",
            ChatContext::Private,
            Arc::new(PathGuard::new(Some(dir.path().to_path_buf()))),
        )
    }

    #[tokio::test]
    async fn unknown_tool_is_user_error() {
        let d = dispatcher(vec![Arc::new(EchoTool)]);
        let outcome = d.dispatch("frobnicate", "t1", serde_json::json!({}), &ctx()).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("unknown tool"));
        assert_eq!(outcome.error_kind.as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn file_op_requires_workspace() {
        let d = dispatcher(vec![Arc::new(NeedsWorkspaceTool)]);
        let outcome = d.dispatch("read_file", "t1", serde_json::json!({}), &ctx()).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("no workspace selected"));

        let dir = tempfile::tempdir().unwrap();
        let outcome = d
            .dispatch("read_file", "t1", serde_json::json!({}), &ctx_with_workspace(&dir))
            .await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn safe_command_executes() {
        let d = dispatcher(vec![Arc::new(FakeCommandTool)]);
        let outcome = d
            .dispatch("run_command", "t1", serde_json::json!({"command": "ls -la"}), &ctx())
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.output.unwrap()["stdout"], "ran");
    }

    #[tokio::test]
    async fn blocked_command_fails_synchronously() {
        let d = dispatcher(vec![Arc::new(FakeCommandTool)]);
        let outcome = d
            .dispatch("run_command", "t1", serde_json::json!({"command": "printenv"}), &ctx())
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind.as_deref(), Some("permission_denied"));
        assert!(outcome.error.unwrap().contains("blocked"));
    }

    #[tokio::test]
    async fn group_dangerous_is_blocked_with_hint() {
        let d = dispatcher(vec![Arc::new(FakeCommandTool)]);
        let mut c = ctx();
        c.chat_context = ChatContext::Group;
        let outcome = d
            .dispatch("run_command", "t1", serde_json::json!({"command": "rm -rf ."}), &c)
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("private chat"));
    }

    #[tokio::test]
    async fn dangerous_command_waits_then_denied_on_timeout() {
        let d = dispatcher(vec![Arc::new(FakeCommandTool)]);
        let outcome = d
            .dispatch("run_command", "t1", serde_json::json!({"command": "rm -rf ."}), &ctx())
            .await;
        // 50 ms approval timeout elapses with no operator → denied.
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("denied"));
    }

    #[tokio::test]
    async fn dangerous_command_approved_executes() {
        let d = Arc::new(dispatcher(vec![Arc::new(FakeCommandTool)]));

        // Approve as soon as the permission event fires.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let d2 = {
            let registry = d.registry().clone();
            let approvals = Arc::clone(d.approvals());
            ToolDispatcher::new(
                registry,
                Arc::new(CommandClassifier::builtin()),
                Arc::clone(&approvals),
            )
            .with_permission_handler(Arc::new(move |record, _tool_use_id| {
                let _ = tx.send(record.id);
            }))
        };
        let approvals = Arc::clone(d.approvals());
        let approver = tokio::spawn(async move {
            if let Some(id) = rx.recv().await {
                approvals.respond(&id, true).await;
            }
        });

        let outcome = d2
            .dispatch("run_command", "t1", serde_json::json!({"command": "rm -rf ."}), &ctx())
            .await;
        approver.await.unwrap();
        assert!(outcome.success, "approved command should run: {:?}", outcome.error);
    }

    #[tokio::test]
    async fn abort_resolves_pending_approval_to_denied() {
        let d = dispatcher(vec![Arc::new(FakeCommandTool)]);
        let c = ctx();
        c.abort.cancel();
        let start = std::time::Instant::now();
        let outcome = d
            .dispatch("run_command", "t1", serde_json::json!({"command": "rm -rf ."}), &c)
            .await;
        assert!(!outcome.success);
        assert!(start.elapsed() < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn oversized_output_truncated_with_marker() {
        let d = dispatcher(vec![Arc::new(BigOutputTool)]);
        let outcome = d.dispatch("big", "t1", serde_json::json!({}), &ctx()).await;
        let stdout = outcome.output.unwrap()["stdout"].as_str().unwrap().to_string();
        assert!(stdout.len() <= 100 * 1024 + 128);
        assert!(stdout.contains("250 KiB total"));
    }

    #[tokio::test]
    async fn file_changes_forwarded_to_handler() {
        struct WritingTool;

        #[async_trait]
        impl Tool for WritingTool {
            fn name(&self) -> &str {
                "write_file"
            }
            fn description(&self) -> &str {
                "writes"
            }
            fn parameters_schema(&self) -> serde_json::Value {
                serde_json::json!({"type": "object"})
            }
            async fn execute(
                &self,
                _args: serde_json::Value,
                ctx: &ToolCtx,
            ) -> Result<serde_json::Value, ToolError> {
                ctx.record_file_change(FileChange::pending("a.rs", 3, 1));
                Ok(serde_json::json!({"written": true}))
            }
        }

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(WritingTool));
        let d = ToolDispatcher::new(
            registry,
            Arc::new(CommandClassifier::builtin()),
            Arc::new(ApprovalCoordinator::default()),
        )
        .with_file_change_handler(Arc::new(move |changes| {
            seen_clone.lock().unwrap().extend(changes);
        }));

        let outcome = d.dispatch("write_file", "t1", serde_json::json!({}), &ctx()).await;
        assert!(outcome.success);
        let changes = seen.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "a.rs");
    }

    #[tokio::test]
    async fn tool_outside_session_selector_rejected() {
        let d = dispatcher(vec![Arc::new(EchoTool), Arc::new(BigOutputTool)]);
        let c = ctx().with_allowed_tools(vec!["echo".to_string()]);

        let outcome = d.dispatch("echo", "t1", serde_json::json!({}), &c).await;
        assert!(outcome.success);

        let outcome = d.dispatch("big", "t1", serde_json::json!({}), &c).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("not enabled"));
    }

    #[test]
    fn registry_filtering() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(BigOutputTool));

        assert_eq!(registry.tool_names(), vec!["big", "echo"]);
        let filtered = registry.filtered(&["echo".to_string()]);
        assert_eq!(filtered.tool_names(), vec!["echo"]);
        // Empty selector keeps everything.
        assert_eq!(registry.filtered(&[]).tool_names().len(), 2);
    }

    #[test]
    fn schemas_include_all_fields() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let schemas = registry.list_schemas();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0]["name"], "echo");
        assert!(schemas[0]["parameters"].is_object());
    }
}
