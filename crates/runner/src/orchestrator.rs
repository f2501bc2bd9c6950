//! Session runner lifecycle: handles, abort/permission plumbing, and the
//! start / continue / stop / edit operations the host protocol exposes.

use std::{collections::HashMap, sync::Arc};

use {
    tokio::sync::{mpsc::UnboundedSender, Mutex, RwLock},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    crate::{
        model::ProviderResolver,
        runner::{run_session_loop, RunContext},
    },
    hearth_approval::{ApprovalCoordinator, ChatContext, PendingCommand},
    hearth_common::ToolError,
    hearth_guard::PathGuard,
    hearth_protocol::ServerEvent,
    hearth_sessions::{SessionSnapshot, SessionStatus, SessionStore, StreamMessage},
    hearth_tools::{registry::PermissionFn, ToolCtx, ToolDispatcher},
    hearth_tools::web::WebCache,
};

/// Notified on every session status transition (task aggregation hooks in
/// here).
pub type StatusListener = Arc<dyn Fn(&str, SessionStatus) + Send + Sync>;

/// Handle to one live runner.
pub struct RunnerHandle {
    abort: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl RunnerHandle {
    /// Signal abort. Idempotent; completion is observed by awaiting the
    /// task (see [`Orchestrator::stop`]).
    pub fn abort(&self) {
        self.abort.cancel();
    }
}

/// Correlates `tool_use_id`s with approval-coordinator entries so the
/// host's `permission.response` can unblock the right future.
pub struct PermissionRouter {
    map: std::sync::Mutex<HashMap<String, String>>,
    approvals: Arc<ApprovalCoordinator>,
}

impl PermissionRouter {
    #[must_use]
    pub fn new(approvals: Arc<ApprovalCoordinator>) -> Self {
        Self {
            map: std::sync::Mutex::new(HashMap::new()),
            approvals,
        }
    }

    /// The dispatcher-side hook: remember the correlation, then surface
    /// the request as a `permission.required` event. The insert happens
    /// before the event leaves, so a prompt host response always finds
    /// its correlation.
    pub fn handler(
        self: &Arc<Self>,
        events: UnboundedSender<ServerEvent>,
    ) -> PermissionFn {
        let router = Arc::clone(self);
        Arc::new(move |record: PendingCommand, tool_use_id: String| {
            if let Ok(mut map) = router.map.lock() {
                map.insert(tool_use_id.clone(), record.id.clone());
            }
            let _ = events.send(ServerEvent::PermissionRequired {
                session_id: record.session_id,
                tool_use_id,
                command: record.command,
                reason: record.reason,
                cwd: record.cwd,
            });
        })
    }

    /// Resolve by tool-use id. Returns false for unknown or already
    /// consumed correlations.
    pub async fn resolve(&self, tool_use_id: &str, approved: bool) -> bool {
        let approval_id = match self.map.lock() {
            Ok(mut map) => map.remove(tool_use_id),
            Err(_) => None,
        };
        let Some(approval_id) = approval_id else {
            warn!(tool_use_id, "permission response with no pending request");
            return false;
        };
        self.approvals.respond(&approval_id, approved).await
    }
}

/// Per-session chat routing recorded at start time.
#[derive(Clone)]
struct ChatInfo {
    chat_id: String,
    context: ChatContext,
}

/// Owns the runner handles and drives every run.
pub struct Orchestrator {
    store: Arc<SessionStore>,
    dispatcher: Arc<ToolDispatcher>,
    resolver: Arc<dyn ProviderResolver>,
    permissions: Arc<PermissionRouter>,
    events: UnboundedSender<ServerEvent>,
    handles: Mutex<HashMap<String, RunnerHandle>>,
    chat_info: RwLock<HashMap<String, ChatInfo>>,
    web_cache: Arc<WebCache>,
    scheduler: RwLock<Option<Arc<hearth_scheduler::SchedulerService>>>,
    status_listener: RwLock<Option<StatusListener>>,
    system_prompt: String,
    default_model: String,
    default_workspace: Option<std::path::PathBuf>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SessionStore>,
        dispatcher: Arc<ToolDispatcher>,
        resolver: Arc<dyn ProviderResolver>,
        permissions: Arc<PermissionRouter>,
        events: UnboundedSender<ServerEvent>,
        web_cache: Arc<WebCache>,
        system_prompt: String,
        default_model: String,
        default_workspace: Option<std::path::PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            dispatcher,
            resolver,
            permissions,
            events,
            handles: Mutex::new(HashMap::new()),
            chat_info: RwLock::new(HashMap::new()),
            web_cache,
            scheduler: RwLock::new(None),
            status_listener: RwLock::new(None),
            system_prompt,
            default_model,
            default_workspace,
        })
    }

    /// Attach the scheduler so the `schedule_task` tool can reach it (set
    /// once, at wiring time).
    pub async fn set_scheduler(&self, scheduler: Arc<hearth_scheduler::SchedulerService>) {
        *self.scheduler.write().await = Some(scheduler);
    }

    /// Set the status listener (exactly once, at wiring time).
    pub async fn set_status_listener(&self, listener: StatusListener) {
        *self.status_listener.write().await = Some(listener);
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn web_cache(&self) -> &Arc<WebCache> {
        &self.web_cache
    }

    pub fn permissions(&self) -> &Arc<PermissionRouter> {
        &self.permissions
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn set_status(&self, session_id: &str, status: SessionStatus) {
        let _ = self.store.set_status(session_id, status).await;
        let _ = self.events.send(ServerEvent::SessionStatus {
            session_id: session_id.to_string(),
            status: status_str(status).to_string(),
        });
        if let Some(listener) = self.status_listener.read().await.clone() {
            listener(session_id, status);
        }
    }

    /// Create a session and start its first run.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_session(
        &self,
        prompt: &str,
        title: Option<String>,
        workspace: Option<std::path::PathBuf>,
        model: Option<String>,
        temperature: Option<f32>,
        allowed_tools: Vec<String>,
        chat_id: Option<String>,
        chat_context: ChatContext,
        task_id: Option<String>,
    ) -> Result<SessionSnapshot, ToolError> {
        let title = title.unwrap_or_else(|| {
            let mut t: String = prompt.chars().take(48).collect();
            if prompt.chars().count() > 48 {
                t.push('…');
            }
            t
        });
        let workspace = workspace.or_else(|| self.default_workspace.clone());
        let model = model.unwrap_or_else(|| self.default_model.clone());

        let session = self
            .store
            .create(&title, workspace, &model, allowed_tools, temperature, task_id)
            .await;

        self.chat_info.write().await.insert(session.id.clone(), ChatInfo {
            chat_id: chat_id.unwrap_or_default(),
            context: chat_context,
        });

        self.spawn_run(&session.id, Some(prompt.to_string())).await?;
        Ok(session)
    }

    /// Continue an existing session with a new prompt, re-hydrating from a
    /// host snapshot when the session is not live.
    pub async fn continue_session(
        &self,
        session_id: &str,
        prompt: &str,
        snapshot: Option<SessionSnapshot>,
    ) -> Result<(), ToolError> {
        if self.store.get(session_id).await.is_none() {
            match snapshot {
                Some(snapshot) => self.store.rehydrate(snapshot).await,
                None => {
                    return Err(ToolError::user(format!(
                        "unknown session: {session_id}"
                    )));
                },
            }
        }
        self.spawn_run(session_id, Some(prompt.to_string())).await
    }

    /// Abort the current runner, truncate after message `index`, rewrite
    /// the prompt there, and rerun on the truncated history.
    pub async fn edit_message(
        &self,
        session_id: &str,
        index: usize,
        prompt: &str,
        snapshot: Option<SessionSnapshot>,
    ) -> Result<(), ToolError> {
        if self.store.get(session_id).await.is_none() {
            if let Some(snapshot) = snapshot {
                self.store.rehydrate(snapshot).await;
            }
        }

        self.drain(session_id).await;
        self.store
            .truncate_after(session_id, index)
            .await
            .ok_or_else(|| ToolError::user(format!("unknown session: {session_id}")))?;
        self.store
            .update_at(session_id, index, StreamMessage::UserPrompt {
                content: prompt.to_string(),
            })
            .await
            .ok_or_else(|| ToolError::user(format!("no message at index {index}")))?;

        let _ = self.events.send(ServerEvent::StreamUserPrompt {
            session_id: session_id.to_string(),
            index,
            content: prompt.to_string(),
        });

        self.spawn_run(session_id, None).await
    }

    /// Stop the session's runner. Abort is drained before this returns —
    /// no event from the old runner can appear afterwards.
    pub async fn stop(&self, session_id: &str) {
        self.drain(session_id).await;
        self.dispatcher.approvals().cancel_all(session_id).await;
        self.set_status(session_id, SessionStatus::Idle).await;
    }

    /// Delete the session, stopping its runner first.
    pub async fn delete_session(&self, session_id: &str) {
        self.drain(session_id).await;
        self.dispatcher.approvals().cancel_all(session_id).await;
        self.chat_info.write().await.remove(session_id);
        if self.store.delete(session_id).await {
            let _ = self.events.send(ServerEvent::SessionDeleted {
                session_id: session_id.to_string(),
            });
        }
    }

    /// Resolve an operator permission response.
    pub async fn resolve_permission(&self, tool_use_id: &str, approved: bool) -> bool {
        self.permissions.resolve(tool_use_id, approved).await
    }

    /// Abort and await the current runner, if any. Idempotent.
    async fn drain(&self, session_id: &str) {
        let handle = self.handles.lock().await.remove(session_id);
        if let Some(handle) = handle {
            handle.abort.cancel();
            if let Err(e) = handle.join.await {
                warn!(session = session_id, error = %e, "runner task panicked");
            }
            debug!(session = session_id, "runner drained");
        }
    }

    /// Spawn one run for the session, recording `prompt` first when given.
    async fn spawn_run(&self, session_id: &str, prompt: Option<String>) -> Result<(), ToolError> {
        // An old runner must be fully gone before the new one starts, or
        // its events could interleave after the new runner's.
        self.drain(session_id).await;

        let session = self
            .store
            .get(session_id)
            .await
            .ok_or_else(|| ToolError::user(format!("unknown session: {session_id}")))?;

        let abort = self
            .store
            .rearm_abort(session_id)
            .await
            .ok_or_else(|| ToolError::internal("session vanished while starting"))?;

        let provider = self.resolver.resolve(&session.model)?;

        self.set_status(session_id, SessionStatus::Running).await;

        if let Some(prompt) = prompt {
            if let Some(index) = self
                .store
                .record_message(session_id, StreamMessage::UserPrompt {
                    content: prompt.clone(),
                })
                .await
            {
                let _ = self.events.send(ServerEvent::StreamUserPrompt {
                    session_id: session_id.to_string(),
                    index,
                    content: prompt,
                });
            }
        }

        let chat = self
            .chat_info
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or(ChatInfo {
                chat_id: String::new(),
                context: ChatContext::Private,
            });

        let workspace_guard = Arc::new(PathGuard::new(session.workspace.clone().map(Into::into)));
        let mut tool_ctx = ToolCtx::new(
            session_id.to_string(),
            chat.chat_id,
            chat.context,
            workspace_guard,
        )
        .with_abort(abort.clone())
        .with_web_cache(Arc::clone(&self.web_cache))
        .with_allowed_tools(session.allowed_tools.clone());
        if let Some(scheduler) = self.scheduler.read().await.clone() {
            tool_ctx = tool_ctx.with_scheduler(scheduler);
        }

        let rc = RunContext {
            session_id: session_id.to_string(),
            store: Arc::clone(&self.store),
            dispatcher: Arc::clone(&self.dispatcher),
            events: self.events.clone(),
            tool_ctx,
            system_prompt: self.system_prompt.clone(),
            temperature: session.temperature,
        };

        let events = self.events.clone();
        let store = Arc::clone(&self.store);
        let listener = self.status_listener.read().await.clone();
        let token = abort.clone();
        let sid = session_id.to_string();

        let join = tokio::spawn(async move {
            let result = run_session_loop(provider, &rc).await;
            match result {
                Ok(outcome) => {
                    let result_message = StreamMessage::Result {
                        content: outcome.text,
                        input_tokens: outcome.usage.input_tokens,
                        output_tokens: outcome.usage.output_tokens,
                    };
                    let payload = serde_json::to_value(&result_message).unwrap_or_default();
                    if let Some(index) = store.record_message(&sid, result_message).await {
                        let _ = events.send(ServerEvent::StreamMessage {
                            session_id: sid.clone(),
                            index,
                            message: payload,
                        });
                    }
                    let _ = store.set_status(&sid, SessionStatus::Completed).await;
                    let _ = events.send(ServerEvent::SessionStatus {
                        session_id: sid.clone(),
                        status: "completed".to_string(),
                    });
                    if let Some(listener) = listener {
                        listener(&sid, SessionStatus::Completed);
                    }
                    info!(session = %sid, "run completed");
                },
                Err(_) if token.is_cancelled() => {
                    // Aborted: `stop` owns the status transition.
                    debug!(session = %sid, "run aborted");
                },
                Err(e) => {
                    warn!(session = %sid, error = %e, "run failed");
                    let _ = store.set_status(&sid, SessionStatus::Error).await;
                    let _ = events.send(ServerEvent::RunnerError {
                        session_id: sid.clone(),
                        error: e.to_string(),
                    });
                    let _ = events.send(ServerEvent::SessionStatus {
                        session_id: sid.clone(),
                        status: "error".to_string(),
                    });
                    if let Some(listener) = listener {
                        listener(&sid, SessionStatus::Error);
                    }
                },
            }
        });

        self.handles.lock().await.insert(session_id.to_string(), RunnerHandle {
            abort,
            join,
        });
        Ok(())
    }
}

fn status_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Idle => "idle",
        SessionStatus::Running => "running",
        SessionStatus::Completed => "completed",
        SessionStatus::Error => "error",
    }
}
