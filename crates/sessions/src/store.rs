//! The in-memory session store.
//!
//! Single-writer discipline: all mutation goes through `&self` methods
//! that take the write lock; readers get cloned snapshots. Sync events are
//! emitted after the lock is released so the callback can never deadlock
//! against the store.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use {
    serde::{Deserialize, Serialize},
    tokio::sync::RwLock,
    tokio_util::sync::CancellationToken,
    tracing::debug,
};

use crate::message::{FileChange, FileChangeStatus, StreamMessage, TodoItem};
use hearth_common::now_ms;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Error,
}

/// One conversational context with its own log, workspace, and lifecycle.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub workspace: Option<PathBuf>,
    pub allowed_tools: Vec<String>,
    pub model: String,
    pub temperature: Option<f32>,
    /// Parent multi-thread task, when this session is a task child.
    pub task_id: Option<String>,
    pub status: SessionStatus,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub messages: Vec<StreamMessage>,
    pub todos: Vec<TodoItem>,
    pub file_changes: Vec<FileChange>,
    pub pinned: bool,
    /// Abort signal observed by every suspending operation of this session.
    pub abort: CancellationToken,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Serializable view of a session, used for history responses and sync
/// payloads. Excludes the abort token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub title: String,
    pub workspace: Option<String>,
    pub allowed_tools: Vec<String>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub status: SessionStatus,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub messages: Vec<StreamMessage>,
    pub todos: Vec<TodoItem>,
    pub file_changes: Vec<FileChange>,
    pub pinned: bool,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl From<&Session> for SessionSnapshot {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            title: s.title.clone(),
            workspace: s.workspace.as_ref().map(|p| p.display().to_string()),
            allowed_tools: s.allowed_tools.clone(),
            model: s.model.clone(),
            temperature: s.temperature,
            task_id: s.task_id.clone(),
            status: s.status,
            input_tokens: s.input_tokens,
            output_tokens: s.output_tokens,
            messages: s.messages.clone(),
            todos: s.todos.clone(),
            file_changes: s.file_changes.clone(),
            pinned: s.pinned,
            created_at_ms: s.created_at_ms,
            updated_at_ms: s.updated_at_ms,
        }
    }
}

/// Fields a host or orchestrator may change after creation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    pub title: Option<String>,
    pub workspace: Option<PathBuf>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub pinned: Option<bool>,
    pub status: Option<SessionStatus>,
    pub todos: Option<Vec<TodoItem>>,
}

/// What changed, for the host-side persistent mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncEventKind {
    Create,
    Update,
    Message,
    Todos,
}

/// The single sync callback, set exactly once at startup.
pub type SyncFn = Arc<dyn Fn(SyncEventKind, &str, serde_json::Value) + Send + Sync>;

/// Exclusive owner of live sessions.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    sync: Option<SyncFn>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SessionStore {
    #[must_use]
    pub fn new(sync: Option<SyncFn>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            sync,
        }
    }

    fn emit(&self, kind: SyncEventKind, session_id: &str, payload: serde_json::Value) {
        if let Some(ref sync) = self.sync {
            sync(kind, session_id, payload);
        }
    }

    /// Create a session and return its snapshot.
    pub async fn create(
        &self,
        title: &str,
        workspace: Option<PathBuf>,
        model: &str,
        allowed_tools: Vec<String>,
        temperature: Option<f32>,
        task_id: Option<String>,
    ) -> SessionSnapshot {
        let now = now_ms();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            workspace,
            allowed_tools,
            model: model.to_string(),
            temperature,
            task_id,
            status: SessionStatus::Idle,
            input_tokens: 0,
            output_tokens: 0,
            messages: Vec::new(),
            todos: Vec::new(),
            file_changes: Vec::new(),
            pinned: false,
            abort: CancellationToken::new(),
            created_at_ms: now,
            updated_at_ms: now,
        };
        let snapshot = SessionSnapshot::from(&session);
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);

        debug!(id = %snapshot.id, title, "session created");
        self.emit(
            SyncEventKind::Create,
            &snapshot.id,
            serde_json::to_value(&snapshot).unwrap_or_default(),
        );
        snapshot
    }

    /// Insert a session re-hydrated from host snapshot data, preserving its
    /// id and message history. Replaces any live session with the same id.
    pub async fn rehydrate(&self, snapshot: SessionSnapshot) {
        let session = Session {
            id: snapshot.id.clone(),
            title: snapshot.title,
            workspace: snapshot.workspace.map(PathBuf::from),
            allowed_tools: snapshot.allowed_tools,
            model: snapshot.model,
            temperature: snapshot.temperature,
            task_id: snapshot.task_id,
            status: SessionStatus::Idle,
            input_tokens: snapshot.input_tokens,
            output_tokens: snapshot.output_tokens,
            messages: snapshot.messages,
            todos: snapshot.todos,
            file_changes: snapshot.file_changes,
            pinned: snapshot.pinned,
            abort: CancellationToken::new(),
            created_at_ms: snapshot.created_at_ms,
            updated_at_ms: now_ms(),
        };
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
    }

    pub async fn get(&self, id: &str) -> Option<SessionSnapshot> {
        self.sessions.read().await.get(id).map(SessionSnapshot::from)
    }

    /// All sessions, newest first.
    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<SessionSnapshot> = sessions.values().map(SessionSnapshot::from).collect();
        out.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        out
    }

    /// The abort token for a session, if it exists.
    pub async fn abort_token(&self, id: &str) -> Option<CancellationToken> {
        self.sessions.read().await.get(id).map(|s| s.abort.clone())
    }

    /// Replace a session's abort token with a fresh one (a cancelled token
    /// must not leak into the next run) and return the new token.
    pub async fn rearm_abort(&self, id: &str) -> Option<CancellationToken> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id)?;
        session.abort = CancellationToken::new();
        Some(session.abort.clone())
    }

    pub async fn update(&self, id: &str, patch: SessionPatch) -> Option<SessionSnapshot> {
        let todos_changed = patch.todos.is_some();
        let snapshot = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(id)?;
            if let Some(title) = patch.title {
                session.title = title;
            }
            if let Some(workspace) = patch.workspace {
                session.workspace = Some(workspace);
            }
            if let Some(model) = patch.model {
                session.model = model;
            }
            if let Some(temperature) = patch.temperature {
                session.temperature = Some(temperature);
            }
            if let Some(pinned) = patch.pinned {
                session.pinned = pinned;
            }
            if let Some(status) = patch.status {
                session.status = status;
            }
            if let Some(todos) = patch.todos {
                session.todos = todos;
            }
            session.updated_at_ms = now_ms();
            SessionSnapshot::from(&*session)
        };
        self.emit(
            SyncEventKind::Update,
            id,
            serde_json::to_value(&snapshot).unwrap_or_default(),
        );
        if todos_changed {
            self.emit(
                SyncEventKind::Todos,
                id,
                serde_json::to_value(&snapshot.todos).unwrap_or_default(),
            );
        }
        Some(snapshot)
    }

    pub async fn set_status(&self, id: &str, status: SessionStatus) -> Option<SessionStatus> {
        self.update(id, SessionPatch {
            status: Some(status),
            ..SessionPatch::default()
        })
        .await
        .map(|s| s.status)
    }

    /// Remove a session. Cancels its abort token so any straggler work
    /// observes the teardown.
    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(session) => {
                session.abort.cancel();
                debug!(id, "session deleted");
                true
            },
            None => false,
        }
    }

    // ── Messages ────────────────────────────────────────────────────────

    /// Append a message; returns its index.
    pub async fn record_message(&self, id: &str, message: StreamMessage) -> Option<usize> {
        let (index, payload) = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(id)?;
            session.messages.push(message.clone());
            session.updated_at_ms = now_ms();
            (
                session.messages.len() - 1,
                serde_json::to_value(&message).unwrap_or_default(),
            )
        };
        self.emit(
            SyncEventKind::Message,
            id,
            serde_json::json!({ "index": index, "message": payload }),
        );
        Some(index)
    }

    /// Add token usage to the session's cumulative counters.
    pub async fn add_usage(&self, id: &str, input_tokens: u64, output_tokens: u64) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id) {
            session.input_tokens += input_tokens;
            session.output_tokens += output_tokens;
        }
    }

    /// Drop every message after index `i` (the message at `i` survives).
    pub async fn truncate_after(&self, id: &str, i: usize) -> Option<usize> {
        let remaining = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(id)?;
            session.messages.truncate(i + 1);
            session.updated_at_ms = now_ms();
            session.messages.len()
        };
        self.emit(
            SyncEventKind::Update,
            id,
            serde_json::json!({ "truncatedAfter": i }),
        );
        Some(remaining)
    }

    /// Replace the message at index `i`. Length-preserving; out-of-range
    /// indexes are a no-op returning `None`.
    pub async fn update_at(&self, id: &str, i: usize, message: StreamMessage) -> Option<()> {
        let payload = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(id)?;
            let slot = session.messages.get_mut(i)?;
            *slot = message.clone();
            session.updated_at_ms = now_ms();
            serde_json::to_value(&message).unwrap_or_default()
        };
        self.emit(
            SyncEventKind::Message,
            id,
            serde_json::json!({ "index": i, "message": payload, "edited": true }),
        );
        Some(())
    }

    // ── Todos ───────────────────────────────────────────────────────────

    pub async fn set_todos(&self, id: &str, todos: Vec<TodoItem>) -> Option<()> {
        let payload = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(id)?;
            session.todos = todos;
            session.updated_at_ms = now_ms();
            serde_json::to_value(&session.todos).unwrap_or_default()
        };
        self.emit(SyncEventKind::Todos, id, payload);
        Some(())
    }

    // ── File changes ────────────────────────────────────────────────────

    /// Merge new pending changes by path, summing additions and deletions.
    pub async fn add_file_changes(&self, id: &str, delta: Vec<FileChange>) -> Option<()> {
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(id)?;
            for change in delta {
                match session
                    .file_changes
                    .iter_mut()
                    .find(|c| c.path == change.path)
                {
                    Some(existing) => {
                        existing.additions += change.additions;
                        existing.deletions += change.deletions;
                        // A new edit reopens a previously confirmed path.
                        existing.status = FileChangeStatus::Pending;
                    },
                    None => session.file_changes.push(change),
                }
            }
            session.updated_at_ms = now_ms();
        }
        self.emit(SyncEventKind::Update, id, serde_json::json!({}));
        Some(())
    }

    /// Seal all pending changes. Returns the paths confirmed.
    pub async fn confirm_file_changes(&self, id: &str) -> Option<Vec<String>> {
        let confirmed = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(id)?;
            let mut confirmed = Vec::new();
            for change in &mut session.file_changes {
                if change.status == FileChangeStatus::Pending {
                    change.status = FileChangeStatus::Confirmed;
                    confirmed.push(change.path.clone());
                }
            }
            session.updated_at_ms = now_ms();
            confirmed
        };
        self.emit(
            SyncEventKind::Update,
            id,
            serde_json::json!({ "confirmed": confirmed }),
        );
        Some(confirmed)
    }

    /// Drop all pending changes (after a rollback). Returns the paths
    /// dropped so the caller can revert them on disk.
    pub async fn clear_file_changes(&self, id: &str) -> Option<Vec<String>> {
        let dropped = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(id)?;
            let dropped: Vec<String> = session
                .file_changes
                .iter()
                .filter(|c| c.status == FileChangeStatus::Pending)
                .map(|c| c.path.clone())
                .collect();
            session
                .file_changes
                .retain(|c| c.status == FileChangeStatus::Confirmed);
            session.updated_at_ms = now_ms();
            dropped
        };
        self.emit(
            SyncEventKind::Update,
            id,
            serde_json::json!({ "rolledBack": dropped }),
        );
        Some(dropped)
    }
}
