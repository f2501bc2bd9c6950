//! Host protocol: newline-delimited JSON over stdio (and the gateway
//! WebSocket, which carries identical frames).
//!
//! One JSON object per line. An empty line is a no-op. A malformed line is
//! fatal so the host restarts the runtime cleanly. Unknown *event* types
//! inside a well-formed frame are tolerated for forward compatibility.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Constants ────────────────────────────────────────────────────────────────

/// Scheduler sweep interval.
pub const TICK_INTERVAL_MS: u64 = 30_000;
/// Operator approval window; strictly below the host RPC timeout.
pub const APPROVAL_TIMEOUT_MS: u64 = 60_000;
/// Host RPC timeout the approval window must stay under.
pub const HOST_RPC_TIMEOUT_MS: u64 = 90_000;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Fatal: the host connection is corrupt, fail fast.
    #[error("malformed protocol line: {0}")]
    Malformed(String),
}

// ── Inbound ──────────────────────────────────────────────────────────────────

/// Frames received from the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Inbound {
    ClientEvent { event: ClientEvent },
    /// Correlated reply from the host-owned scheduler surface.
    SchedulerResponse {
        #[serde(rename = "requestId")]
        request_id: String,
        payload: serde_json::Value,
    },
}

/// Everything a host can ask of the runtime.
///
/// Internally tagged on `event`; payload fields sit beside the tag.
/// Complex payloads stay opaque `Value`s — the owning component parses
/// them, the protocol layer only routes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum ClientEvent {
    #[serde(rename = "session.list")]
    SessionList,
    #[serde(rename = "session.history")]
    SessionHistory {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "session.start")]
    SessionStart {
        prompt: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        workspace: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default, rename = "allowedTools")]
        allowed_tools: Option<Vec<String>>,
        #[serde(default, rename = "chatId")]
        chat_id: Option<String>,
        #[serde(default, rename = "chatContext")]
        chat_context: Option<String>,
    },
    #[serde(rename = "session.continue")]
    SessionContinue {
        #[serde(rename = "sessionId")]
        session_id: String,
        prompt: String,
        /// Snapshot for re-hydration after a runtime restart.
        #[serde(default)]
        snapshot: Option<serde_json::Value>,
    },
    #[serde(rename = "session.stop")]
    SessionStop {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "session.delete")]
    SessionDelete {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "session.pin")]
    SessionPin {
        #[serde(rename = "sessionId")]
        session_id: String,
        pinned: bool,
    },
    #[serde(rename = "session.update")]
    SessionUpdate {
        #[serde(rename = "sessionId")]
        session_id: String,
        patch: serde_json::Value,
    },
    #[serde(rename = "session.update-cwd")]
    SessionUpdateCwd {
        #[serde(rename = "sessionId")]
        session_id: String,
        cwd: String,
    },
    #[serde(rename = "permission.response")]
    PermissionResponse {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        approved: bool,
    },
    #[serde(rename = "message.edit")]
    MessageEdit {
        #[serde(rename = "sessionId")]
        session_id: String,
        index: usize,
        prompt: String,
        #[serde(default)]
        snapshot: Option<serde_json::Value>,
    },
    #[serde(rename = "settings.get")]
    SettingsGet,
    #[serde(rename = "settings.save")]
    SettingsSave { settings: serde_json::Value },
    #[serde(rename = "models.get")]
    ModelsGet,
    #[serde(rename = "file_changes.confirm")]
    FileChangesConfirm {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "file_changes.rollback")]
    FileChangesRollback {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "thread.list")]
    ThreadList {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    #[serde(rename = "task.create")]
    TaskCreate { params: serde_json::Value },
    #[serde(rename = "task.start")]
    TaskStart {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    #[serde(rename = "task.stop")]
    TaskStop {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    #[serde(rename = "task.delete")]
    TaskDelete {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    #[serde(rename = "llm.providers.get")]
    LlmProvidersGet,
    #[serde(rename = "llm.providers.save")]
    LlmProvidersSave { providers: serde_json::Value },
    #[serde(rename = "llm.models.test")]
    LlmModelsTest {
        #[serde(rename = "providerId")]
        provider_id: String,
    },
    #[serde(rename = "llm.models.fetch")]
    LlmModelsFetch {
        #[serde(rename = "providerId")]
        provider_id: String,
    },
    #[serde(rename = "llm.models.check")]
    LlmModelsCheck,
    #[serde(rename = "skills.get")]
    SkillsGet,
    #[serde(rename = "skills.refresh")]
    SkillsRefresh,
    #[serde(rename = "skills.toggle")]
    SkillsToggle {
        #[serde(rename = "skillId")]
        skill_id: String,
        enabled: bool,
    },
    #[serde(rename = "skills.set-marketplace")]
    SkillsSetMarketplace { url: String },
    /// Forward compatibility: unknown event names are tolerated, not fatal.
    #[serde(other)]
    Unknown,
}

// ── Outbound ─────────────────────────────────────────────────────────────────

/// Frames emitted to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Outbound {
    ServerEvent { event: ServerEvent },
    /// Out-of-band request to the host-owned scheduler surface; answered
    /// by an inbound `scheduler-response` with the same id.
    SchedulerRequest {
        #[serde(rename = "requestId")]
        request_id: String,
        payload: serde_json::Value,
    },
    Log {
        level: LogLevel,
        context: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Server-push events. Per-session events are emitted in observation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerEvent {
    #[serde(rename = "session.list")]
    SessionList { sessions: serde_json::Value },
    #[serde(rename = "session.history")]
    SessionHistory { session: serde_json::Value },
    #[serde(rename = "session.status")]
    SessionStatus {
        #[serde(rename = "sessionId")]
        session_id: String,
        status: String,
    },
    #[serde(rename = "session.deleted")]
    SessionDeleted {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "session.sync")]
    SessionSync {
        kind: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        payload: serde_json::Value,
    },
    #[serde(rename = "stream.user_prompt")]
    StreamUserPrompt {
        #[serde(rename = "sessionId")]
        session_id: String,
        index: usize,
        content: String,
    },
    #[serde(rename = "stream.message")]
    StreamMessage {
        #[serde(rename = "sessionId")]
        session_id: String,
        index: usize,
        message: serde_json::Value,
    },
    #[serde(rename = "permission.required")]
    PermissionRequired {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        command: String,
        reason: String,
        cwd: String,
    },
    #[serde(rename = "runner.error")]
    RunnerError {
        #[serde(rename = "sessionId")]
        session_id: String,
        error: String,
    },
    #[serde(rename = "settings.loaded")]
    SettingsLoaded { settings: serde_json::Value },
    #[serde(rename = "models.loaded")]
    ModelsLoaded { models: serde_json::Value },
    #[serde(rename = "models.error")]
    ModelsError { error: String },
    #[serde(rename = "task.created")]
    TaskCreated { task: serde_json::Value },
    #[serde(rename = "task.status")]
    TaskStatus {
        #[serde(rename = "taskId")]
        task_id: String,
        status: String,
        #[serde(rename = "threadIds")]
        thread_ids: Vec<String>,
    },
    #[serde(rename = "task.deleted")]
    TaskDeleted {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    #[serde(rename = "task.error")]
    TaskError {
        #[serde(rename = "taskId")]
        task_id: String,
        error: String,
    },
    #[serde(rename = "thread.list")]
    ThreadListLoaded {
        #[serde(rename = "taskId")]
        task_id: String,
        threads: serde_json::Value,
    },
    #[serde(rename = "file_changes.confirmed")]
    FileChangesConfirmed {
        #[serde(rename = "sessionId")]
        session_id: String,
        paths: Vec<String>,
    },
    #[serde(rename = "file_changes.rolledback")]
    FileChangesRolledBack {
        #[serde(rename = "sessionId")]
        session_id: String,
        paths: Vec<String>,
    },
    #[serde(rename = "file_changes.error")]
    FileChangesError {
        #[serde(rename = "sessionId")]
        session_id: String,
        error: String,
    },
    #[serde(rename = "llm.providers.loaded")]
    LlmProvidersLoaded { providers: serde_json::Value },
    #[serde(rename = "llm.models.loaded")]
    LlmModelsLoaded {
        #[serde(rename = "providerId")]
        provider_id: String,
        models: serde_json::Value,
    },
    #[serde(rename = "llm.models.tested")]
    LlmModelsTested {
        #[serde(rename = "providerId")]
        provider_id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "llm.models.checked")]
    LlmModelsChecked { results: serde_json::Value },
    #[serde(rename = "llm.error")]
    LlmError { error: String },
    #[serde(rename = "skills.loaded")]
    SkillsLoaded { skills: serde_json::Value },
    #[serde(rename = "skills.error")]
    SkillsError { error: String },
}

impl ServerEvent {
    /// Session this event belongs to, when it is session-scoped. Used by
    /// the writer to preserve per-session ordering guarantees.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionStatus { session_id, .. }
            | Self::SessionDeleted { session_id }
            | Self::SessionSync { session_id, .. }
            | Self::StreamUserPrompt { session_id, .. }
            | Self::StreamMessage { session_id, .. }
            | Self::PermissionRequired { session_id, .. }
            | Self::RunnerError { session_id, .. }
            | Self::FileChangesConfirmed { session_id, .. }
            | Self::FileChangesRolledBack { session_id, .. }
            | Self::FileChangesError { session_id, .. } => Some(session_id),
            _ => None,
        }
    }
}

// ── Codec ────────────────────────────────────────────────────────────────────

/// Parse one inbound line. `Ok(None)` for an empty line; `Err` is fatal.
pub fn parse_inbound(line: &str) -> Result<Option<Inbound>, ProtocolError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| ProtocolError::Malformed(format!("{e} in {trimmed:.120}")))
}

/// Encode one outbound frame as a single line (no trailing newline).
#[must_use]
pub fn encode_outbound(frame: &Outbound) -> String {
    serde_json::to_string(frame).unwrap_or_else(|e| {
        // An unserializable frame is a programming error; emit a log frame
        // instead of corrupting the stream.
        format!(
            r#"{{"type":"log","level":"error","context":"protocol","message":"encode failed: {e}"}}"#
        )
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_line_is_noop() {
        assert!(parse_inbound("").unwrap().is_none());
        assert!(parse_inbound("   \t ").unwrap().is_none());
    }

    #[test]
    fn malformed_line_is_error() {
        assert!(parse_inbound("{ nope").is_err());
        assert!(parse_inbound("[1,2,3]").is_err());
    }

    #[test]
    fn parse_session_start() {
        let line = r#"{"type":"client-event","event":{"event":"session.start","prompt":"fix the bug","workspace":"/home/me/proj","model":"openai::gpt-4o"}}"#;
        let inbound = parse_inbound(line).unwrap().unwrap();
        match inbound {
            Inbound::ClientEvent {
                event: ClientEvent::SessionStart { prompt, workspace, model, .. },
            } => {
                assert_eq!(prompt, "fix the bug");
                assert_eq!(workspace.as_deref(), Some("/home/me/proj"));
                assert_eq!(model.as_deref(), Some("openai::gpt-4o"));
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_permission_response() {
        let line = r#"{"type":"client-event","event":{"event":"permission.response","sessionId":"s1","toolUseId":"t9","approved":true}}"#;
        let inbound = parse_inbound(line).unwrap().unwrap();
        assert_eq!(
            inbound,
            Inbound::ClientEvent {
                event: ClientEvent::PermissionResponse {
                    session_id: "s1".into(),
                    tool_use_id: "t9".into(),
                    approved: true,
                }
            }
        );
    }

    #[test]
    fn parse_scheduler_response() {
        let line = r#"{"type":"scheduler-response","requestId":"r1","payload":{"ok":true}}"#;
        let inbound = parse_inbound(line).unwrap().unwrap();
        match inbound {
            Inbound::SchedulerResponse { request_id, payload } => {
                assert_eq!(request_id, "r1");
                assert_eq!(payload["ok"], true);
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_tolerated() {
        let line = r#"{"type":"client-event","event":{"event":"session.teleport","sessionId":"s1"}}"#;
        let inbound = parse_inbound(line).unwrap().unwrap();
        assert_eq!(
            inbound,
            Inbound::ClientEvent {
                event: ClientEvent::Unknown
            }
        );
    }

    #[test]
    fn unknown_frame_type_is_fatal() {
        let line = r#"{"type":"mystery-frame","data":1}"#;
        assert!(parse_inbound(line).is_err());
    }

    #[test]
    fn encode_server_event_single_line() {
        let frame = Outbound::ServerEvent {
            event: ServerEvent::SessionStatus {
                session_id: "s1".into(),
                status: "running".into(),
            },
        };
        let line = encode_outbound(&frame);
        assert!(!line.contains('\n'));
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["type"], "server-event");
        assert_eq!(v["event"]["event"], "session.status");
        assert_eq!(v["event"]["sessionId"], "s1");
    }

    #[test]
    fn encode_log_frame() {
        let frame = Outbound::Log {
            level: LogLevel::Warn,
            context: "scheduler".into(),
            message: "task 9 failed".into(),
        };
        let v: serde_json::Value = serde_json::from_str(&encode_outbound(&frame)).unwrap();
        assert_eq!(v["type"], "log");
        assert_eq!(v["level"], "warn");
    }

    #[test]
    fn permission_required_round_trip() {
        let frame = Outbound::ServerEvent {
            event: ServerEvent::PermissionRequired {
                session_id: "s1".into(),
                tool_use_id: "t1".into(),
                command: "rm -rf .".into(),
                reason: "recursive delete".into(),
                cwd: "/w".into(),
            },
        };
        let line = encode_outbound(&frame);
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["event"]["event"], "permission.required");
        assert_eq!(v["event"]["toolUseId"], "t1");
    }

    #[test]
    fn session_id_extraction() {
        let e = ServerEvent::StreamMessage {
            session_id: "s7".into(),
            index: 3,
            message: serde_json::json!({}),
        };
        assert_eq!(e.session_id(), Some("s7"));
        let e = ServerEvent::ModelsError { error: "x".into() };
        assert_eq!(e.session_id(), None);
    }

    #[test]
    fn approval_window_below_rpc_timeout() {
        assert!(APPROVAL_TIMEOUT_MS < HOST_RPC_TIMEOUT_MS);
    }
}
