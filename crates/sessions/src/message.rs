//! Message-log entries and per-session bookkeeping records.

use serde::{Deserialize, Serialize};

/// One entry in a session's message log.
///
/// Appended in order by the runner; never mutated except through the
/// store's explicit `update_at` (length-preserving) and `truncate_after`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    UserPrompt {
        content: String,
    },
    AssistantText {
        content: String,
    },
    ToolCall {
        tool_use_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        success: bool,
        content: serde_json::Value,
    },
    /// Final message of a run, carrying token usage.
    Result {
        content: String,
        input_tokens: u64,
        output_tokens: u64,
    },
    Status {
        status: String,
    },
}

impl StreamMessage {
    /// Plain-text rendering used when building summarization prompts.
    #[must_use]
    pub fn as_transcript_line(&self) -> String {
        match self {
            Self::UserPrompt { content } => format!("user: {content}"),
            Self::AssistantText { content } => format!("assistant: {content}"),
            Self::ToolCall { name, arguments, .. } => {
                format!("tool call: {name} {arguments}")
            },
            Self::ToolResult { success, content, .. } => {
                format!("tool result (success={success}): {content}")
            },
            Self::Result { content, .. } => format!("result: {content}"),
            Self::Status { status } => format!("status: {status}"),
        }
    }
}

/// Lifecycle of a recorded file edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeStatus {
    /// Rollback candidate (`git checkout -- <path>`).
    Pending,
    /// Sealed; no longer eligible for rollback.
    Confirmed,
}

/// A recorded edit to one workspace file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub additions: u64,
    pub deletions: u64,
    pub status: FileChangeStatus,
}

impl FileChange {
    #[must_use]
    pub fn pending(path: impl Into<String>, additions: u64, deletions: u64) -> Self {
        Self {
            path: path.into(),
            additions,
            deletions,
            status: FileChangeStatus::Pending,
        }
    }
}

/// One todo entry maintained by the LLM for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub text: String,
    pub done: bool,
}
