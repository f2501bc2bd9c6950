//! Error taxonomy shared across the runtime.
//!
//! Tool and runner failures are classified so the transcript can tell the
//! LLM *what kind* of failure happened: bad input it can correct, an
//! external service it can route around, a permission it cannot override,
//! or an internal fault it should report and stop on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes surfaced to the LLM transcript and the host.
#[derive(Error, Debug)]
pub enum ToolError {
    /// Invalid argument, missing workspace, unknown tool, blocked command
    /// or URL. The LLM is expected to adjust and retry differently.
    #[error("{0}")]
    User(String),

    /// Network failures, non-2xx provider responses, non-zero subprocess
    /// exits. Triggers fallback chains where one is defined.
    #[error("{0}")]
    External(String),

    /// The classifier said blocked, or an approval was denied or timed out.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Unexpected fault inside a handler. The owning session goes to the
    /// error state and the host receives `runner.error`.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ToolError {
    #[must_use]
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    #[must_use]
    pub fn external(message: impl Into<String>) -> Self {
        Self::External(message.into())
    }

    #[must_use]
    pub fn denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied(message.into())
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wire representation of the class, used in tool-result payloads.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::External(_) => "external",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        Self::External(e.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(e: serde_json::Error) -> Self {
        Self::User(format!("invalid JSON: {e}"))
    }
}

/// Uniform result shape returned by tool executors (`{success, output?, error?}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl ToolOutcome {
    #[must_use]
    pub fn ok(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            error_kind: None,
        }
    }

    #[must_use]
    pub fn err(error: &ToolError) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings() {
        assert_eq!(ToolError::user("x").kind(), "user");
        assert_eq!(ToolError::external("x").kind(), "external");
        assert_eq!(ToolError::denied("x").kind(), "permission_denied");
        assert_eq!(ToolError::internal("x").kind(), "internal");
    }

    #[test]
    fn denied_display_includes_prefix() {
        let e = ToolError::denied("approval timed out");
        assert_eq!(e.to_string(), "permission denied: approval timed out");
    }

    #[test]
    fn outcome_ok_shape() {
        let o = ToolOutcome::ok(serde_json::json!({"stdout": "hi"}));
        let v = serde_json::to_value(&o).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["output"]["stdout"], "hi");
        assert!(v.get("error").is_none());
    }

    #[test]
    fn outcome_err_shape() {
        let o = ToolOutcome::err(&ToolError::user("unknown tool: frobnicate"));
        let v = serde_json::to_value(&o).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], "unknown tool: frobnicate");
        assert_eq!(v["error_kind"], "user");
    }
}
