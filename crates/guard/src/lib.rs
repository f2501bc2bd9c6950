//! Confinement guards for filesystem paths and outbound URLs.
//!
//! Every tool that touches the filesystem resolves its target through
//! [`PathGuard`]; every tool that performs an HTTP request (including each
//! redirect hop) vets the target through [`UrlGuard`].

pub mod path;
pub mod url_guard;

pub use {
    path::PathGuard,
    url_guard::UrlGuard,
};

use thiserror::Error;

/// Rejection reasons shared by both guards.
#[derive(Error, Debug)]
pub enum GuardError {
    /// File operation attempted with no workspace configured.
    #[error("no workspace selected — choose a workspace folder first")]
    NoWorkspace,

    /// Resolved path escapes the workspace root.
    #[error("path '{0}' is outside the working directory")]
    OutsideWorkspace(String),

    /// Path could not be resolved at all.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// URL scheme, host, or resolved address is not allowed.
    #[error("blocked URL '{url}': {reason}")]
    BlockedUrl { url: String, reason: String },
}

impl From<GuardError> for hearth_common::ToolError {
    fn from(e: GuardError) -> Self {
        hearth_common::ToolError::User(e.to_string())
    }
}
