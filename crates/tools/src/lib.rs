//! Tool implementations and the dispatcher that polices them.
//!
//! Tools: run_command, file operations, web search/read, code sandbox,
//! memory, scheduled tasks. The dispatcher enforces path confinement, the
//! command classifier, the approval round-trip, and output truncation.

pub mod exec;
pub mod fs_tools;
pub mod memory;
pub mod registry;
pub mod sandbox;
pub mod schedule_tool;
pub mod web;

pub use registry::{Tool, ToolCtx, ToolDispatcher, ToolRegistry};

/// Shared HTTP client for tools that don't need custom configuration.
///
/// One `reqwest::Client` per process keeps the connection pool, resolver,
/// and TLS session cache warm across tool calls.
pub fn shared_http_client() -> &'static reqwest::Client {
    static CLIENT: std::sync::LazyLock<reqwest::Client> =
        std::sync::LazyLock::new(reqwest::Client::new);
    &CLIENT
}
