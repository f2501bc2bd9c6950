//! The runner orchestrator: LLM provider abstraction, the per-session
//! agent loop, runner handles with abort and permission plumbing, and
//! multi-thread task fan-out.

pub mod model;
pub mod openai;
pub mod orchestrator;
pub mod runner;
pub mod tasks;

pub use {
    model::{CompletionResponse, LlmProvider, ProviderResolver, StreamEvent, ToolCall, Usage},
    openai::OpenAiCompatProvider,
    orchestrator::{Orchestrator, PermissionRouter, RunnerHandle, StatusListener},
    tasks::{MultiThreadTask, TaskEntry, TaskManager, TaskMode, TaskSpec, TaskStatus},
};
