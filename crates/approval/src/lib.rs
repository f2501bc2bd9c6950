//! Command safety: the two-tier pattern classifier and the asynchronous
//! human-in-the-loop approval coordinator.
//!
//! Blocked patterns are never executable under any circumstance; dangerous
//! patterns require operator approval in a private chat and are treated as
//! blocked in group chats.

pub mod classify;
pub mod coordinator;

pub use {
    classify::{BlockedPatterns, ChatContext, CommandClassifier, CommandVerdict},
    coordinator::{ApprovalCoordinator, PendingCommand},
};
