//! In-memory session state: message logs, todos, file changes.
//!
//! The store is the exclusive owner of live sessions. It is not
//! persistent — every mutation is mirrored to the host through a single
//! sync callback, and the host re-hydrates sessions by replaying snapshot
//! data on `session.continue` / `message.edit`.

pub mod message;
pub mod store;

pub use {
    message::{FileChange, FileChangeStatus, StreamMessage, TodoItem},
    store::{Session, SessionPatch, SessionSnapshot, SessionStatus, SessionStore, SyncEventKind},
};
