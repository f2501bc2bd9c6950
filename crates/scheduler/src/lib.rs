//! Persistent scheduled tasks: SQLite store, 30-second tick loop,
//! pre-notification window, and the two-form schedule grammar.

pub mod schedule;
pub mod service;
pub mod store;

pub use {
    schedule::calculate_next,
    service::{ExecuteFn, NotifyFn, SchedulerService, TaskNotification},
    store::{ScheduledTask, TaskCreate, TaskPatch, TaskStore},
};
