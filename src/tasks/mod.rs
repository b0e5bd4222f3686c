//! Background task supervision.
//!
//! Long-running tasks share the application cancellation token. A task that
//! fails cancels the token so the whole service shuts down rather than
//! running degraded.

pub mod manager;

pub use manager::{spawn_cancellable_task, spawn_draining_task};
