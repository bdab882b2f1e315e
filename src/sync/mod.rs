//! Sync engine: diffing, planning, execution and the task lifecycle.

pub mod checkpoint;
pub mod conflict;
pub mod diff;
pub mod error;
pub mod executor;
pub mod lock;
pub mod notifier;
pub mod operation;
pub mod task;
pub mod task_manager;

pub use error::{SyncError, SyncErrorKind};
pub use task_manager::{TaskManager, TaskManagerError, TaskResult};
