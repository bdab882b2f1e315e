//! # Repository Layer
//!
//! SeaORM-backed stores. Every method takes the connection explicitly, so
//! the same call works against the pool or inside a transaction, and every
//! query is scoped by tenant and project.

pub mod change_record;
pub mod conflict;
pub mod directory;
pub mod lock;
pub mod operation;
pub mod task;

pub use change_record::{ChangeRecordRepository, NewChange};
pub use conflict::ConflictRepository;
pub use directory::{DirectoryRepository, IngestStats, MembershipStore, OrganizationStore, UserStore};
pub use lock::LockRepository;
pub use operation::OperationRepository;
pub use task::{TaskFilter, TaskRepository};
