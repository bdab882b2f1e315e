//! Source and target adapters.
//!
//! Sources pull snapshots or changesets from upstream systems; targets apply
//! operations to the external directory (or collect them). Adapters are built
//! per task from the request's configuration by [`AdapterRegistry`].

pub mod api_target;
pub mod collecting_target;
pub mod custom;
pub mod database_source;
pub mod http_source;
pub mod push;
pub mod registry;
pub mod source;
pub mod target;

pub use crate::sync::error::{SyncError, SyncErrorKind};
pub use registry::{AdapterRegistry, SourceConfig, TargetConfig};
pub use source::{ChangeSet, ChangeType, DeletedEntity, EntityChanges, SourceAdapter, SourceFilter, SyncCursor};
pub use target::{RemoteState, TargetAdapter, TargetOutcome};
