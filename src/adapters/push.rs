//! Source for systems that push changesets through `POST /notify/changes`.
//!
//! Pushed changes are already stored as change records when the task runs, so
//! the change fetch returns nothing new and hands the cursor back unchanged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::source::{ChangeSet, SourceAdapter, SourceFilter, SyncCursor};
use crate::directory::{DirectorySnapshot, EntityType, Scope};
use crate::sync::error::SyncError;

#[derive(Debug, Default, Clone, Copy)]
pub struct PushSource;

#[async_trait]
impl SourceAdapter for PushSource {
    fn kind(&self) -> &'static str {
        "push"
    }

    async fn fetch_full(
        &self,
        _scope: &Scope,
        _entity_types: &[EntityType],
        _filter: &SourceFilter,
    ) -> Result<DirectorySnapshot, SyncError> {
        Err(SyncError::configuration(
            "push sources cannot serve full snapshots; use an incremental sync",
        ))
    }

    async fn fetch_changes(
        &self,
        _scope: &Scope,
        _entity_types: &[EntityType],
        since: Option<DateTime<Utc>>,
        cursor: Option<&SyncCursor>,
    ) -> Result<ChangeSet, SyncError> {
        Ok(ChangeSet {
            next_cursor: cursor.cloned(),
            high_watermark: since,
            ..ChangeSet::default()
        })
    }
}
