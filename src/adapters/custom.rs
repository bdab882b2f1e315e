//! User-supplied sources and the in-memory [`StaticSource`].
//!
//! Custom sources are registered by name on the [`AdapterRegistry`](super::AdapterRegistry)
//! and picked with `{"type": "custom", "name": "..."}`. `StaticSource` keeps a
//! snapshot plus an append-only change log whose sequence number is the cursor.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use super::source::{ChangeSet, ChangeType, DeletedEntity, SourceAdapter, SourceFilter, SyncCursor};
use crate::directory::{DirectoryRecord, DirectorySnapshot, EntityType, Scope};
use crate::sync::error::SyncError;

#[derive(Debug, Clone)]
struct LoggedChange {
    seq: u64,
    at: DateTime<Utc>,
    change_type: ChangeType,
    entity_type: EntityType,
    entity_id: String,
    record: Option<DirectoryRecord>,
}

#[derive(Debug, Default)]
struct StaticState {
    snapshot: DirectorySnapshot,
    log: Vec<LoggedChange>,
    next_seq: u64,
    unavailable: bool,
    full_fetches: u32,
}

/// In-memory source, used for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticSource {
    state: Mutex<StaticState>,
}

impl StaticSource {
    pub fn new(snapshot: DirectorySnapshot) -> Self {
        Self {
            state: Mutex::new(StaticState {
                snapshot,
                ..StaticState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StaticState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the snapshot without logging changes.
    pub fn set_snapshot(&self, snapshot: DirectorySnapshot) {
        self.lock().snapshot = snapshot;
    }

    pub fn snapshot(&self) -> DirectorySnapshot {
        self.lock().snapshot.clone()
    }

    /// Inserts or replaces an entity and logs the change.
    pub fn upsert(&self, record: DirectoryRecord) {
        let mut state = self.lock();
        let entity_type = record.entity_type();
        let existed = state.snapshot.get(entity_type, record.id()).is_some();
        let change_type = if existed {
            ChangeType::Updated
        } else {
            ChangeType::Created
        };
        let seq = state.next_seq + 1;
        state.next_seq = seq;
        state.log.push(LoggedChange {
            seq,
            at: Utc::now(),
            change_type,
            entity_type,
            entity_id: record.id().to_string(),
            record: Some(record.clone()),
        });
        state.snapshot.insert(record);
    }

    /// Removes an entity and logs a delete.
    pub fn remove(&self, entity_type: EntityType, id: &str) {
        let mut state = self.lock();
        state.snapshot.remove(entity_type, id);
        let seq = state.next_seq + 1;
        state.next_seq = seq;
        state.log.push(LoggedChange {
            seq,
            at: Utc::now(),
            change_type: ChangeType::Deleted,
            entity_type,
            entity_id: id.to_string(),
            record: None,
        });
    }

    /// Simulates a connectivity failure on init and every fetch while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn full_fetches(&self) -> u32 {
        self.lock().full_fetches
    }
}

#[async_trait]
impl SourceAdapter for StaticSource {
    fn kind(&self) -> &'static str {
        "custom"
    }

    async fn init(&self) -> Result<(), SyncError> {
        if self.lock().unavailable {
            return Err(SyncError::source_unavailable("static source marked unavailable"));
        }
        Ok(())
    }

    async fn fetch_full(
        &self,
        _scope: &Scope,
        entity_types: &[EntityType],
        filter: &SourceFilter,
    ) -> Result<DirectorySnapshot, SyncError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(SyncError::source_unavailable("static source marked unavailable"));
        }
        state.full_fetches += 1;

        let mut snapshot = state.snapshot.clone();
        snapshot.retain_types(entity_types);
        if !filter.is_empty() {
            snapshot
                .organizations
                .retain(|_, o| filter.matches(&serde_json::to_value(o).unwrap_or_default()));
            snapshot
                .users
                .retain(|_, u| filter.matches(&serde_json::to_value(u).unwrap_or_default()));
            snapshot
                .memberships
                .retain(|_, m| filter.matches(&serde_json::to_value(m).unwrap_or_default()));
        }
        Ok(snapshot)
    }

    async fn fetch_changes(
        &self,
        _scope: &Scope,
        entity_types: &[EntityType],
        since: Option<DateTime<Utc>>,
        cursor: Option<&SyncCursor>,
    ) -> Result<ChangeSet, SyncError> {
        let state = self.lock();
        if state.unavailable {
            return Err(SyncError::source_unavailable("static source marked unavailable"));
        }

        let after_seq = match cursor.map(|c| c.as_json().get("seq").and_then(|v| v.as_u64())) {
            Some(Some(seq)) => Some(seq),
            Some(None) => {
                return Err(SyncError::source_schema("static source cursor must carry a 'seq'"));
            }
            None => None,
        };

        let mut set = ChangeSet::default();
        for change in state.log.iter().filter(|c| entity_types.contains(&c.entity_type)) {
            let fresh = match (after_seq, since) {
                (Some(seq), _) => change.seq > seq,
                (None, Some(since)) => change.at > since,
                (None, None) => true,
            };
            if !fresh {
                continue;
            }
            set.observe(Some(change.at));
            let entry = set.entry(change.entity_type);
            match (change.change_type, &change.record) {
                (ChangeType::Created, Some(record)) => entry.created.push(record.clone()),
                (ChangeType::Updated, Some(record)) => entry.updated.push(record.clone()),
                _ => entry.deleted.push(DeletedEntity {
                    id: change.entity_id.clone(),
                    deleted_at: Some(change.at),
                }),
            }
        }
        set.next_cursor = Some(SyncCursor::from_json(json!({ "seq": state.next_seq })));
        Ok(set)
    }
}
