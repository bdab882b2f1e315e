//! Target adapter contract.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::directory::{DirectoryRecord, DirectorySnapshot, EntityKey, EntityType, Scope};
use crate::sync::error::SyncError;
use crate::sync::operation::OperationType;

/// Target's current entities plus their last-modified timestamps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteState {
    pub snapshot: DirectorySnapshot,
    pub modified_at: BTreeMap<EntityKey, DateTime<Utc>>,
}

impl RemoteState {
    pub fn modified(&self, entity_type: EntityType, id: &str) -> Option<DateTime<Utc>> {
        self.modified_at.get(&(entity_type, id.to_string())).copied()
    }
}

/// Outcome of a mutating target call, stored as the operation result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOutcome {
    /// Target-side id when it differs from ours
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    /// The target already reflected this operation; nothing was changed
    #[serde(default)]
    pub already_applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

impl TargetOutcome {
    pub fn applied() -> Self {
        Self::default()
    }

    pub fn already_applied() -> Self {
        Self {
            already_applied: true,
            ..Self::default()
        }
    }
}

/// Payload sent to targets: the entity without sync bookkeeping fields.
pub fn wire_value(record: &DirectoryRecord) -> Value {
    let mut value = record.to_value();
    if let Some(object) = value.as_object_mut() {
        for key in ["synced", "deleted", "deletedAt", "lastSyncedAt", "sourceUpdatedAt"] {
            object.remove(key);
        }
    }
    value
}

#[async_trait]
pub trait TargetAdapter: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Full current state for the requested types.
    async fn fetch_current(
        &self,
        scope: &Scope,
        entity_types: &[EntityType],
    ) -> Result<RemoteState, SyncError>;

    /// Last-modified timestamps for specific entities; used by incremental
    /// conflict detection.
    async fn fetch_modified(
        &self,
        scope: &Scope,
        keys: &[EntityKey],
    ) -> Result<BTreeMap<EntityKey, DateTime<Utc>>, SyncError> {
        let mut types: Vec<EntityType> = keys.iter().map(|(t, _)| *t).collect();
        types.sort();
        types.dedup();
        let state = self.fetch_current(scope, &types).await?;
        Ok(keys
            .iter()
            .filter_map(|key| state.modified_at.get(key).map(|at| (key.clone(), *at)))
            .collect())
    }

    /// Must not create a duplicate when the entity already exists.
    async fn create(&self, scope: &Scope, record: &DirectoryRecord) -> Result<TargetOutcome, SyncError>;

    async fn update(
        &self,
        scope: &Scope,
        operation: OperationType,
        record: &DirectoryRecord,
    ) -> Result<TargetOutcome, SyncError>;

    /// Deleting an entity that is already gone succeeds.
    async fn delete(
        &self,
        scope: &Scope,
        entity_type: EntityType,
        id: &str,
    ) -> Result<TargetOutcome, SyncError>;

    /// Structured operation list for targets that collect instead of applying.
    fn collected(&self) -> Option<Value> {
        None
    }
}
