//! Collecting target: records operations instead of applying them.
//!
//! A projected view (seed state plus collected operations) backs
//! `fetch_current` and the create idempotency check, so a consumer that
//! applies changes itself can still drive full reconciliation.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use super::target::{RemoteState, TargetAdapter, TargetOutcome, wire_value};
use crate::directory::{DirectoryRecord, DirectorySnapshot, EntityKey, EntityType, Scope};
use crate::sync::error::SyncError;
use crate::sync::operation::OperationType;

#[derive(Debug, Clone, PartialEq)]
pub struct CollectedOperation {
    pub operation: OperationType,
    pub entity_type: EntityType,
    pub id: String,
    pub data: Option<Value>,
}

#[derive(Debug, Default)]
struct CollectingState {
    snapshot: DirectorySnapshot,
    modified_at: BTreeMap<EntityKey, DateTime<Utc>>,
    operations: Vec<CollectedOperation>,
}

#[derive(Debug, Default)]
pub struct CollectingTarget {
    state: Mutex<CollectingState>,
}

impl CollectingTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a known target state.
    pub fn seeded(snapshot: DirectorySnapshot) -> Self {
        Self {
            state: Mutex::new(CollectingState {
                snapshot,
                ..CollectingState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CollectingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Projected target state after every collected operation.
    pub fn snapshot(&self) -> DirectorySnapshot {
        self.lock().snapshot.clone()
    }

    pub fn operations(&self) -> Vec<CollectedOperation> {
        self.lock().operations.clone()
    }

    /// Overrides the recorded last-modified time of one entity.
    pub fn touch(&self, entity_type: EntityType, id: &str, at: DateTime<Utc>) {
        self.lock().modified_at.insert((entity_type, id.to_string()), at);
    }

    fn record(state: &mut CollectingState, op: CollectedOperation) {
        state
            .modified_at
            .insert((op.entity_type, op.id.clone()), Utc::now());
        state.operations.push(op);
    }
}

#[async_trait]
impl TargetAdapter for CollectingTarget {
    fn kind(&self) -> &'static str {
        "collecting"
    }

    async fn fetch_current(
        &self,
        _scope: &Scope,
        entity_types: &[EntityType],
    ) -> Result<RemoteState, SyncError> {
        let state = self.lock();
        let mut snapshot = state.snapshot.clone();
        snapshot.retain_types(entity_types);
        let modified_at = state
            .modified_at
            .iter()
            .filter(|((entity_type, _), _)| entity_types.contains(entity_type))
            .map(|(key, at)| (key.clone(), *at))
            .collect();
        Ok(RemoteState {
            snapshot,
            modified_at,
        })
    }

    async fn create(&self, _scope: &Scope, record: &DirectoryRecord) -> Result<TargetOutcome, SyncError> {
        let mut state = self.lock();
        let entity_type = record.entity_type();
        if state.snapshot.get(entity_type, record.id()).is_some() {
            return Ok(TargetOutcome::already_applied());
        }
        state.snapshot.insert(record.clone());
        Self::record(
            &mut state,
            CollectedOperation {
                operation: OperationType::Create,
                entity_type,
                id: record.id().to_string(),
                data: Some(wire_value(record)),
            },
        );
        Ok(TargetOutcome::applied())
    }

    async fn update(
        &self,
        _scope: &Scope,
        operation: OperationType,
        record: &DirectoryRecord,
    ) -> Result<TargetOutcome, SyncError> {
        let mut state = self.lock();
        let entity_type = record.entity_type();
        if state.snapshot.get(entity_type, record.id()).as_ref() == Some(record) {
            return Ok(TargetOutcome::already_applied());
        }
        state.snapshot.insert(record.clone());
        Self::record(
            &mut state,
            CollectedOperation {
                operation,
                entity_type,
                id: record.id().to_string(),
                data: Some(wire_value(record)),
            },
        );
        Ok(TargetOutcome::applied())
    }

    async fn delete(
        &self,
        _scope: &Scope,
        entity_type: EntityType,
        id: &str,
    ) -> Result<TargetOutcome, SyncError> {
        let mut state = self.lock();
        if state.snapshot.get(entity_type, id).is_none() {
            return Ok(TargetOutcome::already_applied());
        }
        state.snapshot.remove(entity_type, id);
        Self::record(
            &mut state,
            CollectedOperation {
                operation: OperationType::Delete,
                entity_type,
                id: id.to_string(),
                data: None,
            },
        );
        Ok(TargetOutcome::applied())
    }

    /// `{creates, updates, deletes}`, each grouped by entity type.
    fn collected(&self) -> Option<Value> {
        let state = self.lock();
        let mut creates: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
        let mut updates: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
        let mut deletes: BTreeMap<&str, Vec<Value>> = BTreeMap::new();

        for op in &state.operations {
            let key = op.entity_type.plural();
            match op.operation {
                OperationType::Create => creates
                    .entry(key)
                    .or_default()
                    .push(op.data.clone().unwrap_or(Value::Null)),
                OperationType::Delete => deletes.entry(key).or_default().push(json!({ "id": op.id })),
                other => {
                    let mut entry = Map::new();
                    entry.insert("operation".into(), Value::String(other.as_str().into()));
                    entry.insert("data".into(), op.data.clone().unwrap_or(Value::Null));
                    updates.entry(key).or_default().push(Value::Object(entry));
                }
            }
        }

        Some(json!({
            "creates": creates,
            "updates": updates,
            "deletes": deletes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Organization, User};
    use uuid::Uuid;

    fn scope() -> Scope {
        Scope::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[tokio::test]
    async fn create_twice_does_not_duplicate() {
        let target = CollectingTarget::new();
        let scope = scope();
        let org = DirectoryRecord::Organization(Organization::new("a", None, "A"));

        assert!(!target.create(&scope, &org).await.unwrap().already_applied);
        assert!(target.create(&scope, &org).await.unwrap().already_applied);
        assert_eq!(target.operations().len(), 1);

        let collected = target.collected().unwrap();
        assert_eq!(collected["creates"]["organizations"].as_array().unwrap().len(), 1);
        assert!(collected["creates"]["organizations"][0].get("synced").is_none());
    }

    #[tokio::test]
    async fn delete_of_missing_entity_is_already_applied() {
        let target = CollectingTarget::seeded(DirectorySnapshot::from_parts(
            vec![],
            vec![User::new("u1", "alice")],
            vec![],
        ));
        let scope = scope();
        assert!(!target.delete(&scope, EntityType::User, "u1").await.unwrap().already_applied);
        assert!(target.delete(&scope, EntityType::User, "u1").await.unwrap().already_applied);
        assert!(target.snapshot().users.is_empty());
        assert_eq!(target.collected().unwrap()["deletes"]["users"][0]["id"], "u1");
    }

    #[tokio::test]
    async fn fetch_current_reports_modified_times() {
        let target = CollectingTarget::new();
        let scope = scope();
        let user = DirectoryRecord::User(User::new("u1", "alice"));
        target.create(&scope, &user).await.unwrap();

        let state = target
            .fetch_current(&scope, &[EntityType::User, EntityType::Organization])
            .await
            .unwrap();
        assert!(state.snapshot.users.contains_key("u1"));
        assert!(state.modified(EntityType::User, "u1").is_some());

        let orgs_only = target.fetch_current(&scope, &[EntityType::Organization]).await.unwrap();
        assert!(orgs_only.snapshot.users.is_empty());
        assert!(orgs_only.modified_at.is_empty());
    }
}
