//! # Incremental Change Repository
//!
//! Durable log of captured deltas. Ids are derived from the change itself,
//! payload included, so re-fetching an overlapping range inserts nothing new
//! while two different states of one entity never share an id.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::adapters::source::{ChangeSet, ChangeType};
use crate::directory::{DirectoryRecord, EntityType, Scope, hash_value};
use crate::models::incremental_change::{ActiveModel, Column, Entity, Model};
use crate::sync::error::SyncError;

const INSERT_CHUNK: usize = 200;

/// One delta ready to be logged.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChange {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub change_type: ChangeType,
    pub changed_at: DateTime<Utc>,
    /// Normalized entity; `None` for deletes
    pub payload: Option<JsonValue>,
}

impl NewChange {
    pub fn id(&self, scope: &Scope) -> String {
        change_record_id(
            scope,
            self.entity_type,
            &self.entity_id,
            self.change_type,
            self.changed_at,
            self.payload.as_ref(),
        )
    }
}

pub fn change_record_id(
    scope: &Scope,
    entity_type: EntityType,
    entity_id: &str,
    change_type: ChangeType,
    changed_at: DateTime<Utc>,
    payload: Option<&JsonValue>,
) -> String {
    let tenant = scope.tenant_id.to_string();
    let project = scope.project_id.to_string();
    let at = changed_at.timestamp_micros().to_string();
    let content = payload.map(hash_value).unwrap_or_default();
    let mut hasher = Sha256::new();
    for part in [
        tenant.as_str(),
        project.as_str(),
        entity_type.as_str(),
        entity_id,
        change_type.as_str(),
        at.as_str(),
        content.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

/// Flattens a change set to one change per entity; entities without a
/// source timestamp are stamped with `captured_at`.
///
/// Within one list the later entry wins. Across lists the later `changed_at`
/// wins, and on a tie a delete never replaces a create or update.
pub fn changes_from_set(set: &ChangeSet, captured_at: DateTime<Utc>) -> Vec<NewChange> {
    let mut latest: BTreeMap<(EntityType, String), NewChange> = BTreeMap::new();
    let mut keep = |change: NewChange| {
        let key = (change.entity_type, change.entity_id.clone());
        let newer = latest.get(&key).is_none_or(|existing| {
            change.changed_at > existing.changed_at
                || (change.changed_at == existing.changed_at
                    && (change.change_type != ChangeType::Deleted
                        || existing.change_type == ChangeType::Deleted))
        });
        if newer {
            latest.insert(key, change);
        }
    };
    for (&entity_type, changes) in &set.changes {
        for (change_type, records) in [
            (ChangeType::Created, &changes.created),
            (ChangeType::Updated, &changes.updated),
        ] {
            for record in records {
                keep(NewChange {
                    entity_type,
                    entity_id: record.id().to_string(),
                    change_type,
                    changed_at: record_timestamp(record).unwrap_or(captured_at),
                    payload: Some(record.to_value()),
                });
            }
        }
        for deleted in &changes.deleted {
            keep(NewChange {
                entity_type,
                entity_id: deleted.id.clone(),
                change_type: ChangeType::Deleted,
                changed_at: deleted.deleted_at.unwrap_or(captured_at),
                payload: None,
            });
        }
    }
    let mut out: Vec<NewChange> = latest.into_values().collect();
    out.sort_by(|a, b| a.changed_at.cmp(&b.changed_at));
    out
}

fn record_timestamp(record: &DirectoryRecord) -> Option<DateTime<Utc>> {
    match record {
        DirectoryRecord::Organization(o) => o.source_updated_at,
        DirectoryRecord::User(u) => u.source_updated_at,
        DirectoryRecord::Membership(m) => m.source_updated_at,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeRecordRepository;

impl ChangeRecordRepository {
    pub fn new() -> Self {
        Self
    }

    /// Logs changes captured by `source`; already-logged changes are ignored.
    pub async fn record<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        source: &str,
        changes: &[NewChange],
    ) -> Result<(), SyncError> {
        let now = Utc::now().fixed_offset();
        for chunk in changes.chunks(INSERT_CHUNK) {
            let rows: Vec<ActiveModel> = chunk
                .iter()
                .map(|change| ActiveModel {
                    id: Set(change.id(scope)),
                    tenant_id: Set(scope.tenant_id),
                    project_id: Set(scope.project_id),
                    entity_type: Set(change.entity_type.as_str().to_string()),
                    entity_id: Set(change.entity_id.clone()),
                    change_type: Set(change.change_type.as_str().to_string()),
                    changed_at: Set(change.changed_at.fixed_offset()),
                    payload: Set(change.payload.clone()),
                    source: Set(source.to_string()),
                    processed: Set(false),
                    processed_at: Set(None),
                    task_id: Set(None),
                    created_at: Set(now),
                })
                .collect();
            Entity::insert_many(rows)
                .on_conflict(OnConflict::column(Column::Id).do_nothing().to_owned())
                .do_nothing()
                .exec(conn)
                .await?;
        }
        Ok(())
    }

    /// Unprocessed changes of the requested types in capture order.
    pub async fn unprocessed<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        entity_types: &[EntityType],
    ) -> Result<Vec<Model>, SyncError> {
        Ok(Entity::find()
            .filter(Column::TenantId.eq(scope.tenant_id))
            .filter(Column::ProjectId.eq(scope.project_id))
            .filter(Column::Processed.eq(false))
            .filter(Column::EntityType.is_in(entity_types.iter().map(|t| t.as_str())))
            .order_by_asc(Column::ChangedAt)
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .all(conn)
            .await?)
    }

    pub async fn mark_processed<C: ConnectionTrait>(
        &self,
        conn: &C,
        ids: &[String],
        task_id: Uuid,
    ) -> Result<(), SyncError> {
        let now = Utc::now().fixed_offset();
        for chunk in ids.chunks(INSERT_CHUNK) {
            Entity::update_many()
                .col_expr(Column::Processed, Expr::value(true))
                .col_expr(Column::ProcessedAt, Expr::value(Some(now)))
                .col_expr(Column::TaskId, Expr::value(Some(task_id)))
                .filter(Column::Id.is_in(chunk.iter().cloned()))
                .exec(conn)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::source::DeletedEntity;
    use crate::directory::User;

    #[test]
    fn ids_are_stable_per_change() {
        let scope = Scope::new(Uuid::new_v4(), Uuid::new_v4());
        let at = Utc::now();
        let payload = DirectoryRecord::User(User::new("u1", "alice")).to_value();
        let a = change_record_id(&scope, EntityType::User, "u1", ChangeType::Updated, at, Some(&payload));
        let b = change_record_id(&scope, EntityType::User, "u1", ChangeType::Updated, at, Some(&payload));
        let c = change_record_id(&scope, EntityType::User, "u1", ChangeType::Deleted, at, None);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let renamed = DirectoryRecord::User(User::new("u1", "alicia")).to_value();
        let d = change_record_id(&scope, EntityType::User, "u1", ChangeType::Updated, at, Some(&renamed));
        assert_ne!(a, d);
    }

    #[test]
    fn repeated_entity_keeps_latest_change() {
        let captured = Utc::now();
        let mut set = ChangeSet::default();
        let mut first = User::new("u1", "alice");
        first.display_name = "First".into();
        let mut second = first.clone();
        second.display_name = "Second".into();
        set.entry(EntityType::User).updated.push(DirectoryRecord::User(first));
        set.entry(EntityType::User).updated.push(DirectoryRecord::User(second));

        let changes = changes_from_set(&set, captured);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].payload.as_ref().unwrap()["displayName"], "Second");
    }

    #[test]
    fn later_delete_beats_earlier_update() {
        let captured = Utc::now();
        let mut set = ChangeSet::default();
        set.entry(EntityType::User)
            .updated
            .push(DirectoryRecord::User(User::new("u1", "alice")));
        set.entry(EntityType::User).deleted.push(DeletedEntity {
            id: "u1".into(),
            deleted_at: Some(captured + chrono::Duration::seconds(1)),
        });

        let changes = changes_from_set(&set, captured);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Deleted);

        // Same instant: the entity was re-created after the delete.
        let mut tied = ChangeSet::default();
        tied.entry(EntityType::User)
            .created
            .push(DirectoryRecord::User(User::new("u1", "alice")));
        tied.entry(EntityType::User).deleted.push(DeletedEntity {
            id: "u1".into(),
            deleted_at: None,
        });
        let changes = changes_from_set(&tied, captured);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Created);
    }

    #[test]
    fn change_set_flattens_with_payloads() {
        let captured = Utc::now();
        let mut set = ChangeSet::default();
        set.entry(EntityType::User)
            .created
            .push(DirectoryRecord::User(User::new("u1", "alice")));
        set.entry(EntityType::User).deleted.push(DeletedEntity {
            id: "u2".into(),
            deleted_at: None,
        });

        let changes = changes_from_set(&set, captured);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change_type, ChangeType::Created);
        assert!(changes[0].payload.is_some());
        assert_eq!(changes[1].change_type, ChangeType::Deleted);
        assert_eq!(changes[1].changed_at, captured);
        assert!(changes[1].payload.is_none());
    }
}
