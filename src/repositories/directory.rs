//! # Directory Store
//!
//! Intermediate store for the last-known-good organizations, users and
//! memberships of a scope. Each entity type has its own small store
//! interface; [`DirectoryRepository`] implements all three over SeaORM.
//! Every method takes the connection explicitly so callers can run it inside
//! a transaction.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::directory::{
    DirectoryEntity, DirectoryRecord, DirectorySnapshot, EntityType, Membership, Organization,
    Scope, User,
};
use crate::models::{membership, organization, user};
use crate::sync::error::SyncError;

fn to_utc(ts: Option<DateTimeWithTimeZone>) -> Option<DateTime<Utc>> {
    ts.map(|t| t.with_timezone(&Utc))
}

fn to_db(ts: Option<DateTime<Utc>>) -> Option<DateTimeWithTimeZone> {
    ts.map(|t| t.fixed_offset())
}

fn extra_map(value: JsonValue) -> Map<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    }
}

#[async_trait]
pub trait OrganizationStore {
    /// Every stored organization of the scope, soft-deleted rows included.
    async fn organizations<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
    ) -> Result<Vec<Organization>, SyncError>;

    /// Inserts or replaces the row keyed by `org.id`, sync state included.
    async fn save_organization<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        org: &Organization,
    ) -> Result<(), SyncError>;

    async fn mark_organization_synced<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), SyncError>;
}

#[async_trait]
pub trait UserStore {
    async fn users<C: ConnectionTrait>(&self, conn: &C, scope: &Scope) -> Result<Vec<User>, SyncError>;

    async fn save_user<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        user: &User,
    ) -> Result<(), SyncError>;

    async fn mark_user_synced<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), SyncError>;
}

#[async_trait]
pub trait MembershipStore {
    async fn memberships<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
    ) -> Result<Vec<Membership>, SyncError>;

    async fn save_membership<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        membership: &Membership,
    ) -> Result<(), SyncError>;

    async fn mark_membership_synced<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), SyncError>;
}

/// Counts produced by [`DirectoryRepository::ingest_snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

/// SeaORM-backed directory store
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryRepository;

impl From<organization::Model> for Organization {
    fn from(model: organization::Model) -> Self {
        Organization {
            id: model.external_id,
            parent_id: model.parent_id,
            name: model.name,
            code: model.code,
            sort_order: model.sort_order,
            status: model.status,
            extra: extra_map(model.extra),
            source_updated_at: to_utc(model.source_updated_at),
            synced: model.synced,
            deleted: model.deleted,
            deleted_at: to_utc(model.deleted_at),
            last_synced_at: to_utc(model.last_synced_at),
        }
    }
}

impl From<user::Model> for User {
    fn from(model: user::Model) -> Self {
        User {
            id: model.external_id,
            username: model.username,
            display_name: model.display_name,
            email: model.email,
            mobile: model.mobile,
            status: model.status,
            extra: extra_map(model.extra),
            source_updated_at: to_utc(model.source_updated_at),
            synced: model.synced,
            deleted: model.deleted,
            deleted_at: to_utc(model.deleted_at),
            last_synced_at: to_utc(model.last_synced_at),
        }
    }
}

impl From<membership::Model> for Membership {
    fn from(model: membership::Model) -> Self {
        Membership {
            id: model.external_id,
            org_id: model.org_id,
            user_id: model.user_id,
            is_primary: model.is_primary,
            position: model.position,
            extra: extra_map(model.extra),
            source_updated_at: to_utc(model.source_updated_at),
            synced: model.synced,
            deleted: model.deleted,
            deleted_at: to_utc(model.deleted_at),
            last_synced_at: to_utc(model.last_synced_at),
        }
    }
}

#[async_trait]
impl OrganizationStore for DirectoryRepository {
    async fn organizations<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
    ) -> Result<Vec<Organization>, SyncError> {
        let rows = organization::Entity::find()
            .filter(organization::Column::TenantId.eq(scope.tenant_id))
            .filter(organization::Column::ProjectId.eq(scope.project_id))
            .order_by_asc(organization::Column::ExternalId)
            .all(conn)
            .await?;
        Ok(rows.into_iter().map(Organization::from).collect())
    }

    async fn save_organization<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        org: &Organization,
    ) -> Result<(), SyncError> {
        let now = Utc::now().fixed_offset();
        let existing = organization::Entity::find()
            .filter(organization::Column::TenantId.eq(scope.tenant_id))
            .filter(organization::Column::ProjectId.eq(scope.project_id))
            .filter(organization::Column::ExternalId.eq(org.id.as_str()))
            .one(conn)
            .await?;

        let is_new = existing.is_none();
        let mut active = match existing {
            Some(model) => organization::ActiveModel::from(model),
            None => organization::ActiveModel {
                id: Set(Uuid::new_v4()),
                tenant_id: Set(scope.tenant_id),
                project_id: Set(scope.project_id),
                external_id: Set(org.id.clone()),
                created_at: Set(now),
                ..Default::default()
            },
        };
        active.parent_id = Set(org.parent_id.clone());
        active.name = Set(org.name.clone());
        active.code = Set(org.code.clone());
        active.sort_order = Set(org.sort_order);
        active.status = Set(org.status.clone());
        active.extra = Set(JsonValue::Object(org.extra.clone()));
        active.content_hash = Set(org.content_hash());
        active.source_updated_at = Set(to_db(org.source_updated_at));
        active.synced = Set(org.synced);
        active.deleted = Set(org.deleted);
        active.deleted_at = Set(to_db(org.deleted_at));
        active.last_synced_at = Set(to_db(org.last_synced_at));
        active.updated_at = Set(now);
        if is_new {
            active.insert(conn).await?;
        } else {
            active.update(conn).await?;
        }
        Ok(())
    }

    async fn mark_organization_synced<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        organization::Entity::update_many()
            .col_expr(organization::Column::Synced, true.into())
            .col_expr(organization::Column::LastSyncedAt, Some(at.fixed_offset()).into())
            .col_expr(organization::Column::UpdatedAt, Utc::now().fixed_offset().into())
            .filter(organization::Column::TenantId.eq(scope.tenant_id))
            .filter(organization::Column::ProjectId.eq(scope.project_id))
            .filter(organization::Column::ExternalId.eq(id))
            .exec(conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for DirectoryRepository {
    async fn users<C: ConnectionTrait>(&self, conn: &C, scope: &Scope) -> Result<Vec<User>, SyncError> {
        let rows = user::Entity::find()
            .filter(user::Column::TenantId.eq(scope.tenant_id))
            .filter(user::Column::ProjectId.eq(scope.project_id))
            .order_by_asc(user::Column::ExternalId)
            .all(conn)
            .await?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn save_user<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        record: &User,
    ) -> Result<(), SyncError> {
        let now = Utc::now().fixed_offset();
        let existing = user::Entity::find()
            .filter(user::Column::TenantId.eq(scope.tenant_id))
            .filter(user::Column::ProjectId.eq(scope.project_id))
            .filter(user::Column::ExternalId.eq(record.id.as_str()))
            .one(conn)
            .await?;

        let is_new = existing.is_none();
        let mut active = match existing {
            Some(model) => user::ActiveModel::from(model),
            None => user::ActiveModel {
                id: Set(Uuid::new_v4()),
                tenant_id: Set(scope.tenant_id),
                project_id: Set(scope.project_id),
                external_id: Set(record.id.clone()),
                created_at: Set(now),
                ..Default::default()
            },
        };
        active.username = Set(record.username.clone());
        active.display_name = Set(record.display_name.clone());
        active.email = Set(record.email.clone());
        active.mobile = Set(record.mobile.clone());
        active.status = Set(record.status.clone());
        active.extra = Set(JsonValue::Object(record.extra.clone()));
        active.content_hash = Set(record.content_hash());
        active.source_updated_at = Set(to_db(record.source_updated_at));
        active.synced = Set(record.synced);
        active.deleted = Set(record.deleted);
        active.deleted_at = Set(to_db(record.deleted_at));
        active.last_synced_at = Set(to_db(record.last_synced_at));
        active.updated_at = Set(now);
        if is_new {
            active.insert(conn).await?;
        } else {
            active.update(conn).await?;
        }
        Ok(())
    }

    async fn mark_user_synced<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        user::Entity::update_many()
            .col_expr(user::Column::Synced, true.into())
            .col_expr(user::Column::LastSyncedAt, Some(at.fixed_offset()).into())
            .col_expr(user::Column::UpdatedAt, Utc::now().fixed_offset().into())
            .filter(user::Column::TenantId.eq(scope.tenant_id))
            .filter(user::Column::ProjectId.eq(scope.project_id))
            .filter(user::Column::ExternalId.eq(id))
            .exec(conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MembershipStore for DirectoryRepository {
    async fn memberships<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
    ) -> Result<Vec<Membership>, SyncError> {
        let rows = membership::Entity::find()
            .filter(membership::Column::TenantId.eq(scope.tenant_id))
            .filter(membership::Column::ProjectId.eq(scope.project_id))
            .order_by_asc(membership::Column::ExternalId)
            .all(conn)
            .await?;
        Ok(rows.into_iter().map(Membership::from).collect())
    }

    async fn save_membership<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        record: &Membership,
    ) -> Result<(), SyncError> {
        let now = Utc::now().fixed_offset();
        let existing = membership::Entity::find()
            .filter(membership::Column::TenantId.eq(scope.tenant_id))
            .filter(membership::Column::ProjectId.eq(scope.project_id))
            .filter(membership::Column::ExternalId.eq(record.id.as_str()))
            .one(conn)
            .await?;

        let is_new = existing.is_none();
        let mut active = match existing {
            Some(model) => membership::ActiveModel::from(model),
            None => membership::ActiveModel {
                id: Set(Uuid::new_v4()),
                tenant_id: Set(scope.tenant_id),
                project_id: Set(scope.project_id),
                external_id: Set(record.id.clone()),
                created_at: Set(now),
                ..Default::default()
            },
        };
        active.org_id = Set(record.org_id.clone());
        active.user_id = Set(record.user_id.clone());
        active.is_primary = Set(record.is_primary);
        active.position = Set(record.position.clone());
        active.extra = Set(JsonValue::Object(record.extra.clone()));
        active.content_hash = Set(record.content_hash());
        active.source_updated_at = Set(to_db(record.source_updated_at));
        active.synced = Set(record.synced);
        active.deleted = Set(record.deleted);
        active.deleted_at = Set(to_db(record.deleted_at));
        active.last_synced_at = Set(to_db(record.last_synced_at));
        active.updated_at = Set(now);
        if is_new {
            active.insert(conn).await?;
        } else {
            active.update(conn).await?;
        }
        Ok(())
    }

    async fn mark_membership_synced<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        membership::Entity::update_many()
            .col_expr(membership::Column::Synced, true.into())
            .col_expr(membership::Column::LastSyncedAt, Some(at.fixed_offset()).into())
            .col_expr(membership::Column::UpdatedAt, Utc::now().fixed_offset().into())
            .filter(membership::Column::TenantId.eq(scope.tenant_id))
            .filter(membership::Column::ProjectId.eq(scope.project_id))
            .filter(membership::Column::ExternalId.eq(id))
            .exec(conn)
            .await?;
        Ok(())
    }
}

/// Merges `incoming` into `stored`: unchanged entities keep their sync state,
/// changed ones are flagged unsynced with the stored `lastSyncedAt` carried
/// over, and live stored entities missing from `incoming` are soft-deleted.
/// Returns entities to write in order: deletions first, then updates, then inserts.
fn merge_entities<E: DirectoryEntity>(
    stored: &BTreeMap<String, E>,
    incoming: &BTreeMap<String, E>,
    now: DateTime<Utc>,
    stats: &mut IngestStats,
) -> Vec<E> {
    let mut deletions = Vec::new();
    let mut updates = Vec::new();
    let mut inserts = Vec::new();

    for (id, current) in stored {
        if !current.is_deleted() && !incoming.contains_key(id) {
            let mut gone = current.clone();
            gone.mark_deleted(now);
            deletions.push(gone);
            stats.deleted += 1;
        }
    }

    for (id, entity) in incoming {
        match stored.get(id) {
            Some(current) if current.same_content(entity) => stats.unchanged += 1,
            Some(current) => {
                let mut changed = entity.clone();
                changed.set_sync_state(false, current.last_synced_at());
                if changed.is_deleted() && !current.is_deleted() {
                    stats.deleted += 1;
                    deletions.push(changed);
                } else {
                    stats.updated += 1;
                    updates.push(changed);
                }
            }
            None => {
                let mut fresh = entity.clone();
                fresh.set_sync_state(false, None);
                stats.inserted += 1;
                inserts.push(fresh);
            }
        }
    }

    deletions.extend(updates);
    deletions.extend(inserts);
    deletions
}

impl DirectoryRepository {
    pub fn new() -> Self {
        Self
    }

    /// Stored entities of the requested types, soft-deleted rows included.
    pub async fn load_snapshot<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        entity_types: &[EntityType],
    ) -> Result<DirectorySnapshot, SyncError> {
        let organizations = if entity_types.contains(&EntityType::Organization) {
            self.organizations(conn, scope).await?
        } else {
            Vec::new()
        };
        let users = if entity_types.contains(&EntityType::User) {
            self.users(conn, scope).await?
        } else {
            Vec::new()
        };
        let memberships = if entity_types.contains(&EntityType::Membership) {
            self.memberships(conn, scope).await?
        } else {
            Vec::new()
        };
        Ok(DirectorySnapshot::from_parts(organizations, users, memberships))
    }

    /// Reconciles the store with a full source snapshot of `entity_types`.
    pub async fn ingest_snapshot<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        incoming: &DirectorySnapshot,
        entity_types: &[EntityType],
        now: DateTime<Utc>,
    ) -> Result<IngestStats, SyncError> {
        let stored = self.load_snapshot(conn, scope, entity_types).await?;
        let mut stats = IngestStats::default();

        if entity_types.contains(&EntityType::Organization) {
            for o in merge_entities(&stored.organizations, &incoming.organizations, now, &mut stats) {
                self.save_organization(conn, scope, &o).await?;
            }
        }
        if entity_types.contains(&EntityType::User) {
            for u in merge_entities(&stored.users, &incoming.users, now, &mut stats) {
                self.save_user(conn, scope, &u).await?;
            }
        }
        if entity_types.contains(&EntityType::Membership) {
            for m in merge_entities(&stored.memberships, &incoming.memberships, now, &mut stats) {
                self.save_membership(conn, scope, &m).await?;
            }
        }

        tracing::debug!(
            scope = %scope,
            inserted = stats.inserted,
            updated = stats.updated,
            deleted = stats.deleted,
            unchanged = stats.unchanged,
            "ingested source snapshot"
        );
        Ok(stats)
    }

    pub async fn save_record<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        record: &DirectoryRecord,
    ) -> Result<(), SyncError> {
        match record {
            DirectoryRecord::Organization(o) => self.save_organization(conn, scope, o).await,
            DirectoryRecord::User(u) => self.save_user(conn, scope, u).await,
            DirectoryRecord::Membership(m) => self.save_membership(conn, scope, m).await,
        }
    }

    pub async fn mark_synced<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        entity_type: EntityType,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        match entity_type {
            EntityType::Organization => self.mark_organization_synced(conn, scope, id, at).await,
            EntityType::User => self.mark_user_synced(conn, scope, id, at).await,
            EntityType::Membership => self.mark_membership_synced(conn, scope, id, at).await,
        }
    }
}
