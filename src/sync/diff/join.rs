//! Relational-join comparison over the `diff_staging` table.
//!
//! Both sides are staged under a fresh session id, compared with three
//! queries (local-only, remote-only, changed) and the session rows are
//! removed afterwards whether or not the comparison succeeded.

use std::collections::BTreeMap;

use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseBackend, EntityTrait, QueryFilter, QueryResult, Set,
    Statement,
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ClassifiedDiff, TypeDiff};
use crate::directory::{DirectoryEntity, DirectorySnapshot, EntityType};
use crate::models::diff_staging;
use crate::sync::error::SyncError;

const STAGE_CHUNK: usize = 500;

struct StagedRow {
    entity_type: EntityType,
    entity_id: String,
    parent_id: Option<String>,
    name: Option<String>,
    content_hash: String,
}

fn live_rows(snapshot: &DirectorySnapshot, entity_types: &[EntityType]) -> Vec<StagedRow> {
    let mut rows = Vec::new();
    for &entity_type in entity_types {
        match entity_type {
            EntityType::Organization => {
                rows.extend(snapshot.organizations.values().filter(|o| !o.deleted).map(|o| StagedRow {
                    entity_type,
                    entity_id: o.id.clone(),
                    parent_id: o.parent_id.clone(),
                    name: Some(o.name.clone()),
                    content_hash: o.content_hash(),
                }))
            }
            EntityType::User => rows.extend(snapshot.users.values().filter(|u| !u.deleted).map(|u| {
                StagedRow {
                    entity_type,
                    entity_id: u.id.clone(),
                    parent_id: None,
                    name: None,
                    content_hash: u.content_hash(),
                }
            })),
            EntityType::Membership => {
                rows.extend(snapshot.memberships.values().filter(|m| !m.deleted).map(|m| StagedRow {
                    entity_type,
                    entity_id: m.id.clone(),
                    parent_id: None,
                    name: None,
                    content_hash: m.content_hash(),
                }))
            }
        }
    }
    rows
}

async fn stage<C: ConnectionTrait>(
    conn: &C,
    session: &str,
    side: &str,
    rows: Vec<StagedRow>,
) -> Result<(), SyncError> {
    let models: Vec<diff_staging::ActiveModel> = rows
        .into_iter()
        .map(|row| diff_staging::ActiveModel {
            session_id: Set(session.to_string()),
            side: Set(side.to_string()),
            entity_type: Set(row.entity_type.as_str().to_string()),
            entity_id: Set(row.entity_id),
            parent_id: Set(row.parent_id),
            name: Set(row.name),
            content_hash: Set(row.content_hash),
            ..Default::default()
        })
        .collect();

    for chunk in models.chunks(STAGE_CHUNK) {
        diff_staging::Entity::insert_many(chunk.to_vec())
            .exec(conn)
            .await?;
    }
    Ok(())
}

fn placeholder(backend: DatabaseBackend) -> &'static str {
    match backend {
        DatabaseBackend::Postgres => "$1",
        _ => "?",
    }
}

fn null_safe_ne(backend: DatabaseBackend) -> &'static str {
    match backend {
        DatabaseBackend::Postgres => "IS DISTINCT FROM",
        _ => "IS NOT",
    }
}

fn one_sided_sql(backend: DatabaseBackend, present: &str, absent: &str) -> String {
    format!(
        "SELECT a.entity_type AS entity_type, a.entity_id AS entity_id \
         FROM diff_staging a \
         LEFT JOIN diff_staging b \
           ON b.session_id = a.session_id AND b.side = '{absent}' \
          AND b.entity_type = a.entity_type AND b.entity_id = a.entity_id \
         WHERE a.session_id = {p} AND a.side = '{present}' AND b.id IS NULL",
        p = placeholder(backend),
    )
}

fn changed_sql(backend: DatabaseBackend) -> String {
    let ne = null_safe_ne(backend);
    format!(
        "SELECT l.entity_type AS entity_type, l.entity_id AS entity_id, \
                l.parent_id AS local_parent, r.parent_id AS remote_parent, \
                l.name AS local_name, r.name AS remote_name, \
                l.content_hash AS local_hash, r.content_hash AS remote_hash \
         FROM diff_staging l \
         JOIN diff_staging r \
           ON r.session_id = l.session_id AND r.side = 'r' \
          AND r.entity_type = l.entity_type AND r.entity_id = l.entity_id \
         WHERE l.session_id = {p} AND l.side = 'l' \
           AND (l.parent_id {ne} r.parent_id OR l.name {ne} r.name OR l.content_hash <> r.content_hash)",
        p = placeholder(backend),
    )
}

fn entity_key(row: &QueryResult) -> Result<(EntityType, String), SyncError> {
    let entity_type: String = row.try_get("", "entity_type")?;
    let entity_id: String = row.try_get("", "entity_id")?;
    Ok((entity_type.parse()?, entity_id))
}

async fn compare<C: ConnectionTrait>(
    conn: &C,
    session: &str,
    entity_types: &[EntityType],
) -> Result<ClassifiedDiff, SyncError> {
    let backend = conn.get_database_backend();
    let mut types: BTreeMap<EntityType, TypeDiff> = entity_types
        .iter()
        .map(|t| (*t, TypeDiff::default()))
        .collect();

    let creates = conn
        .query_all(Statement::from_sql_and_values(
            backend,
            one_sided_sql(backend, "l", "r"),
            [session.into()],
        ))
        .await?;
    for row in &creates {
        let (entity_type, id) = entity_key(row)?;
        types.entry(entity_type).or_default().creates.insert(id);
    }

    let deletes = conn
        .query_all(Statement::from_sql_and_values(
            backend,
            one_sided_sql(backend, "r", "l"),
            [session.into()],
        ))
        .await?;
    for row in &deletes {
        let (entity_type, id) = entity_key(row)?;
        types.entry(entity_type).or_default().deletes.insert(id);
    }

    let changed = conn
        .query_all(Statement::from_sql_and_values(
            backend,
            changed_sql(backend),
            [session.into()],
        ))
        .await?;
    for row in &changed {
        let (entity_type, id) = entity_key(row)?;
        let local_parent: Option<String> = row.try_get("", "local_parent")?;
        let remote_parent: Option<String> = row.try_get("", "remote_parent")?;
        let local_name: Option<String> = row.try_get("", "local_name")?;
        let remote_name: Option<String> = row.try_get("", "remote_name")?;
        let local_hash: String = row.try_get("", "local_hash")?;
        let remote_hash: String = row.try_get("", "remote_hash")?;

        let diff = types.entry(entity_type).or_default();
        if entity_type == EntityType::Organization {
            if local_parent != remote_parent {
                diff.moves.insert(id.clone());
            }
            if local_name != remote_name {
                diff.renames.insert(id.clone());
            }
        }
        if local_hash != remote_hash {
            diff.updates.insert(id);
        }
    }

    Ok(ClassifiedDiff { types })
}

/// Same result as [`super::classify`], computed by the database.
pub async fn classify_with_join<C: ConnectionTrait>(
    conn: &C,
    local: &DirectorySnapshot,
    remote: &DirectorySnapshot,
    entity_types: &[EntityType],
) -> Result<ClassifiedDiff, SyncError> {
    let session = Uuid::new_v4().to_string();

    let outcome = async {
        stage(conn, &session, "l", live_rows(local, entity_types)).await?;
        stage(conn, &session, "r", live_rows(remote, entity_types)).await?;
        compare(conn, &session, entity_types).await
    }
    .await;

    match diff_staging::Entity::delete_many()
        .filter(diff_staging::Column::SessionId.eq(session.as_str()))
        .exec(conn)
        .await
    {
        Ok(res) => debug!(session = %session, rows = res.rows_affected, "diff staging cleared"),
        Err(err) => warn!(session = %session, error = %err, "failed to clear diff staging rows"),
    }

    outcome
}
