//! Database source against hand-built source tables.

#[path = "test_utils/mod.rs"]
mod test_utils;

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use dirsync::adapters::database_source::{DatabaseSource, DatabaseSourceConfig};
use dirsync::adapters::{SourceAdapter, SourceFilter, SyncErrorKind};
use dirsync::directory::EntityType;
use dirsync::normalization::FieldMapping;
use sea_orm::{ConnectionTrait, DatabaseConnection, Statement};
use serde_json::json;
use test_utils::{setup_test_db, test_scope};

const SCHEMA: &[&str] = &[
    "CREATE TABLE source_organizations (id TEXT PRIMARY KEY, name TEXT NOT NULL, parent_id TEXT, region TEXT, updated_at TEXT, deleted INTEGER NOT NULL DEFAULT 0)",
    "CREATE TABLE source_users (id TEXT PRIMARY KEY, username TEXT NOT NULL, display_name TEXT, email TEXT, updated_at TEXT, deleted INTEGER NOT NULL DEFAULT 0)",
    "CREATE TABLE source_memberships (id TEXT PRIMARY KEY, org_id TEXT NOT NULL, user_id TEXT NOT NULL, is_primary INTEGER NOT NULL DEFAULT 0, updated_at TEXT, deleted INTEGER NOT NULL DEFAULT 0)",
    "INSERT INTO source_organizations VALUES ('root', 'Acme', NULL, 'emea', '2024-05-01T08:00:00+00:00', 0)",
    "INSERT INTO source_organizations VALUES ('eng', 'Engineering', 'root', 'emea', '2024-05-03T08:00:00+00:00', 0)",
    "INSERT INTO source_organizations VALUES ('apac', 'APAC', 'root', 'apac', '2024-05-01T08:00:00+00:00', 0)",
    "INSERT INTO source_users VALUES ('u1', 'ada', 'Ada Lovelace', 'ada@example.com', '2024-05-01T08:00:00+00:00', 0)",
    "INSERT INTO source_users VALUES ('u2', 'grace', 'Grace Hopper', NULL, '2024-05-04T08:00:00+00:00', 1)",
    "INSERT INTO source_memberships VALUES ('m1', 'eng', 'u1', 1, '2024-05-01T08:00:00+00:00', 0)",
];

async fn seeded_db() -> Result<DatabaseConnection> {
    let db = setup_test_db().await?;
    for sql in SCHEMA {
        db.execute(Statement::from_string(db.get_database_backend(), sql.to_string()))
            .await?;
    }
    Ok(db)
}

fn mapping() -> FieldMapping {
    FieldMapping {
        organization: BTreeMap::from([("parentId".to_string(), "parent_id".to_string())]),
        user: BTreeMap::from([("displayName".to_string(), "display_name".to_string())]),
        membership: BTreeMap::from([
            ("orgId".to_string(), "org_id".to_string()),
            ("userId".to_string(), "user_id".to_string()),
            ("isPrimary".to_string(), "is_primary".to_string()),
        ]),
    }
}

fn source(db: &DatabaseConnection) -> DatabaseSource {
    DatabaseSource::new(
        db.clone(),
        DatabaseSourceConfig {
            field_mapping: mapping(),
            ..DatabaseSourceConfig::default()
        },
    )
    .expect("valid source config")
}

#[tokio::test]
async fn full_fetch_maps_rows_through_field_mapping() -> Result<()> {
    let db = seeded_db().await?;
    let snapshot = source(&db)
        .fetch_full(&test_scope(), &EntityType::ALL, &SourceFilter::default())
        .await?;

    assert_eq!(snapshot.organizations.len(), 3);
    let eng = &snapshot.organizations["eng"];
    assert_eq!(eng.parent_id.as_deref(), Some("root"));
    assert_eq!(eng.extra.get("region"), Some(&json!("emea")));
    assert_eq!(
        eng.source_updated_at,
        Some(Utc.with_ymd_and_hms(2024, 5, 3, 8, 0, 0).unwrap())
    );

    assert_eq!(snapshot.users["u1"].display_name, "Ada Lovelace");
    assert!(snapshot.users["u2"].deleted);
    let membership = &snapshot.memberships["m1"];
    assert!(membership.is_primary);
    assert_eq!(membership.org_id, "eng");
    Ok(())
}

#[tokio::test]
async fn full_fetch_applies_equality_filter() -> Result<()> {
    let db = seeded_db().await?;
    let filter: SourceFilter = serde_json::from_value(json!({"region": "apac"}))?;

    let snapshot = source(&db)
        .fetch_full(&test_scope(), &[EntityType::Organization], &filter)
        .await?;

    assert_eq!(snapshot.organizations.keys().collect::<Vec<_>>(), vec!["apac"]);
    Ok(())
}

#[tokio::test]
async fn changes_since_watermark_split_updates_and_deletes() -> Result<()> {
    let db = seeded_db().await?;
    let since = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();

    let set = source(&db)
        .fetch_changes(&test_scope(), &[EntityType::Organization, EntityType::User], Some(since), None)
        .await?;

    let orgs = &set.changes[&EntityType::Organization];
    assert!(orgs.created.is_empty());
    assert_eq!(orgs.updated.len(), 1);
    assert_eq!(orgs.updated[0].id(), "eng");

    let users = &set.changes[&EntityType::User];
    assert_eq!(users.deleted.len(), 1);
    assert_eq!(users.deleted[0].id, "u2");
    assert_eq!(
        set.high_watermark,
        Some(Utc.with_ymd_and_hms(2024, 5, 4, 8, 0, 0).unwrap())
    );
    Ok(())
}

#[tokio::test]
async fn missing_table_is_a_schema_error() -> Result<()> {
    let db = setup_test_db().await?;
    let err = source(&db)
        .fetch_full(&test_scope(), &[EntityType::User], &SourceFilter::default())
        .await
        .expect_err("table does not exist");

    assert_eq!(err.kind, SyncErrorKind::SourceSchemaError);
    Ok(())
}

#[test]
fn unsafe_identifiers_are_rejected() {
    let mut config = DatabaseSourceConfig::default();
    config.tables.user = "users; DROP TABLE x".to_string();

    let db = DatabaseConnection::Disconnected;
    let err = DatabaseSource::new(db, config).err().expect("identifier must be rejected");
    assert_eq!(err.kind, SyncErrorKind::Configuration);
}
