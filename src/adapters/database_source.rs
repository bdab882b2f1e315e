//! Database-backed source: reads organizations, users and memberships from
//! relational tables through the configured field mapping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseConnection, FromQueryResult, JsonValue, Statement,
    Value as DbValue,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::source::{ChangeSet, DeletedEntity, SourceAdapter, SourceFilter, SyncCursor};
use crate::directory::{DirectoryRecord, DirectorySnapshot, EntityType, Scope};
use crate::normalization::{FieldMapper, FieldMapping, parse_timestamp};
use crate::sync::error::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityTables {
    #[serde(default = "default_org_table")]
    pub organization: String,
    #[serde(default = "default_user_table")]
    pub user: String,
    #[serde(default = "default_membership_table")]
    pub membership: String,
}

impl Default for EntityTables {
    fn default() -> Self {
        Self {
            organization: default_org_table(),
            user: default_user_table(),
            membership: default_membership_table(),
        }
    }
}

impl EntityTables {
    fn for_type(&self, entity_type: EntityType) -> &str {
        match entity_type {
            EntityType::Organization => &self.organization,
            EntityType::User => &self.user,
            EntityType::Membership => &self.membership,
        }
    }
}

fn default_org_table() -> String {
    "source_organizations".to_string()
}

fn default_user_table() -> String {
    "source_users".to_string()
}

fn default_membership_table() -> String {
    "source_memberships".to_string()
}

fn default_updated_at_column() -> String {
    "updated_at".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSourceConfig {
    /// Separate connection URL; the service database is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub tables: EntityTables,
    #[serde(default)]
    pub field_mapping: FieldMapping,
    /// Change-tracking column compared against `since`
    #[serde(default = "default_updated_at_column")]
    pub updated_at_column: String,
    /// Distinguishes created from updated rows when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at_column: Option<String>,
}

pub struct DatabaseSource {
    conn: DatabaseConnection,
    config: DatabaseSourceConfig,
    mapper: FieldMapper,
}

fn identifier_pattern() -> Result<Regex, SyncError> {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .map_err(|err| SyncError::configuration(format!("identifier pattern: {err}")))
}

fn quote_identifier(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join(".")
}

fn to_db_value(field: &str, value: &Value) -> Result<DbValue, SyncError> {
    match value {
        Value::String(s) => Ok(s.clone().into()),
        Value::Bool(b) => Ok((*b).into()),
        Value::Number(n) => n
            .as_i64()
            .map(DbValue::from)
            .or_else(|| n.as_f64().map(DbValue::from))
            .ok_or_else(|| SyncError::configuration(format!("filter '{field}' is not a number"))),
        other => Err(SyncError::configuration(format!(
            "filter '{field}' must be a scalar, got {other}"
        ))),
    }
}

impl DatabaseSource {
    pub fn new(conn: DatabaseConnection, config: DatabaseSourceConfig) -> Result<Self, SyncError> {
        config.field_mapping.validate()?;

        let pattern = identifier_pattern()?;
        let mut identifiers = vec![
            config.tables.organization.as_str(),
            config.tables.user.as_str(),
            config.tables.membership.as_str(),
            config.updated_at_column.as_str(),
        ];
        if let Some(created) = config.created_at_column.as_deref() {
            identifiers.push(created);
        }
        identifiers.extend(
            config
                .field_mapping
                .organization
                .values()
                .chain(config.field_mapping.user.values())
                .chain(config.field_mapping.membership.values())
                .map(String::as_str),
        );
        if let Some(bad) = identifiers.iter().find(|ident| !pattern.is_match(ident)) {
            return Err(SyncError::configuration(format!(
                "'{bad}' is not a valid SQL identifier"
            )));
        }

        let mut mapping = config.field_mapping.clone();
        for table in [
            &mut mapping.organization,
            &mut mapping.user,
            &mut mapping.membership,
        ] {
            table
                .entry("updatedAt".to_string())
                .or_insert_with(|| config.updated_at_column.clone());
        }

        Ok(Self {
            conn,
            config,
            mapper: FieldMapper::new(mapping),
        })
    }

    fn placeholder(backend: DatabaseBackend, n: usize) -> String {
        match backend {
            DatabaseBackend::Postgres => format!("${n}"),
            _ => "?".to_string(),
        }
    }

    fn select(
        &self,
        entity_type: EntityType,
        filter: &SourceFilter,
        since: Option<DateTime<Utc>>,
    ) -> Result<Statement, SyncError> {
        let backend = self.conn.get_database_backend();
        let pattern = identifier_pattern()?;
        let mut conditions = Vec::new();
        let mut values: Vec<DbValue> = Vec::new();

        for (field, expected) in &filter.0 {
            if !pattern.is_match(field) {
                return Err(SyncError::configuration(format!(
                    "'{field}' is not a valid SQL identifier"
                )));
            }
            values.push(to_db_value(field, expected)?);
            conditions.push(format!(
                "{} = {}",
                quote_identifier(field),
                Self::placeholder(backend, values.len())
            ));
        }

        if let Some(since) = since {
            values.push(since.into());
            conditions.push(format!(
                "{} > {}",
                quote_identifier(&self.config.updated_at_column),
                Self::placeholder(backend, values.len())
            ));
        }

        let mut sql = format!(
            "SELECT * FROM {}",
            quote_identifier(self.config.tables.for_type(entity_type))
        );
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(&format!(
            " ORDER BY {}",
            quote_identifier(self.mapper.id_field(entity_type))
        ));

        Ok(Statement::from_sql_and_values(backend, sql, values))
    }

    async fn rows(&self, stmt: Statement, entity_type: EntityType) -> Result<Vec<JsonValue>, SyncError> {
        debug!(entity_type = %entity_type, sql = %stmt.sql, "querying source table");
        JsonValue::find_by_statement(stmt)
            .all(&self.conn)
            .await
            .map_err(|err| match err {
                sea_orm::DbErr::Conn(_) | sea_orm::DbErr::ConnectionAcquire(_) => {
                    SyncError::source_unavailable(format!("source database unreachable: {err}"))
                }
                other => SyncError::source_schema(format!(
                    "source query for {entity_type} failed: {other}"
                )),
            })
    }

    fn row_timestamp(&self, row: &JsonValue, column: &str) -> Option<DateTime<Utc>> {
        row.get(column).and_then(parse_timestamp)
    }
}

#[async_trait]
impl SourceAdapter for DatabaseSource {
    fn kind(&self) -> &'static str {
        "database"
    }

    async fn init(&self) -> Result<(), SyncError> {
        self.conn
            .execute(Statement::from_string(
                self.conn.get_database_backend(),
                "SELECT 1".to_string(),
            ))
            .await
            .map(|_| ())
            .map_err(|err| SyncError::source_unavailable(format!("source database unreachable: {err}")))
    }

    #[instrument(skip(self, filter), fields(source = "database"))]
    async fn fetch_full(
        &self,
        _scope: &Scope,
        entity_types: &[EntityType],
        filter: &SourceFilter,
    ) -> Result<DirectorySnapshot, SyncError> {
        let mut snapshot = DirectorySnapshot::new();
        for &entity_type in entity_types {
            let stmt = self.select(entity_type, filter, None)?;
            for row in self.rows(stmt, entity_type).await? {
                snapshot.insert(self.mapper.map_record(entity_type, &row)?);
            }
        }
        Ok(snapshot)
    }

    #[instrument(skip(self, cursor), fields(source = "database"))]
    async fn fetch_changes(
        &self,
        _scope: &Scope,
        entity_types: &[EntityType],
        since: Option<DateTime<Utc>>,
        cursor: Option<&SyncCursor>,
    ) -> Result<ChangeSet, SyncError> {
        // A stored watermark wins over the caller's coarser `since`.
        let since = cursor
            .and_then(|c| c.as_json().get("highWatermark"))
            .and_then(parse_timestamp)
            .or(since);

        let mut set = ChangeSet {
            high_watermark: since,
            ..ChangeSet::default()
        };

        for &entity_type in entity_types {
            let stmt = self.select(entity_type, &SourceFilter::default(), since)?;
            for row in self.rows(stmt, entity_type).await? {
                let record = self.mapper.map_record(entity_type, &row)?;
                let updated_at = self.row_timestamp(&row, self.mapper.source_field(entity_type, "updatedAt"));
                set.observe(updated_at);

                let created = match (&self.config.created_at_column, since) {
                    (Some(column), Some(since)) => self
                        .row_timestamp(&row, column)
                        .is_some_and(|created_at| created_at > since),
                    (_, None) => true,
                    (None, Some(_)) => false,
                };

                let deleted = match &record {
                    DirectoryRecord::Organization(o) => o.deleted,
                    DirectoryRecord::User(u) => u.deleted,
                    DirectoryRecord::Membership(m) => m.deleted,
                };

                let entry = set.entry(entity_type);
                if deleted {
                    entry.deleted.push(DeletedEntity {
                        id: record.id().to_string(),
                        deleted_at: updated_at,
                    });
                } else if created {
                    entry.created.push(record);
                } else {
                    entry.updated.push(record);
                }
            }
        }

        set.next_cursor = set
            .high_watermark
            .map(|at| SyncCursor::from_json(json!({ "highWatermark": at.to_rfc3339() })));
        Ok(set)
    }
}
