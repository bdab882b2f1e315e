//! Field mapping from raw source rows into normalized directory entities.
//!
//! Each entity type has a `canonical field -> source field` mapping. Fields the
//! mapping does not mention default to their canonical camelCase name; source
//! fields that are not consumed end up in the entity's `extra` map.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use crate::directory::{DirectoryRecord, EntityType, Membership, Organization, User};
use crate::sync::error::SyncError;

const ORGANIZATION_FIELDS: &[&str] = &[
    "id",
    "parentId",
    "name",
    "code",
    "sortOrder",
    "status",
    "updatedAt",
    "deleted",
];

const USER_FIELDS: &[&str] = &[
    "id",
    "username",
    "displayName",
    "email",
    "mobile",
    "status",
    "updatedAt",
    "deleted",
];

const MEMBERSHIP_FIELDS: &[&str] = &[
    "id",
    "orgId",
    "userId",
    "isPrimary",
    "position",
    "updatedAt",
    "deleted",
];

/// Per entity type `canonical -> source` field names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    #[serde(default)]
    pub organization: BTreeMap<String, String>,
    #[serde(default)]
    pub user: BTreeMap<String, String>,
    #[serde(default)]
    pub membership: BTreeMap<String, String>,
}

impl FieldMapping {
    fn for_type(&self, entity_type: EntityType) -> &BTreeMap<String, String> {
        match entity_type {
            EntityType::Organization => &self.organization,
            EntityType::User => &self.user,
            EntityType::Membership => &self.membership,
        }
    }

    /// Rejects mappings naming canonical fields that do not exist.
    pub fn validate(&self) -> Result<(), SyncError> {
        for entity_type in EntityType::ALL {
            let known = canonical_fields(entity_type);
            for canonical in self.for_type(entity_type).keys() {
                if !known.contains(&canonical.as_str()) {
                    return Err(SyncError::configuration(format!(
                        "field mapping for {entity_type} names unknown field '{canonical}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn canonical_fields(entity_type: EntityType) -> &'static [&'static str] {
    match entity_type {
        EntityType::Organization => ORGANIZATION_FIELDS,
        EntityType::User => USER_FIELDS,
        EntityType::Membership => MEMBERSHIP_FIELDS,
    }
}

/// Applies a [`FieldMapping`] to raw JSON rows.
#[derive(Debug, Clone, Default)]
pub struct FieldMapper {
    mapping: FieldMapping,
}

struct Row<'a> {
    entity_type: EntityType,
    object: &'a Map<String, Value>,
    mapping: &'a BTreeMap<String, String>,
    consumed: BTreeSet<&'a str>,
}

impl<'a> Row<'a> {
    fn source_name(&self, canonical: &'a str) -> &'a str {
        self.mapping
            .get(canonical)
            .map(String::as_str)
            .unwrap_or(canonical)
    }

    fn raw(&mut self, canonical: &'a str) -> Option<&'a Value> {
        let name = self.source_name(canonical);
        self.consumed.insert(name);
        self.object.get(name).filter(|v| !v.is_null())
    }

    fn string(&mut self, canonical: &'a str) -> Result<Option<String>, SyncError> {
        match self.raw(canonical) {
            None => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(other) => Err(self.type_error(canonical, "a string", other)),
        }
    }

    fn required_string(&mut self, canonical: &'a str) -> Result<String, SyncError> {
        self.string(canonical)?.ok_or_else(|| {
            SyncError::source_schema(format!(
                "{} row is missing required field '{}'",
                self.entity_type,
                self.source_name(canonical)
            ))
        })
    }

    fn bool(&mut self, canonical: &'a str) -> Result<Option<bool>, SyncError> {
        match self.raw(canonical) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::Number(n)) => Ok(Some(n.as_i64().unwrap_or(0) != 0)),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "y" => Ok(Some(true)),
                "0" | "false" | "no" | "n" | "" => Ok(Some(false)),
                _ => Err(self.type_error(canonical, "a boolean", &Value::String(s.clone()))),
            },
            Some(other) => Err(self.type_error(canonical, "a boolean", other)),
        }
    }

    fn int(&mut self, canonical: &'a str) -> Result<Option<i32>, SyncError> {
        match self.raw(canonical) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(Some)
                .ok_or_else(|| self.type_error(canonical, "an integer", &Value::Number(n.clone()))),
            Some(Value::String(s)) => s
                .trim()
                .parse::<i32>()
                .map(Some)
                .map_err(|_| self.type_error(canonical, "an integer", &Value::String(s.clone()))),
            Some(other) => Err(self.type_error(canonical, "an integer", other)),
        }
    }

    fn timestamp(&mut self, canonical: &'a str) -> Result<Option<DateTime<Utc>>, SyncError> {
        match self.raw(canonical) {
            None => Ok(None),
            Some(value) => parse_timestamp(value)
                .map(Some)
                .ok_or_else(|| self.type_error(canonical, "a timestamp", value)),
        }
    }

    fn type_error(&self, canonical: &str, expected: &str, got: &Value) -> SyncError {
        SyncError::source_schema(format!(
            "{} field '{}' must be {expected}, got {got}",
            self.entity_type,
            self.mapping
                .get(canonical)
                .map(String::as_str)
                .unwrap_or(canonical)
        ))
    }

    fn extra(&self) -> Map<String, Value> {
        self.object
            .iter()
            .filter(|(key, _)| !self.consumed.contains(key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[+zz:zz]` (UTC when no offset), unix
/// seconds or unix milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                return Some(parsed.with_timezone(&Utc));
            }
            if let Ok(parsed) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z") {
                return Some(parsed.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            s.parse::<i64>().ok().and_then(from_epoch)
        }
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    // Values beyond year 5138 in seconds are taken as milliseconds.
    if raw.abs() >= 100_000_000_000 {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}

impl FieldMapper {
    pub fn new(mapping: FieldMapping) -> Self {
        Self { mapping }
    }

    fn row<'a>(&'a self, entity_type: EntityType, raw: &'a Value) -> Result<Row<'a>, SyncError> {
        let object = raw.as_object().ok_or_else(|| {
            SyncError::source_schema(format!("{entity_type} row must be a JSON object, got {raw}"))
        })?;
        Ok(Row {
            entity_type,
            object,
            mapping: self.mapping.for_type(entity_type),
            consumed: BTreeSet::new(),
        })
    }

    pub fn map_organization(&self, raw: &Value) -> Result<Organization, SyncError> {
        let mut row = self.row(EntityType::Organization, raw)?;
        let id = row.required_string("id")?;
        let deleted = row.bool("deleted")?.unwrap_or(false);
        let source_updated_at = row.timestamp("updatedAt")?;
        let mut org = Organization::new(id, None, row.required_string("name")?);
        org.parent_id = row.string("parentId")?;
        org.code = row.string("code")?;
        org.sort_order = row.int("sortOrder")?.unwrap_or(0);
        if let Some(status) = row.string("status")? {
            org.status = status;
        }
        org.source_updated_at = source_updated_at;
        if deleted {
            org.deleted = true;
            org.deleted_at = source_updated_at.or_else(|| Some(Utc::now()));
        }
        org.extra = row.extra();
        Ok(org)
    }

    pub fn map_user(&self, raw: &Value) -> Result<User, SyncError> {
        let mut row = self.row(EntityType::User, raw)?;
        let id = row.required_string("id")?;
        let deleted = row.bool("deleted")?.unwrap_or(false);
        let source_updated_at = row.timestamp("updatedAt")?;
        let mut user = User::new(id, row.required_string("username")?);
        if let Some(display_name) = row.string("displayName")? {
            user.display_name = display_name;
        }
        user.email = row.string("email")?;
        user.mobile = row.string("mobile")?;
        if let Some(status) = row.string("status")? {
            user.status = status;
        }
        user.source_updated_at = source_updated_at;
        if deleted {
            user.deleted = true;
            user.deleted_at = source_updated_at.or_else(|| Some(Utc::now()));
        }
        user.extra = row.extra();
        Ok(user)
    }

    pub fn map_membership(&self, raw: &Value) -> Result<Membership, SyncError> {
        let mut row = self.row(EntityType::Membership, raw)?;
        let id = row.required_string("id")?;
        let deleted = row.bool("deleted")?.unwrap_or(false);
        let source_updated_at = row.timestamp("updatedAt")?;
        let org_id = row.required_string("orgId")?;
        let user_id = row.required_string("userId")?;
        let is_primary = row.bool("isPrimary")?.unwrap_or(false);
        let mut membership = Membership::new(id, &org_id, &user_id, is_primary);
        membership.position = row.string("position")?;
        membership.source_updated_at = source_updated_at;
        if deleted {
            membership.deleted = true;
            membership.deleted_at = source_updated_at.or_else(|| Some(Utc::now()));
        }
        membership.extra = row.extra();
        Ok(membership)
    }

    pub fn map_record(&self, entity_type: EntityType, raw: &Value) -> Result<DirectoryRecord, SyncError> {
        match entity_type {
            EntityType::Organization => self.map_organization(raw).map(DirectoryRecord::Organization),
            EntityType::User => self.map_user(raw).map(DirectoryRecord::User),
            EntityType::Membership => self.map_membership(raw).map(DirectoryRecord::Membership),
        }
    }

    /// Source-side name of the id field for `entity_type`.
    pub fn id_field(&self, entity_type: EntityType) -> &str {
        self.source_field(entity_type, "id")
    }

    /// Source-side name of any canonical field.
    pub fn source_field<'a>(&'a self, entity_type: EntityType, canonical: &'a str) -> &'a str {
        self.mapping
            .for_type(entity_type)
            .get(canonical)
            .map(String::as_str)
            .unwrap_or(canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::error::SyncErrorKind;
    use serde_json::json;

    fn mapper() -> FieldMapper {
        let mut mapping = FieldMapping::default();
        mapping.organization.insert("id".into(), "dept_id".into());
        mapping.organization.insert("parentId".into(), "parent_dept".into());
        mapping.organization.insert("name".into(), "dept_name".into());
        mapping.user.insert("id".into(), "emp_no".into());
        mapping.user.insert("username".into(), "login".into());
        FieldMapper::new(mapping)
    }

    #[test]
    fn maps_renamed_fields_and_keeps_extras() {
        let org = mapper()
            .map_organization(&json!({
                "dept_id": 42,
                "parent_dept": "",
                "dept_name": "Engineering",
                "sortOrder": "3",
                "cost_center": "CC-9"
            }))
            .unwrap();

        assert_eq!(org.id, "42");
        assert_eq!(org.parent_id, None);
        assert_eq!(org.name, "Engineering");
        assert_eq!(org.sort_order, 3);
        assert_eq!(org.status, "active");
        assert_eq!(org.extra.get("cost_center"), Some(&json!("CC-9")));
        assert!(!org.extra.contains_key("dept_id"));
    }

    #[test]
    fn user_defaults_display_name_and_parses_flags() {
        let user = mapper()
            .map_user(&json!({
                "emp_no": "E1",
                "login": "alice",
                "deleted": "1",
                "updatedAt": "2025-03-01 08:30:00"
            }))
            .unwrap();

        assert_eq!(user.display_name, "alice");
        assert!(user.deleted);
        assert_eq!(
            user.source_updated_at.unwrap().to_rfc3339(),
            "2025-03-01T08:30:00+00:00"
        );
    }

    #[test]
    fn missing_id_is_schema_error() {
        let err = mapper().map_user(&json!({"login": "bob"})).unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::SourceSchemaError);
        assert!(err.message.contains("emp_no"));
    }

    #[test]
    fn wrong_type_is_schema_error() {
        let err = FieldMapper::default()
            .map_membership(&json!({"id": "m1", "orgId": "A", "userId": "u1", "isPrimary": "maybe"}))
            .unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::SourceSchemaError);
    }

    #[test]
    fn timestamps_accept_epoch_and_rfc3339() {
        let secs = parse_timestamp(&json!(1_700_000_000)).unwrap();
        let millis = parse_timestamp(&json!(1_700_000_000_000i64)).unwrap();
        assert_eq!(secs, millis);
        assert!(parse_timestamp(&json!("2025-01-02T03:04:05Z")).is_some());
        assert!(parse_timestamp(&json!("yesterday")).is_none());
    }

    #[test]
    fn unknown_canonical_field_rejected() {
        let mut mapping = FieldMapping::default();
        mapping.user.insert("nickname".into(), "nick".into());
        assert!(mapping.validate().is_err());
    }
}
