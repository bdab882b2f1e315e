//! Normalized directory entities shared by every adapter, the intermediate
//! store and the diff engine.

pub mod hierarchy;
pub mod validate;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::sync::error::SyncError;

pub use validate::validate_snapshot;

/// Tenant/project pair carried by every row and every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub tenant_id: Uuid,
    pub project_id: Uuid,
}

impl Scope {
    pub fn new(tenant_id: Uuid, project_id: Uuid) -> Self {
        Self {
            tenant_id,
            project_id,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tenant_id, self.project_id)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    #[serde(alias = "organizations", alias = "org")]
    Organization,
    #[serde(alias = "users")]
    User,
    #[serde(alias = "memberships")]
    Membership,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [
        EntityType::Organization,
        EntityType::User,
        EntityType::Membership,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            EntityType::Organization => "organization",
            EntityType::User => "user",
            EntityType::Membership => "membership",
        }
    }

    pub const fn plural(self) -> &'static str {
        match self {
            EntityType::Organization => "organizations",
            EntityType::User => "users",
            EntityType::Membership => "memberships",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "organization" | "organizations" | "org" => Ok(EntityType::Organization),
            "user" | "users" => Ok(EntityType::User),
            "membership" | "memberships" => Ok(EntityType::Membership),
            other => Err(SyncError::configuration(format!(
                "unknown entity type '{other}'"
            ))),
        }
    }
}

/// Sorts and de-duplicates requested entity types; an empty request means all.
pub fn normalize_entity_types(types: &[EntityType]) -> Vec<EntityType> {
    let mut out: Vec<EntityType> = if types.is_empty() {
        EntityType::ALL.to_vec()
    } else {
        types.to_vec()
    };
    out.sort();
    out.dedup();
    out
}

fn default_status() -> String {
    "active".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub extra: Map<String, Value>,
    #[serde(default)]
    pub source_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub mobile: Option<String>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub extra: Map<String, Value>,
    #[serde(default)]
    pub source_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub id: String,
    pub org_id: String,
    pub user_id: String,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub extra: Map<String, Value>,
    #[serde(default)]
    pub source_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Organization {
    pub fn new<I: Into<String>, N: Into<String>>(id: I, parent_id: Option<&str>, name: N) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.map(str::to_string),
            name: name.into(),
            code: None,
            sort_order: 0,
            status: default_status(),
            extra: Map::new(),
            source_updated_at: None,
            synced: false,
            deleted: false,
            deleted_at: None,
            last_synced_at: None,
        }
    }
}

impl User {
    pub fn new<I: Into<String>, U: Into<String>>(id: I, username: U) -> Self {
        let username = username.into();
        Self {
            id: id.into(),
            display_name: username.clone(),
            username,
            email: None,
            mobile: None,
            status: default_status(),
            extra: Map::new(),
            source_updated_at: None,
            synced: false,
            deleted: false,
            deleted_at: None,
            last_synced_at: None,
        }
    }
}

impl Membership {
    pub fn new<I: Into<String>>(id: I, org_id: &str, user_id: &str, is_primary: bool) -> Self {
        Self {
            id: id.into(),
            org_id: org_id.to_string(),
            user_id: user_id.to_string(),
            is_primary,
            position: None,
            extra: Map::new(),
            source_updated_at: None,
            synced: false,
            deleted: false,
            deleted_at: None,
            last_synced_at: None,
        }
    }
}

/// SHA-256 hex over the canonical (key-sorted) JSON encoding of `value`.
pub fn hash_value(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Sync bookkeeping common to all directory entities.
pub trait DirectoryEntity: Clone + Serialize + Send + Sync + 'static {
    const ENTITY_TYPE: EntityType;

    fn id(&self) -> &str;
    fn is_deleted(&self) -> bool;
    /// Hash of tracked fields; for organizations parent and name are compared separately.
    fn content_hash(&self) -> String;
    fn source_updated_at(&self) -> Option<DateTime<Utc>>;
    fn last_synced_at(&self) -> Option<DateTime<Utc>>;
    fn synced(&self) -> bool;
    fn set_sync_state(&mut self, synced: bool, last_synced_at: Option<DateTime<Utc>>);
    fn mark_deleted(&mut self, at: DateTime<Utc>);

    /// True when the tracked shape of both entities is identical.
    fn same_content(&self, other: &Self) -> bool {
        self.is_deleted() == other.is_deleted() && self.content_hash() == other.content_hash()
    }
}

impl DirectoryEntity for Organization {
    const ENTITY_TYPE: EntityType = EntityType::Organization;

    fn id(&self) -> &str {
        &self.id
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn content_hash(&self) -> String {
        hash_value(&serde_json::json!({
            "code": self.code,
            "sortOrder": self.sort_order,
            "status": self.status,
            "extra": self.extra,
        }))
    }

    fn source_updated_at(&self) -> Option<DateTime<Utc>> {
        self.source_updated_at
    }

    fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at
    }

    fn synced(&self) -> bool {
        self.synced
    }

    fn set_sync_state(&mut self, synced: bool, last_synced_at: Option<DateTime<Utc>>) {
        self.synced = synced;
        self.last_synced_at = last_synced_at;
    }

    fn mark_deleted(&mut self, at: DateTime<Utc>) {
        self.deleted = true;
        self.deleted_at = Some(at);
        self.synced = false;
    }

    fn same_content(&self, other: &Self) -> bool {
        self.deleted == other.deleted
            && self.parent_id == other.parent_id
            && self.name == other.name
            && self.content_hash() == other.content_hash()
    }
}

impl DirectoryEntity for User {
    const ENTITY_TYPE: EntityType = EntityType::User;

    fn id(&self) -> &str {
        &self.id
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn content_hash(&self) -> String {
        hash_value(&serde_json::json!({
            "username": self.username,
            "displayName": self.display_name,
            "email": self.email,
            "mobile": self.mobile,
            "status": self.status,
            "extra": self.extra,
        }))
    }

    fn source_updated_at(&self) -> Option<DateTime<Utc>> {
        self.source_updated_at
    }

    fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at
    }

    fn synced(&self) -> bool {
        self.synced
    }

    fn set_sync_state(&mut self, synced: bool, last_synced_at: Option<DateTime<Utc>>) {
        self.synced = synced;
        self.last_synced_at = last_synced_at;
    }

    fn mark_deleted(&mut self, at: DateTime<Utc>) {
        self.deleted = true;
        self.deleted_at = Some(at);
        self.synced = false;
    }
}

impl DirectoryEntity for Membership {
    const ENTITY_TYPE: EntityType = EntityType::Membership;

    fn id(&self) -> &str {
        &self.id
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn content_hash(&self) -> String {
        hash_value(&serde_json::json!({
            "orgId": self.org_id,
            "userId": self.user_id,
            "isPrimary": self.is_primary,
            "position": self.position,
            "extra": self.extra,
        }))
    }

    fn source_updated_at(&self) -> Option<DateTime<Utc>> {
        self.source_updated_at
    }

    fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at
    }

    fn synced(&self) -> bool {
        self.synced
    }

    fn set_sync_state(&mut self, synced: bool, last_synced_at: Option<DateTime<Utc>>) {
        self.synced = synced;
        self.last_synced_at = last_synced_at;
    }

    fn mark_deleted(&mut self, at: DateTime<Utc>) {
        self.deleted = true;
        self.deleted_at = Some(at);
        self.synced = false;
    }
}

/// A single entity of any type, as carried in operation payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryRecord {
    Organization(Organization),
    User(User),
    Membership(Membership),
}

impl DirectoryRecord {
    pub fn entity_type(&self) -> EntityType {
        match self {
            DirectoryRecord::Organization(_) => EntityType::Organization,
            DirectoryRecord::User(_) => EntityType::User,
            DirectoryRecord::Membership(_) => EntityType::Membership,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            DirectoryRecord::Organization(o) => &o.id,
            DirectoryRecord::User(u) => &u.id,
            DirectoryRecord::Membership(m) => &m.id,
        }
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            DirectoryRecord::Organization(o) => o.is_deleted(),
            DirectoryRecord::User(u) => u.is_deleted(),
            DirectoryRecord::Membership(m) => m.is_deleted(),
        }
    }

    pub fn source_updated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            DirectoryRecord::Organization(o) => o.source_updated_at(),
            DirectoryRecord::User(u) => u.source_updated_at(),
            DirectoryRecord::Membership(m) => m.source_updated_at(),
        }
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        match self {
            DirectoryRecord::Organization(o) => o.last_synced_at(),
            DirectoryRecord::User(u) => u.last_synced_at(),
            DirectoryRecord::Membership(m) => m.last_synced_at(),
        }
    }

    pub fn set_sync_state(&mut self, synced: bool, last_synced_at: Option<DateTime<Utc>>) {
        match self {
            DirectoryRecord::Organization(o) => o.set_sync_state(synced, last_synced_at),
            DirectoryRecord::User(u) => u.set_sync_state(synced, last_synced_at),
            DirectoryRecord::Membership(m) => m.set_sync_state(synced, last_synced_at),
        }
    }

    pub fn mark_deleted(&mut self, at: DateTime<Utc>) {
        match self {
            DirectoryRecord::Organization(o) => o.mark_deleted(at),
            DirectoryRecord::User(u) => u.mark_deleted(at),
            DirectoryRecord::Membership(m) => m.mark_deleted(at),
        }
    }

    pub fn to_value(&self) -> Value {
        let encoded = match self {
            DirectoryRecord::Organization(o) => serde_json::to_value(o),
            DirectoryRecord::User(u) => serde_json::to_value(u),
            DirectoryRecord::Membership(m) => serde_json::to_value(m),
        };
        encoded.unwrap_or(Value::Null)
    }

    pub fn from_value(entity_type: EntityType, value: Value) -> Result<Self, SyncError> {
        let decoded = match entity_type {
            EntityType::Organization => serde_json::from_value(value).map(DirectoryRecord::Organization),
            EntityType::User => serde_json::from_value(value).map(DirectoryRecord::User),
            EntityType::Membership => serde_json::from_value(value).map(DirectoryRecord::Membership),
        };
        decoded.map_err(|err| {
            SyncError::source_schema(format!("invalid {entity_type} payload: {err}"))
        })
    }
}

/// Key into per-entity metadata maps.
pub type EntityKey = (EntityType, String);

/// Complete (or partial, per requested types) view of a directory, keyed by stable id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySnapshot {
    #[serde(default)]
    pub organizations: BTreeMap<String, Organization>,
    #[serde(default)]
    pub users: BTreeMap<String, User>,
    #[serde(default)]
    pub memberships: BTreeMap<String, Membership>,
}

impl DirectorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(
        organizations: Vec<Organization>,
        users: Vec<User>,
        memberships: Vec<Membership>,
    ) -> Self {
        Self {
            organizations: organizations.into_iter().map(|o| (o.id.clone(), o)).collect(),
            users: users.into_iter().map(|u| (u.id.clone(), u)).collect(),
            memberships: memberships.into_iter().map(|m| (m.id.clone(), m)).collect(),
        }
    }

    pub fn insert(&mut self, record: DirectoryRecord) {
        match record {
            DirectoryRecord::Organization(o) => {
                self.organizations.insert(o.id.clone(), o);
            }
            DirectoryRecord::User(u) => {
                self.users.insert(u.id.clone(), u);
            }
            DirectoryRecord::Membership(m) => {
                self.memberships.insert(m.id.clone(), m);
            }
        }
    }

    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<DirectoryRecord> {
        match entity_type {
            EntityType::Organization => self
                .organizations
                .get(id)
                .cloned()
                .map(DirectoryRecord::Organization),
            EntityType::User => self.users.get(id).cloned().map(DirectoryRecord::User),
            EntityType::Membership => self
                .memberships
                .get(id)
                .cloned()
                .map(DirectoryRecord::Membership),
        }
    }

    pub fn remove(&mut self, entity_type: EntityType, id: &str) {
        match entity_type {
            EntityType::Organization => {
                self.organizations.remove(id);
            }
            EntityType::User => {
                self.users.remove(id);
            }
            EntityType::Membership => {
                self.memberships.remove(id);
            }
        }
    }

    /// Entity count for one type, including soft-deleted rows.
    pub fn count(&self, entity_type: EntityType) -> usize {
        match entity_type {
            EntityType::Organization => self.organizations.len(),
            EntityType::User => self.users.len(),
            EntityType::Membership => self.memberships.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.organizations.len() + self.users.len() + self.memberships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entity type not listed in `types`.
    pub fn retain_types(&mut self, types: &[EntityType]) {
        if !types.contains(&EntityType::Organization) {
            self.organizations.clear();
        }
        if !types.contains(&EntityType::User) {
            self.users.clear();
        }
        if !types.contains(&EntityType::Membership) {
            self.memberships.clear();
        }
    }

    /// Copy of `self` whose types outside `types` are taken from `stored`.
    pub fn with_context(&self, stored: &DirectorySnapshot, types: &[EntityType]) -> DirectorySnapshot {
        let mut view = self.clone();
        if !types.contains(&EntityType::Organization) {
            view.organizations = stored.organizations.clone();
        }
        if !types.contains(&EntityType::User) {
            view.users = stored.users.clone();
        }
        if !types.contains(&EntityType::Membership) {
            view.memberships = stored.memberships.clone();
        }
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_type_accepts_plural_forms() {
        assert_eq!("organizations".parse::<EntityType>().unwrap(), EntityType::Organization);
        assert_eq!("User".parse::<EntityType>().unwrap(), EntityType::User);
        assert!("groups".parse::<EntityType>().is_err());

        let parsed: Vec<EntityType> = serde_json::from_value(json!(["users", "membership"])).unwrap();
        assert_eq!(parsed, vec![EntityType::User, EntityType::Membership]);
    }

    #[test]
    fn normalize_defaults_to_all() {
        assert_eq!(normalize_entity_types(&[]), EntityType::ALL.to_vec());
        assert_eq!(
            normalize_entity_types(&[EntityType::Membership, EntityType::User, EntityType::User]),
            vec![EntityType::User, EntityType::Membership]
        );
    }

    #[test]
    fn org_hash_ignores_parent_and_name() {
        let a = Organization::new("A", None, "Alpha");
        let mut moved = a.clone();
        moved.parent_id = Some("R".to_string());
        moved.name = "Renamed".to_string();
        assert_eq!(a.content_hash(), moved.content_hash());
        assert!(!a.same_content(&moved));

        let mut recoded = a.clone();
        recoded.code = Some("X1".to_string());
        assert_ne!(a.content_hash(), recoded.content_hash());
    }

    #[test]
    fn hash_ignores_sync_bookkeeping() {
        let mut u = User::new("u1", "alice");
        let before = u.content_hash();
        u.set_sync_state(true, Some(Utc::now()));
        u.source_updated_at = Some(Utc::now());
        assert_eq!(before, u.content_hash());
    }

    #[test]
    fn record_round_trips_through_json() {
        let record = DirectoryRecord::Membership(Membership::new("m1", "A", "u1", true));
        let value = record.to_value();
        assert_eq!(value["orgId"], json!("A"));
        let back = DirectoryRecord::from_value(EntityType::Membership, value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn retain_types_clears_unrequested() {
        let mut snapshot = DirectorySnapshot::from_parts(
            vec![Organization::new("A", None, "A")],
            vec![User::new("u1", "alice")],
            vec![],
        );
        snapshot.retain_types(&[EntityType::User]);
        assert!(snapshot.organizations.is_empty());
        assert_eq!(snapshot.users.len(), 1);
    }

    #[test]
    fn context_fills_only_unrequested_types() {
        let stored = DirectorySnapshot::from_parts(
            vec![Organization::new("A", None, "A")],
            vec![User::new("u1", "alice")],
            vec![Membership::new("m0", "A", "u1", false)],
        );
        let fetched =
            DirectorySnapshot::from_parts(vec![], vec![], vec![Membership::new("m1", "A", "u1", true)]);

        let view = fetched.with_context(&stored, &[EntityType::Membership]);
        assert!(view.organizations.contains_key("A"));
        assert!(view.users.contains_key("u1"));
        assert_eq!(view.memberships.keys().collect::<Vec<_>>(), vec!["m1"]);
    }
}
