//! Source adapter contract.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::directory::{DirectoryRecord, DirectorySnapshot, EntityType, Scope};
use crate::sync::error::SyncError;

/// Opaque resume position handed back by a source.
///
/// The task manager persists it; adapters never keep it as internal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(pub Value);

impl SyncCursor {
    pub fn from_json(value: Value) -> Self {
        Self(value)
    }

    pub fn as_json(&self) -> &Value {
        &self.0
    }

    /// Cursor component for one entity type, for sources that page per type.
    pub fn part(&self, entity_type: EntityType) -> Option<&Value> {
        self.0.get(entity_type.as_str()).filter(|v| !v.is_null())
    }
}

/// Equality conditions on source fields, applied by the adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceFilter(pub BTreeMap<String, Value>);

impl SourceFilter {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every condition matches the given JSON object.
    pub fn matches(&self, object: &Value) -> bool {
        self.0
            .iter()
            .all(|(field, expected)| object.get(field) == Some(expected))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl ChangeType {
    pub const fn as_str(self) -> &'static str {
        match self {
            ChangeType::Created => "created",
            ChangeType::Updated => "updated",
            ChangeType::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "created" | "create" => Ok(ChangeType::Created),
            "updated" | "update" => Ok(ChangeType::Updated),
            "deleted" | "delete" => Ok(ChangeType::Deleted),
            other => Err(SyncError::source_schema(format!("unknown change type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedEntity {
    pub id: String,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Deltas for one entity type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityChanges {
    pub created: Vec<DirectoryRecord>,
    pub updated: Vec<DirectoryRecord>,
    pub deleted: Vec<DeletedEntity>,
}

impl EntityChanges {
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a change fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub changes: BTreeMap<EntityType, EntityChanges>,
    /// Position to resume from on the next fetch
    pub next_cursor: Option<SyncCursor>,
    /// Latest change timestamp observed, used as the next `since`
    pub high_watermark: Option<DateTime<Utc>>,
}

impl ChangeSet {
    pub fn entry(&mut self, entity_type: EntityType) -> &mut EntityChanges {
        self.changes.entry(entity_type).or_default()
    }

    pub fn len(&self) -> usize {
        self.changes.values().map(EntityChanges::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advances the high watermark to `at` if it is later.
    pub fn observe(&mut self, at: Option<DateTime<Utc>>) {
        if let Some(at) = at
            && self.high_watermark.is_none_or(|current| at > current)
        {
            self.high_watermark = Some(at);
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Source kind recorded on captured change records.
    fn kind(&self) -> &'static str;

    async fn init(&self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SyncError> {
        Ok(())
    }

    /// Complete snapshot of the requested entity types. Must not mutate the source.
    async fn fetch_full(
        &self,
        scope: &Scope,
        entity_types: &[EntityType],
        filter: &SourceFilter,
    ) -> Result<DirectorySnapshot, SyncError>;

    /// Deltas after `since` / `cursor`, both supplied by the caller.
    async fn fetch_changes(
        &self,
        scope: &Scope,
        entity_types: &[EntityType],
        since: Option<DateTime<Utc>>,
        cursor: Option<&SyncCursor>,
    ) -> Result<ChangeSet, SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn cursor_parts_by_entity_type() {
        let cursor = SyncCursor::from_json(json!({"user": "c-9", "organization": null}));
        assert_eq!(cursor.part(EntityType::User), Some(&json!("c-9")));
        assert_eq!(cursor.part(EntityType::Organization), None);
    }

    #[test]
    fn filter_matches_all_conditions() {
        let filter = SourceFilter(BTreeMap::from([("region".to_string(), json!("eu"))]));
        assert!(filter.matches(&json!({"region": "eu", "id": 1})));
        assert!(!filter.matches(&json!({"region": "us"})));
        assert!(SourceFilter::default().matches(&json!({})));
    }

    #[test]
    fn watermark_only_moves_forward() {
        let mut set = ChangeSet::default();
        let early = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        set.observe(Some(late));
        set.observe(Some(early));
        set.observe(None);
        assert_eq!(set.high_watermark, Some(late));
    }
}
