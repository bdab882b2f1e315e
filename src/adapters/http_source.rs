//! HTTP-API-backed source.
//!
//! Full fetches page through `GET {base}/{path}?limit=&cursor=` returning
//! `{items, nextCursor}`. Change fetches call `GET {base}/{path}/changes?since=&cursor=`
//! returning `{created, updated, deleted, nextCursor}`; the composite cursor
//! keeps one position per entity type.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use super::source::{ChangeSet, DeletedEntity, SourceAdapter, SourceFilter, SyncCursor};
use crate::directory::{DirectorySnapshot, EntityType, Scope};
use crate::normalization::{FieldMapper, FieldMapping, parse_timestamp};
use crate::sync::error::SyncError;

const MAX_PAGES: usize = 10_000;

/// Resource paths per entity type, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPaths {
    #[serde(default = "default_org_path")]
    pub organization: String,
    #[serde(default = "default_user_path")]
    pub user: String,
    #[serde(default = "default_membership_path")]
    pub membership: String,
}

impl Default for EntityPaths {
    fn default() -> Self {
        Self {
            organization: default_org_path(),
            user: default_user_path(),
            membership: default_membership_path(),
        }
    }
}

impl EntityPaths {
    pub fn for_type(&self, entity_type: EntityType) -> &str {
        match entity_type {
            EntityType::Organization => &self.organization,
            EntityType::User => &self.user,
            EntityType::Membership => &self.membership,
        }
    }
}

fn default_org_path() -> String {
    "organizations".to_string()
}

fn default_user_path() -> String {
    "users".to_string()
}

fn default_membership_path() -> String {
    "memberships".to_string()
}

fn default_page_size() -> u32 {
    200
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSourceConfig {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub paths: EntityPaths,
    #[serde(default)]
    pub field_mapping: FieldMapping,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Joins a relative path onto a base URL, tolerating missing or doubled slashes.
pub(crate) fn join_url(base: &Url, segments: &[&str]) -> Result<Url, SyncError> {
    let mut url = base.clone();
    {
        let mut parts = url
            .path_segments_mut()
            .map_err(|_| SyncError::configuration(format!("'{base}' cannot be a base URL")))?;
        parts.pop_if_empty();
        for segment in segments {
            for piece in segment.split('/').filter(|p| !p.is_empty()) {
                parts.push(piece);
            }
        }
    }
    Ok(url)
}

pub struct HttpSource {
    client: Client,
    base_url: Url,
    config: ApiSourceConfig,
    mapper: FieldMapper,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageBody {
    #[serde(default)]
    items: Vec<Value>,
    #[serde(default)]
    next_cursor: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangesBody {
    #[serde(default)]
    created: Vec<Value>,
    #[serde(default)]
    updated: Vec<Value>,
    #[serde(default)]
    deleted: Vec<Value>,
    #[serde(default)]
    next_cursor: Option<Value>,
    #[serde(default)]
    high_watermark: Option<Value>,
}

impl HttpSource {
    pub fn new(client: Client, config: ApiSourceConfig) -> Result<Self, SyncError> {
        let base_url = Url::parse(&config.base_url).map_err(|err| {
            SyncError::configuration(format!("invalid source base url '{}': {err}", config.base_url))
        })?;
        if config.page_size == 0 {
            return Err(SyncError::configuration("source page size must be positive"));
        }
        config.field_mapping.validate()?;
        Ok(Self {
            client,
            base_url,
            mapper: FieldMapper::new(config.field_mapping.clone()),
            config,
        })
    }

    fn request(&self, url: Url, scope: &Scope) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .header("X-Tenant-Id", scope.tenant_id.to_string())
            .header("X-Project-Id", scope.project_id.to_string());
        if let Some(token) = &self.config.token {
            builder = builder.bearer_auth(token);
        }
        for (name, value) in &self.config.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        scope: &Scope,
    ) -> Result<T, SyncError> {
        let resp = self.request(url.clone(), scope).send().await.map_err(|err| {
            SyncError::source_unavailable(format!("source request to {} failed: {err}", redact(&url)))
        })?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::source_unavailable(format!(
                "source rejected credentials ({status})"
            )));
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(SyncError::source_unavailable(format!(
                "source temporarily unavailable ({status})"
            )));
        }
        if !status.is_success() {
            return Err(SyncError::source_schema(format!(
                "source request to {} failed with {status}",
                redact(&url)
            )));
        }

        resp.json::<T>()
            .await
            .map_err(|err| SyncError::source_schema(format!("unexpected source response: {err}")))
    }

    fn cursor_param(value: &Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

fn redact(url: &Url) -> String {
    format!("{}://{}{}", url.scheme(), url.host_str().unwrap_or("unknown"), url.path())
}

#[async_trait]
impl SourceAdapter for HttpSource {
    fn kind(&self) -> &'static str {
        "api"
    }

    #[instrument(skip(self, filter), fields(source = "api"))]
    async fn fetch_full(
        &self,
        scope: &Scope,
        entity_types: &[EntityType],
        filter: &SourceFilter,
    ) -> Result<DirectorySnapshot, SyncError> {
        let mut snapshot = DirectorySnapshot::new();

        for &entity_type in entity_types {
            let mut cursor: Option<String> = None;
            let mut pages = 0usize;
            loop {
                let mut url = join_url(&self.base_url, &[self.config.paths.for_type(entity_type)])?;
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("limit", &self.config.page_size.to_string());
                    if let Some(c) = &cursor {
                        query.append_pair("cursor", c);
                    }
                    for (field, value) in &filter.0 {
                        let rendered = match value {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        query.append_pair(field, &rendered);
                    }
                }

                let page: PageBody = self.get_json(url, scope).await?;
                debug!(entity_type = %entity_type, items = page.items.len(), "fetched source page");
                for item in &page.items {
                    snapshot.insert(self.mapper.map_record(entity_type, item)?);
                }

                pages += 1;
                cursor = page.next_cursor.as_ref().and_then(Self::cursor_param);
                if cursor.is_none() || page.items.is_empty() {
                    break;
                }
                if pages >= MAX_PAGES {
                    warn!(entity_type = %entity_type, "source pagination exceeded page limit");
                    return Err(SyncError::source_schema(format!(
                        "source returned more than {MAX_PAGES} pages of {entity_type}"
                    )));
                }
            }
        }

        Ok(snapshot)
    }

    #[instrument(skip(self, cursor), fields(source = "api"))]
    async fn fetch_changes(
        &self,
        scope: &Scope,
        entity_types: &[EntityType],
        since: Option<DateTime<Utc>>,
        cursor: Option<&SyncCursor>,
    ) -> Result<ChangeSet, SyncError> {
        let mut set = ChangeSet {
            high_watermark: since,
            ..ChangeSet::default()
        };
        let mut next_parts = Map::new();
        if let Some(Value::Object(previous)) = cursor.map(SyncCursor::as_json) {
            next_parts.extend(previous.clone());
        }

        for &entity_type in entity_types {
            let mut url = join_url(
                &self.base_url,
                &[self.config.paths.for_type(entity_type), "changes"],
            )?;
            {
                let mut query = url.query_pairs_mut();
                if let Some(since) = since {
                    query.append_pair("since", &since.to_rfc3339());
                }
                if let Some(part) = cursor
                    .and_then(|c| c.part(entity_type))
                    .and_then(Self::cursor_param)
                {
                    query.append_pair("cursor", &part);
                }
            }

            let body: ChangesBody = self.get_json(url, scope).await?;
            let id_field = self.mapper.id_field(entity_type).to_string();

            for raw in &body.created {
                let record = self.mapper.map_record(entity_type, raw)?;
                set.observe(raw.get(self.mapper.source_field(entity_type, "updatedAt")).and_then(parse_timestamp));
                set.entry(entity_type).created.push(record);
            }
            for raw in &body.updated {
                let record = self.mapper.map_record(entity_type, raw)?;
                set.observe(raw.get(self.mapper.source_field(entity_type, "updatedAt")).and_then(parse_timestamp));
                set.entry(entity_type).updated.push(record);
            }
            for raw in &body.deleted {
                let deleted = match raw {
                    Value::String(id) => DeletedEntity {
                        id: id.clone(),
                        deleted_at: None,
                    },
                    Value::Number(n) => DeletedEntity {
                        id: n.to_string(),
                        deleted_at: None,
                    },
                    Value::Object(obj) => {
                        let id = obj
                            .get(&id_field)
                            .or_else(|| obj.get("id"))
                            .and_then(|v| match v {
                                Value::String(s) => Some(s.clone()),
                                Value::Number(n) => Some(n.to_string()),
                                _ => None,
                            })
                            .ok_or_else(|| {
                                SyncError::source_schema(format!(
                                    "deleted {entity_type} entry is missing '{id_field}'"
                                ))
                            })?;
                        DeletedEntity {
                            id,
                            deleted_at: obj.get("deletedAt").and_then(parse_timestamp),
                        }
                    }
                    other => {
                        return Err(SyncError::source_schema(format!(
                            "deleted {entity_type} entry must be an id or object, got {other}"
                        )));
                    }
                };
                set.observe(deleted.deleted_at);
                set.entry(entity_type).deleted.push(deleted);
            }

            set.observe(body.high_watermark.as_ref().and_then(parse_timestamp));
            next_parts.insert(
                entity_type.as_str().to_string(),
                body.next_cursor.unwrap_or(Value::Null),
            );
        }

        set.next_cursor = Some(SyncCursor::from_json(Value::Object(next_parts)));
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_handles_slashes() {
        let base = Url::parse("https://hr.example.com/api/v1/").unwrap();
        let url = join_url(&base, &["/users/", "changes"]).unwrap();
        assert_eq!(url.as_str(), "https://hr.example.com/api/v1/users/changes");

        let bare = Url::parse("https://hr.example.com").unwrap();
        assert_eq!(
            join_url(&bare, &["organizations"]).unwrap().as_str(),
            "https://hr.example.com/organizations"
        );
    }

    #[test]
    fn rejects_invalid_base_url() {
        let config = ApiSourceConfig {
            base_url: "not a url".to_string(),
            token: None,
            paths: EntityPaths::default(),
            field_mapping: FieldMapping::default(),
            page_size: 10,
            headers: BTreeMap::new(),
        };
        assert!(HttpSource::new(Client::new(), config).is_err());
    }
}
