//! API-backed target: applies operations through the external directory's
//! REST endpoints.
//!
//! Endpoints, relative to `baseUrl` and the per-type path:
//! `GET {path}?limit=&cursor=` (list), `GET {path}/{id}`, `POST {path}`,
//! `PUT {path}/{id}`, `DELETE {path}/{id}`. Every request carries the
//! `X-Tenant-Id` / `X-Project-Id` headers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::http_source::{EntityPaths, join_url};
use super::target::{RemoteState, TargetAdapter, TargetOutcome, wire_value};
use crate::directory::{DirectoryRecord, EntityType, Scope};
use crate::normalization::parse_timestamp;
use crate::sync::error::SyncError;
use crate::sync::operation::OperationType;

const MAX_PAGES: usize = 10_000;
/// Tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetAuth {
    #[default]
    None,
    Bearer {
        token: String,
    },
    #[serde(rename_all = "camelCase")]
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
    },
}

fn default_page_size() -> u32 {
    200
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTargetConfig {
    pub base_url: String,
    #[serde(default)]
    pub auth: TargetAuth,
    #[serde(default)]
    pub paths: EntityPaths,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let margin = chrono::Duration::from_std(TOKEN_REFRESH_MARGIN)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
                expires_at - margin > now
            }
            None => true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    #[serde(default)]
    items: Vec<Value>,
    #[serde(default)]
    next_cursor: Option<Value>,
}

pub struct ApiTarget {
    client: Client,
    base_url: Url,
    config: ApiTargetConfig,
    token: RwLock<Option<CachedToken>>,
}

impl ApiTarget {
    pub fn new(client: Client, config: ApiTargetConfig) -> Result<Self, SyncError> {
        let base_url = Url::parse(&config.base_url).map_err(|err| {
            SyncError::configuration(format!("invalid target base url '{}': {err}", config.base_url))
        })?;
        if config.page_size == 0 {
            return Err(SyncError::configuration("target page size must be positive"));
        }
        if let TargetAuth::ClientCredentials { token_url, .. } = &config.auth {
            Url::parse(token_url).map_err(|err| {
                SyncError::configuration(format!("invalid target token url: {err}"))
            })?;
        }
        Ok(Self {
            client,
            base_url,
            config,
            token: RwLock::new(None),
        })
    }

    /// Current bearer token, refreshing client-credentials tokens near expiry.
    async fn access_token(&self) -> Result<Option<String>, SyncError> {
        match &self.config.auth {
            TargetAuth::None => Ok(None),
            TargetAuth::Bearer { token } => Ok(Some(token.clone())),
            TargetAuth::ClientCredentials { .. } => {
                let now = Utc::now();
                if let Some(cached) = self.token.read().await.as_ref() {
                    if cached.is_fresh(now) {
                        return Ok(Some(cached.access_token.clone()));
                    }
                }

                let mut guard = self.token.write().await;
                if let Some(cached) = guard.as_ref() {
                    if cached.is_fresh(now) {
                        return Ok(Some(cached.access_token.clone()));
                    }
                }
                let fresh = self.request_token().await?;
                let access_token = fresh.access_token.clone();
                *guard = Some(fresh);
                Ok(Some(access_token))
            }
        }
    }

    async fn invalidate_token(&self) {
        if matches!(self.config.auth, TargetAuth::ClientCredentials { .. }) {
            *self.token.write().await = None;
        }
    }

    async fn request_token(&self) -> Result<CachedToken, SyncError> {
        let TargetAuth::ClientCredentials {
            token_url,
            client_id,
            client_secret,
            scope,
        } = &self.config.auth
        else {
            return Err(SyncError::configuration("target is not using client credentials"));
        };

        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", client_id.clone()),
            ("client_secret", client_secret.clone()),
        ];
        if let Some(scope) = scope {
            form.push(("scope", scope.clone()));
        }

        let resp = self.client.post(token_url).form(&form).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "target token request failed");
            return Err(SyncError::from_target_status(status.as_u16(), &body)
                .with_operation("token_refresh"));
        }

        let token: TokenResponse = resp.json().await?;
        info!("refreshed target access token");
        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        })
    }

    fn entity_url(&self, entity_type: EntityType, id: Option<&str>) -> Result<Url, SyncError> {
        let path = self.config.paths.for_type(entity_type);
        match id {
            Some(id) => {
                let mut url = join_url(&self.base_url, &[path])?;
                url.path_segments_mut()
                    .map_err(|_| SyncError::configuration("target base url cannot have paths"))?
                    .push(id);
                Ok(url)
            }
            None => join_url(&self.base_url, &[path]),
        }
    }

    /// Sends one request, retrying once with a fresh token after a 401.
    async fn send(
        &self,
        scope: &Scope,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, SyncError> {
        let mut refreshed = false;
        loop {
            let mut builder = self
                .client
                .request(method.clone(), url.clone())
                .header("Accept", "application/json")
                .header("X-Tenant-Id", scope.tenant_id.to_string())
                .header("X-Project-Id", scope.project_id.to_string());
            if let Some(token) = self.access_token().await? {
                builder = builder.bearer_auth(token);
            }
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let resp = builder.send().await?;
            if resp.status() == StatusCode::UNAUTHORIZED
                && !refreshed
                && matches!(self.config.auth, TargetAuth::ClientCredentials { .. })
            {
                debug!("target returned 401, refreshing token");
                self.invalidate_token().await;
                refreshed = true;
                continue;
            }
            return Ok(resp);
        }
    }

    async fn rejected(resp: reqwest::Response) -> SyncError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        SyncError::from_target_status(status, &body)
    }

    fn parse_item(
        entity_type: EntityType,
        item: Value,
    ) -> Result<(DirectoryRecord, Option<DateTime<Utc>>), SyncError> {
        let modified = item
            .get("updatedAt")
            .or_else(|| item.get("modifiedAt"))
            .and_then(parse_timestamp);
        let record = DirectoryRecord::from_value(entity_type, item).map_err(|err| {
            SyncError::target_rejected(true, format!("target returned malformed entity: {}", err.message))
        })?;
        Ok((record, modified))
    }

    async fn response_json(resp: reqwest::Response) -> Option<Value> {
        let bytes = resp.bytes().await.ok()?;
        if bytes.is_empty() {
            return None;
        }
        serde_json::from_slice(&bytes).ok()
    }
}

#[async_trait]
impl TargetAdapter for ApiTarget {
    fn kind(&self) -> &'static str {
        "api"
    }

    #[instrument(skip(self), fields(target = "api"))]
    async fn fetch_current(
        &self,
        scope: &Scope,
        entity_types: &[EntityType],
    ) -> Result<RemoteState, SyncError> {
        let mut state = RemoteState::default();

        for &entity_type in entity_types {
            let mut cursor: Option<String> = None;
            let mut pages = 0usize;
            loop {
                let mut url = self.entity_url(entity_type, None)?;
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("limit", &self.config.page_size.to_string());
                    if let Some(c) = &cursor {
                        query.append_pair("cursor", c);
                    }
                }

                let resp = self.send(scope, Method::GET, url, None).await?;
                if !resp.status().is_success() {
                    return Err(Self::rejected(resp).await.with_operation("fetch_current"));
                }
                let page: ListPage = resp.json().await?;

                let fetched = page.items.len();
                for item in page.items {
                    let (record, modified) = Self::parse_item(entity_type, item)?;
                    if let Some(at) = modified {
                        state
                            .modified_at
                            .insert((entity_type, record.id().to_string()), at);
                    }
                    state.snapshot.insert(record);
                }

                pages += 1;
                cursor = match page.next_cursor {
                    Some(Value::String(s)) => Some(s),
                    Some(Value::Null) | None => None,
                    Some(other) => Some(other.to_string()),
                };
                if cursor.is_none() || fetched == 0 {
                    break;
                }
                if pages >= MAX_PAGES {
                    return Err(SyncError::target_rejected(
                        true,
                        format!("target returned more than {MAX_PAGES} pages of {entity_type}"),
                    ));
                }
            }
        }

        Ok(state)
    }

    #[instrument(skip(self, record), fields(target = "api", entity_id = record.id()))]
    async fn create(&self, scope: &Scope, record: &DirectoryRecord) -> Result<TargetOutcome, SyncError> {
        let entity_type = record.entity_type();

        let existing = self
            .send(scope, Method::GET, self.entity_url(entity_type, Some(record.id()))?, None)
            .await?;
        if existing.status().is_success() {
            debug!("entity already present on target, skipping create");
            return Ok(TargetOutcome {
                response: Self::response_json(existing).await,
                ..TargetOutcome::already_applied()
            });
        }
        if existing.status() != StatusCode::NOT_FOUND {
            return Err(Self::rejected(existing).await.with_operation("create"));
        }

        let payload = wire_value(record);
        let resp = self
            .send(scope, Method::POST, self.entity_url(entity_type, None)?, Some(&payload))
            .await?;
        if resp.status() == StatusCode::CONFLICT {
            return Ok(TargetOutcome::already_applied());
        }
        if !resp.status().is_success() {
            return Err(Self::rejected(resp).await.with_operation("create"));
        }

        let response = Self::response_json(resp).await;
        let remote_id = response
            .as_ref()
            .and_then(|v| v.get("id"))
            .and_then(Value::as_str)
            .filter(|id| *id != record.id())
            .map(str::to_string);
        Ok(TargetOutcome {
            remote_id,
            already_applied: false,
            response,
        })
    }

    #[instrument(skip(self, record), fields(target = "api", entity_id = record.id()))]
    async fn update(
        &self,
        scope: &Scope,
        operation: OperationType,
        record: &DirectoryRecord,
    ) -> Result<TargetOutcome, SyncError> {
        let payload = wire_value(record);
        let resp = self
            .send(
                scope,
                Method::PUT,
                self.entity_url(record.entity_type(), Some(record.id()))?,
                Some(&payload),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(Self::rejected(resp).await.with_operation(operation.as_str()));
        }
        Ok(TargetOutcome {
            response: Self::response_json(resp).await,
            ..TargetOutcome::applied()
        })
    }

    #[instrument(skip(self), fields(target = "api"))]
    async fn delete(
        &self,
        scope: &Scope,
        entity_type: EntityType,
        id: &str,
    ) -> Result<TargetOutcome, SyncError> {
        let resp = self
            .send(scope, Method::DELETE, self.entity_url(entity_type, Some(id))?, None)
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(TargetOutcome::already_applied());
        }
        if !resp.status().is_success() {
            return Err(Self::rejected(resp).await.with_operation("delete"));
        }
        Ok(TargetOutcome::applied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_config_is_tagged() {
        let auth: TargetAuth = serde_json::from_value(serde_json::json!({
            "type": "client_credentials",
            "tokenUrl": "https://idp.example.com/token",
            "clientId": "id",
            "clientSecret": "secret"
        }))
        .unwrap();
        assert!(matches!(auth, TargetAuth::ClientCredentials { scope: None, .. }));
        assert_eq!(TargetAuth::default(), TargetAuth::None);
    }

    #[test]
    fn cached_token_freshness_respects_margin() {
        let now = Utc::now();
        let soon = CachedToken {
            access_token: "t".into(),
            expires_at: Some(now + chrono::Duration::seconds(10)),
        };
        assert!(!soon.is_fresh(now));
        let later = CachedToken {
            access_token: "t".into(),
            expires_at: Some(now + chrono::Duration::seconds(600)),
        };
        assert!(later.is_fresh(now));
    }

    #[test]
    fn entity_urls_escape_ids() {
        let target = ApiTarget::new(
            Client::new(),
            ApiTargetConfig {
                base_url: "https://dir.example.com/v2".into(),
                auth: TargetAuth::None,
                paths: EntityPaths::default(),
                page_size: 50,
            },
        )
        .unwrap();
        let url = target.entity_url(EntityType::User, Some("a/b")).unwrap();
        assert_eq!(url.as_str(), "https://dir.example.com/v2/users/a%2Fb");
    }
}
