//! Adapter registry
//!
//! Builds source and target adapters from the JSON configuration carried by
//! a sync request. Custom sources and named collecting targets are registered
//! up front and shared across tasks.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use reqwest::Client;
use sea_orm::{Database, DatabaseConnection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::api_target::{ApiTarget, ApiTargetConfig};
use super::collecting_target::CollectingTarget;
use super::database_source::{DatabaseSource, DatabaseSourceConfig};
use super::http_source::{ApiSourceConfig, HttpSource};
use super::push::PushSource;
use super::source::SourceAdapter;
use super::target::TargetAdapter;
use crate::directory::DirectorySnapshot;
use crate::sync::error::SyncError;

/// Source selection, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Database(DatabaseSourceConfig),
    Api(ApiSourceConfig),
    Custom { name: String },
    /// Changes arrive through `POST /notify/changes`; nothing is polled
    Push,
}

impl SourceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceConfig::Database(_) => "database",
            SourceConfig::Api(_) => "api",
            SourceConfig::Custom { .. } => "custom",
            SourceConfig::Push => "push",
        }
    }
}

/// Target selection, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetConfig {
    Api(ApiTargetConfig),
    Collecting {
        /// Shared collector; a per-task collector is used when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Initial target state for a newly created collector
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seed: Option<DirectorySnapshot>,
    },
}

impl TargetConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TargetConfig::Api(_) => "api",
            TargetConfig::Collecting { .. } => "collecting",
        }
    }
}

#[derive(Clone)]
pub struct AdapterRegistry {
    db: DatabaseConnection,
    http: Client,
    sources: Arc<RwLock<HashMap<String, Arc<dyn SourceAdapter>>>>,
    collectors: Arc<RwLock<HashMap<String, Arc<CollectingTarget>>>>,
}

impl AdapterRegistry {
    pub fn new(db: DatabaseConnection, http: Client) -> Self {
        Self {
            db,
            http,
            sources: Arc::new(RwLock::new(HashMap::new())),
            collectors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a user-supplied source under `name`, replacing any previous one.
    pub fn register_source(&self, name: impl Into<String>, source: Arc<dyn SourceAdapter>) {
        let name = name.into();
        info!(source = %name, kind = source.kind(), "registered custom source");
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, source);
    }

    pub fn register_collector(&self, name: impl Into<String>, target: Arc<CollectingTarget>) {
        self.collectors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), target);
    }

    pub fn collector(&self, name: &str) -> Option<Arc<CollectingTarget>> {
        self.collectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub async fn build_source(&self, config: &SourceConfig) -> Result<Arc<dyn SourceAdapter>, SyncError> {
        let source: Arc<dyn SourceAdapter> = match config {
            SourceConfig::Database(cfg) => {
                let conn = match &cfg.url {
                    Some(url) => Database::connect(url.as_str()).await.map_err(|err| {
                        SyncError::source_unavailable(format!("cannot connect to source database: {err}"))
                    })?,
                    None => self.db.clone(),
                };
                Arc::new(DatabaseSource::new(conn, cfg.clone())?)
            }
            SourceConfig::Api(cfg) => Arc::new(HttpSource::new(self.http.clone(), cfg.clone())?),
            SourceConfig::Custom { name } => self
                .sources
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(name)
                .cloned()
                .ok_or_else(|| SyncError::configuration(format!("custom source '{name}' is not registered")))?,
            SourceConfig::Push => Arc::new(PushSource),
        };
        debug!(kind = source.kind(), "built source adapter");
        Ok(source)
    }

    /// Builds the target for `task_id`. Unnamed collectors are keyed by task so
    /// a resumed task keeps collecting into the same projection.
    pub async fn build_target(
        &self,
        config: &TargetConfig,
        task_id: Uuid,
    ) -> Result<Arc<dyn TargetAdapter>, SyncError> {
        match config {
            TargetConfig::Api(cfg) => Ok(Arc::new(ApiTarget::new(self.http.clone(), cfg.clone())?)),
            TargetConfig::Collecting { name, seed } => {
                let key = name.clone().unwrap_or_else(|| format!("task:{task_id}"));
                let mut collectors = self.collectors.write().unwrap_or_else(PoisonError::into_inner);
                let collector = collectors
                    .entry(key)
                    .or_insert_with(|| {
                        Arc::new(match seed {
                            Some(snapshot) => CollectingTarget::seeded(snapshot.clone()),
                            None => CollectingTarget::new(),
                        })
                    })
                    .clone();
                Ok(collector)
            }
        }
    }

    /// Drops the per-task collector once its result has been stored.
    pub fn release_task_collector(&self, task_id: Uuid) {
        self.collectors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&format!("task:{task_id}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_config_is_tagged_by_type() {
        let cfg: SourceConfig = serde_json::from_value(json!({
            "type": "api",
            "baseUrl": "https://hr.example.com",
        }))
        .unwrap();
        assert_eq!(cfg.kind(), "api");

        let cfg: SourceConfig =
            serde_json::from_value(json!({ "type": "custom", "name": "hr" })).unwrap();
        assert_eq!(cfg, SourceConfig::Custom { name: "hr".into() });

        let cfg: SourceConfig = serde_json::from_value(json!({ "type": "database" })).unwrap();
        assert_eq!(cfg.kind(), "database");
    }

    #[test]
    fn target_config_defaults_to_task_collector() {
        let cfg: TargetConfig = serde_json::from_value(json!({ "type": "collecting" })).unwrap();
        assert_eq!(cfg, TargetConfig::Collecting { name: None, seed: None });
    }
}
