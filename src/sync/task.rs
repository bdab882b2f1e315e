//! Sync task lifecycle types and the request/option model persisted in
//! `sync_tasks.config`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::adapters::source::SourceFilter;
use crate::adapters::{SourceConfig, TargetConfig};
use crate::config::{
    AppConfig, BatchConfig, ConflictPolicy, QueueConfig, RetryPolicyConfig, StrategyKind,
};
use crate::directory::{EntityType, normalize_entity_types};
use crate::models::sync_task;
use crate::sync::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Full,
    Incremental,
}

impl TaskType {
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskType::Full => "full",
            TaskType::Incremental => "incremental",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "full" => Ok(TaskType::Full),
            "incremental" => Ok(TaskType::Incremental),
            other => Err(SyncError::configuration(format!("unknown task type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(SyncError::configuration(format!("unknown task status '{other}'"))),
        }
    }
}

/// Per-request overrides of the engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_on_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_policy: Option<ConflictPolicy>,
}

/// Options in force for one task after applying overrides to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOptions {
    pub strategy: StrategyKind,
    pub batch_size: u32,
    pub batch_concurrency: u32,
    pub batch_delay_ms: u64,
    pub stop_on_error: bool,
    pub org_concurrency: u32,
    pub user_concurrency: u32,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter: f64,
    pub call_timeout_ms: u64,
    pub checkpoint_every: u32,
    pub conflict_policy: ConflictPolicy,
}

impl ExecutionOptions {
    pub fn resolve(config: &AppConfig, overrides: &SyncOptions) -> Result<Self, SyncError> {
        let effective = Self {
            strategy: overrides.strategy.unwrap_or(config.sync.strategy),
            batch_size: overrides.batch_size.unwrap_or(config.batch.size),
            batch_concurrency: overrides.concurrency.unwrap_or(config.batch.concurrency),
            batch_delay_ms: overrides.delay_ms.unwrap_or(config.batch.delay_ms),
            stop_on_error: overrides.stop_on_error.unwrap_or(config.batch.stop_on_error),
            org_concurrency: config.queue.org_concurrency,
            user_concurrency: config.queue.user_concurrency,
            poll_interval_ms: config.queue.poll_interval_ms,
            max_attempts: overrides.max_attempts.unwrap_or(config.retry.max_attempts),
            retry_base_ms: config.retry.base_ms,
            retry_max_ms: config.retry.max_ms,
            retry_jitter: config.retry.jitter_factor,
            call_timeout_ms: config.sync.call_timeout_ms,
            checkpoint_every: config.sync.checkpoint_every,
            conflict_policy: overrides.conflict_policy.unwrap_or(config.sync.conflict_policy),
        };

        effective
            .batch()
            .validate()
            .and_then(|_| effective.queue().validate())
            .and_then(|_| effective.retry().validate())
            .map_err(|err| SyncError::configuration(err.to_string()))?;
        Ok(effective)
    }

    pub fn batch(&self) -> BatchConfig {
        BatchConfig {
            size: self.batch_size,
            concurrency: self.batch_concurrency,
            delay_ms: self.batch_delay_ms,
            stop_on_error: self.stop_on_error,
        }
    }

    pub fn queue(&self) -> QueueConfig {
        QueueConfig {
            org_concurrency: self.org_concurrency,
            user_concurrency: self.user_concurrency,
            poll_interval_ms: self.poll_interval_ms,
        }
    }

    pub fn retry(&self) -> RetryPolicyConfig {
        RetryPolicyConfig {
            max_attempts: self.max_attempts,
            base_ms: self.retry_base_ms,
            max_ms: self.retry_max_ms,
            jitter_factor: self.retry_jitter,
        }
    }
}

/// Body of `POST /sync/full` and `POST /sync/incremental`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Empty means every entity type
    #[serde(default)]
    pub entity_types: Vec<EntityType>,
    #[schema(value_type = Object)]
    pub source: SourceConfig,
    #[schema(value_type = Object)]
    pub target: TargetConfig,
    #[serde(default)]
    pub options: SyncOptions,
    /// Equality filter applied to full fetches
    #[serde(default, skip_serializing_if = "SourceFilter::is_empty")]
    #[schema(value_type = Object)]
    pub filter: SourceFilter,
    /// Overrides the incremental starting point
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

/// Persisted task configuration: the request plus its effective options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    pub entity_types: Vec<EntityType>,
    pub source: SourceConfig,
    pub target: TargetConfig,
    #[serde(default, skip_serializing_if = "SourceFilter::is_empty")]
    pub filter: SourceFilter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    pub options: ExecutionOptions,
}

impl TaskConfig {
    pub fn from_request(config: &AppConfig, request: SyncRequest) -> Result<Self, SyncError> {
        Ok(Self {
            entity_types: normalize_entity_types(&request.entity_types),
            options: ExecutionOptions::resolve(config, &request.options)?,
            source: request.source,
            target: request.target,
            filter: request.filter,
            since: request.since,
        })
    }

    pub fn from_json(value: &Value) -> Result<Self, SyncError> {
        serde_json::from_value(value.clone())
            .map_err(|err| SyncError::configuration(format!("stored task config is invalid: {err}")))
    }
}

/// Operation counts stored in the task result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationCounts {
    pub total: u64,
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub paused: u64,
}

/// API view of a sync task.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: String,
    pub progress: i16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub checkpoint: Option<Value>,
    #[schema(value_type = Object)]
    pub config: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub error: Option<Value>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<sync_task::Model> for TaskView {
    fn from(model: sync_task::Model) -> Self {
        Self {
            id: model.id,
            tenant_id: model.tenant_id,
            project_id: model.project_id,
            task_type: model.task_type,
            status: model.status,
            progress: model.progress,
            current_step: model.current_step,
            checkpoint: model.checkpoint,
            config: model.config,
            result: model.result,
            error: model.error,
            cancel_requested: model.cancel_requested,
            created_at: model.created_at.with_timezone(&Utc),
            started_at: model.started_at.map(|t| t.with_timezone(&Utc)),
            updated_at: model.updated_at.with_timezone(&Utc),
            finished_at: model.finished_at.map(|t| t.with_timezone(&Utc)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overrides_replace_defaults() {
        let config = AppConfig::default();
        let options = ExecutionOptions::resolve(
            &config,
            &SyncOptions {
                strategy: Some(StrategyKind::Realtime),
                batch_size: Some(7),
                conflict_policy: Some(ConflictPolicy::Manual),
                ..SyncOptions::default()
            },
        )
        .unwrap();
        assert_eq!(options.strategy, StrategyKind::Realtime);
        assert_eq!(options.batch_size, 7);
        assert_eq!(options.conflict_policy, ConflictPolicy::Manual);
        assert_eq!(options.max_attempts, config.retry.max_attempts);
    }

    #[test]
    fn invalid_override_is_configuration_error() {
        let err = ExecutionOptions::resolve(
            &AppConfig::default(),
            &SyncOptions {
                concurrency: Some(0),
                ..SyncOptions::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, crate::sync::error::SyncErrorKind::Configuration);
    }

    #[test]
    fn request_defaults_to_all_entity_types() {
        let request: SyncRequest = serde_json::from_value(json!({
            "source": { "type": "custom", "name": "hr" },
            "target": { "type": "collecting" }
        }))
        .unwrap();
        let config = TaskConfig::from_request(&AppConfig::default(), request).unwrap();
        assert_eq!(config.entity_types, EntityType::ALL.to_vec());

        let stored = serde_json::to_value(&config).unwrap();
        assert_eq!(TaskConfig::from_json(&stored).unwrap(), config);
    }
}
