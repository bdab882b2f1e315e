//! Error taxonomy shared by adapters, the diff engine, the executor and the task manager.
//!
//! `SyncError` is serialized verbatim into `sync_tasks.error` and
//! `sync_operations.error`, so it carries the entity id, operation type and
//! attempt count needed to replay a single operation by hand.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Source unreachable or refused our credentials
    SourceUnavailable,
    /// Source data does not match the configured mapping
    SourceSchemaError,
    /// Organization parent graph contains a cycle
    CyclicHierarchy,
    /// Target refused the call; `permanent` rejections are never retried
    TargetRejected { permanent: bool },
    /// Manual conflict left for an operator
    ConflictUnresolved,
    /// Scope lock held by another task
    LockContention,
    /// Snapshot violates a directory invariant
    InvalidSnapshot,
    /// Adapter call exceeded its time budget
    Timeout,
    /// Task was asked to stop
    Cancelled,
    /// Intermediate store failure
    Storage,
    /// Invalid source/target/task configuration
    Configuration,
}

impl SyncErrorKind {
    pub const fn code(&self) -> &'static str {
        match self {
            SyncErrorKind::SourceUnavailable => "SOURCE_UNAVAILABLE",
            SyncErrorKind::SourceSchemaError => "SOURCE_SCHEMA_ERROR",
            SyncErrorKind::CyclicHierarchy => "CYCLIC_HIERARCHY",
            SyncErrorKind::TargetRejected { .. } => "TARGET_REJECTED",
            SyncErrorKind::ConflictUnresolved => "CONFLICT_UNRESOLVED",
            SyncErrorKind::LockContention => "LOCK_CONTENTION",
            SyncErrorKind::InvalidSnapshot => "INVALID_SNAPSHOT",
            SyncErrorKind::Timeout => "TIMEOUT",
            SyncErrorKind::Cancelled => "CANCELLED",
            SyncErrorKind::Storage => "STORAGE_ERROR",
            SyncErrorKind::Configuration => "CONFIGURATION_ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncError {
    #[serde(flatten)]
    pub kind: SyncErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl SyncError {
    pub fn new<S: Into<String>>(kind: SyncErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            entity_type: None,
            entity_id: None,
            operation: None,
            attempts: None,
            details: None,
        }
    }

    pub fn source_unavailable<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::SourceUnavailable, message)
    }

    pub fn source_schema<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::SourceSchemaError, message)
    }

    pub fn cyclic_hierarchy<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::CyclicHierarchy, message)
    }

    pub fn target_rejected<S: Into<String>>(permanent: bool, message: S) -> Self {
        Self::new(SyncErrorKind::TargetRejected { permanent }, message)
    }

    pub fn conflict_unresolved<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::ConflictUnresolved, message)
    }

    pub fn lock_contention<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::LockContention, message)
    }

    pub fn invalid_snapshot<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::InvalidSnapshot, message)
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::Timeout, message)
    }

    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::Cancelled, message)
    }

    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::Storage, message)
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::Configuration, message)
    }

    pub fn with_entity<T: Into<String>, I: Into<String>>(mut self, entity_type: T, entity_id: I) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_operation<S: Into<String>>(mut self, operation: S) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Transient failures handled by local retry; everything else surfaces to the task.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            SyncErrorKind::SourceUnavailable
            | SyncErrorKind::LockContention
            | SyncErrorKind::Timeout
            | SyncErrorKind::Storage => true,
            SyncErrorKind::TargetRejected { permanent } => !permanent,
            SyncErrorKind::SourceSchemaError
            | SyncErrorKind::CyclicHierarchy
            | SyncErrorKind::ConflictUnresolved
            | SyncErrorKind::InvalidSnapshot
            | SyncErrorKind::Cancelled
            | SyncErrorKind::Configuration => false,
        }
    }

    /// Classify an HTTP status returned by a target directory.
    pub fn from_target_status(status: u16, body: &str) -> Self {
        let snippet: String = body.chars().take(200).collect();
        match status {
            401 => Self::target_rejected(false, "target rejected credentials"),
            408 | 429 => Self::target_rejected(false, format!("target throttled request ({status})")),
            400..=499 => Self::target_rejected(
                true,
                format!("target rejected request ({status}): {snippet}"),
            ),
            _ => Self::target_rejected(false, format!("target error ({status}): {snippet}")),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)?;
        if let (Some(entity_type), Some(entity_id)) = (&self.entity_type, &self.entity_id) {
            write!(f, " [{entity_type} {entity_id}]")?;
        }
        if let Some(operation) = &self.operation {
            write!(f, " op={operation}")?;
        }
        if let Some(attempts) = self.attempts {
            write!(f, " attempts={attempts}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncError {}

impl From<sea_orm::DbErr> for SyncError {
    fn from(err: sea_orm::DbErr) -> Self {
        SyncError::storage(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::storage(format!("serialization failed: {err}"))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::timeout(format!("request timed out: {err}"))
        } else if let Some(status) = err.status() {
            SyncError::from_target_status(status.as_u16(), "")
        } else {
            SyncError::target_rejected(false, format!("network error: {err}"))
        }
    }
}
