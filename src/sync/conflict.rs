//! Conflict detection and resolution.
//!
//! An entity conflicts when the target modified it after our last successful
//! sync of that entity while the source changed it too (an operation was
//! planned). Entities never synced cannot conflict.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::config::ConflictPolicy;
use crate::directory::EntityType;
use crate::sync::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    Pending,
    SourceApplied,
    TargetKept,
}

impl ConflictResolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            ConflictResolution::Pending => "pending",
            ConflictResolution::SourceApplied => "source_applied",
            ConflictResolution::TargetKept => "target_kept",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolution {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(ConflictResolution::Pending),
            "source_applied" => Ok(ConflictResolution::SourceApplied),
            "target_kept" => Ok(ConflictResolution::TargetKept),
            other => Err(SyncError::configuration(format!(
                "unknown conflict resolution '{other}'"
            ))),
        }
    }
}

/// What happens to the conflicting operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Overwrite the target
    Apply,
    /// Keep the target; the operation is skipped
    Skip,
    /// Leave for an operator; the operation is paused
    Hold,
}

impl ConflictDecision {
    pub const fn resolution(self) -> ConflictResolution {
        match self {
            ConflictDecision::Apply => ConflictResolution::SourceApplied,
            ConflictDecision::Skip => ConflictResolution::TargetKept,
            ConflictDecision::Hold => ConflictResolution::Pending,
        }
    }
}

/// Operator decision for a `manual` conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResolveAction {
    ApplySource,
    KeepTarget,
}

impl ResolveAction {
    pub const fn resolution(self) -> ConflictResolution {
        match self {
            ResolveAction::ApplySource => ConflictResolution::SourceApplied,
            ResolveAction::KeepTarget => ConflictResolution::TargetKept,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictCandidate {
    pub operation_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub target_updated_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub source_data: Option<Value>,
    pub target_data: Option<Value>,
}

/// True when the target changed the entity after `last_synced_at`.
pub fn is_conflict(last_synced_at: Option<DateTime<Utc>>, target_updated_at: Option<DateTime<Utc>>) -> bool {
    match (last_synced_at, target_updated_at) {
        (Some(synced), Some(modified)) => modified > synced,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn decide(&self, candidate: &ConflictCandidate) -> ConflictDecision {
        match self.policy {
            ConflictPolicy::SourceWins => ConflictDecision::Apply,
            ConflictPolicy::TargetWins => ConflictDecision::Skip,
            ConflictPolicy::Manual => ConflictDecision::Hold,
            // Without a source timestamp the target is taken as newer.
            ConflictPolicy::NewerWins => match candidate.source_updated_at {
                Some(source) if source > candidate.target_updated_at => ConflictDecision::Apply,
                _ => ConflictDecision::Skip,
            },
        }
    }
}

/// Conflict tally stored in the task result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSummary {
    pub detected: u64,
    pub source_applied: u64,
    pub target_kept: u64,
    pub pending: u64,
}

impl ConflictSummary {
    pub fn add(&mut self, decision: ConflictDecision) {
        self.detected += 1;
        match decision {
            ConflictDecision::Apply => self.source_applied += 1,
            ConflictDecision::Skip => self.target_kept += 1,
            ConflictDecision::Hold => self.pending += 1,
        }
    }
}
