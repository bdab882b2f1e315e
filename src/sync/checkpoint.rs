//! Persisted task checkpoints.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapters::SyncCursor;
use crate::sync::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStep {
    Fetching,
    Diffing,
    Executing,
    Finalizing,
}

impl TaskStep {
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskStep::Fetching => "fetching",
            TaskStep::Diffing => "diffing",
            TaskStep::Executing => "executing",
            TaskStep::Finalizing => "finalizing",
        }
    }
}

impl fmt::Display for TaskStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStep {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "fetching" => Ok(TaskStep::Fetching),
            "diffing" => Ok(TaskStep::Diffing),
            "executing" => Ok(TaskStep::Executing),
            "finalizing" => Ok(TaskStep::Finalizing),
            other => Err(SyncError::storage(format!("unknown task step '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub step: TaskStep,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<SyncCursor>,
    /// Source-specific resume state, opaque to the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_state: Option<Value>,
    #[serde(default)]
    pub batch_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation_id: Option<String>,
    #[serde(default)]
    pub operations_total: u64,
    #[serde(default)]
    pub operations_done: u64,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn at(step: TaskStep) -> Self {
        Self {
            step,
            cursor: None,
            source_state: None,
            batch_index: 0,
            last_operation_id: None,
            operations_total: 0,
            operations_done: 0,
            saved_at: Utc::now(),
        }
    }

    pub fn with_cursor(mut self, cursor: Option<SyncCursor>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn with_operations(mut self, total: u64, done: u64) -> Self {
        self.operations_total = total;
        self.operations_done = done;
        self
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Unknown steps and malformed documents come back as `None`.
    pub fn from_json(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Whether an interrupted task can continue from this checkpoint.
    ///
    /// The executing step additionally requires the persisted operation set
    /// to match the count recorded when execution started.
    pub fn is_resumable(&self, now: DateTime<Utc>, max_age: Duration, persisted_operations: u64) -> bool {
        if now - self.saved_at > max_age {
            return false;
        }
        match self.step {
            TaskStep::Executing | TaskStep::Finalizing => {
                persisted_operations == self.operations_total
            }
            TaskStep::Fetching | TaskStep::Diffing => true,
        }
    }
}

/// Maps finished operations onto the executing progress band (30..=95).
pub fn execution_progress(done: u64, total: u64) -> i32 {
    if total == 0 {
        return 95;
    }
    let span = 65.0 * (done.min(total) as f64 / total as f64);
    30 + span.round() as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stale_checkpoint_is_not_resumable() {
        let mut cp = Checkpoint::at(TaskStep::Diffing);
        cp.saved_at = Utc::now() - Duration::hours(3);
        assert!(!cp.is_resumable(Utc::now(), Duration::hours(1), 0));
    }

    #[test]
    fn executing_checkpoint_requires_matching_operation_count() {
        let cp = Checkpoint::at(TaskStep::Executing).with_operations(12, 4);
        let now = Utc::now();
        assert!(cp.is_resumable(now, Duration::hours(1), 12));
        assert!(!cp.is_resumable(now, Duration::hours(1), 11));
    }

    #[test]
    fn unknown_step_does_not_parse() {
        let value = json!({"step": "teleporting", "savedAt": Utc::now()});
        assert!(Checkpoint::from_json(&value).is_none());

        let cp = Checkpoint::at(TaskStep::Fetching).with_cursor(Some(SyncCursor::from_json(json!("c1"))));
        let back = Checkpoint::from_json(&cp.to_json()).unwrap();
        assert_eq!(back.step, TaskStep::Fetching);
        assert_eq!(back.cursor, cp.cursor);
    }

    #[test]
    fn progress_stays_inside_execution_band() {
        assert_eq!(execution_progress(0, 10), 30);
        assert_eq!(execution_progress(10, 10), 95);
        assert_eq!(execution_progress(5, 10), 63);
        assert_eq!(execution_progress(0, 0), 95);
    }
}
