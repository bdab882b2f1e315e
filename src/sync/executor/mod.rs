//! # Operation Executor
//!
//! [`OperationRunner`] executes a single persisted operation against a target
//! adapter: claim, call with a time budget, then record success, a scheduled
//! retry, or a final failure. The three strategies decide ordering and
//! concurrency on top of it:
//!
//! - [`RealtimeStrategy`]: one operation at a time, inline retries.
//! - [`BatchedStrategy`]: fixed-size slices, equal-tier groups run concurrently.
//! - [`QueuedStrategy`]: per-tier consumer pools polling the operation table.

mod batched;
mod queued;
mod realtime;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rand::{Rng, thread_rng};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{TargetAdapter, TargetOutcome};
use crate::config::{RetryPolicyConfig, StrategyKind};
use crate::directory::{EntityType, Scope};
use crate::repositories::{DirectoryRepository, OperationRepository};
use crate::sync::error::SyncError;
use crate::sync::notifier::{NotificationEvent, Notifier};
use crate::sync::operation::{OperationRecord, OperationStatus, OperationType};
use crate::sync::task::ExecutionOptions;

pub use batched::BatchedStrategy;
pub use queued::QueuedStrategy;
pub use realtime::RealtimeStrategy;

/// Backoff before attempt `attempts + 1`: `base * 2^(attempts-1)` capped at
/// `max`, plus up to `jitter_factor` of that as random jitter.
pub fn retry_delay(policy: &RetryPolicyConfig, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(30) as i32;
    let backoff = (policy.base_ms as f64 * 2_f64.powi(exponent)).min(policy.max_ms as f64);
    let jitter_span = policy.jitter_factor * backoff;
    let jitter = if jitter_span > 0.0 {
        thread_rng().gen_range(0.0..jitter_span)
    } else {
        0.0
    };
    Duration::from_millis((backoff + jitter).round() as u64)
}

/// What happened to one operation on one `run` call.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(TargetOutcome),
    /// Already `completed`, `skipped`, `failed` or `paused`; left untouched
    Finished(OperationStatus),
    /// Another worker holds the claim
    AlreadyClaimed,
    RetryScheduled { at: DateTime<Utc>, error: SyncError },
    Failed(SyncError),
}

impl RunOutcome {
    /// The operation reached a status that no further pass will change.
    pub fn is_final(&self) -> bool {
        !matches!(self, RunOutcome::RetryScheduled { .. } | RunOutcome::AlreadyClaimed)
    }
}

#[derive(Clone)]
pub struct OperationRunner {
    db: DatabaseConnection,
    target: Arc<dyn TargetAdapter>,
    notifier: Arc<dyn Notifier>,
    scope: Scope,
    task_id: Uuid,
    worker_id: String,
    retry: RetryPolicyConfig,
    call_timeout: Duration,
    operations: OperationRepository,
    directory: DirectoryRepository,
}

impl OperationRunner {
    pub fn new(
        db: DatabaseConnection,
        target: Arc<dyn TargetAdapter>,
        notifier: Arc<dyn Notifier>,
        scope: Scope,
        task_id: Uuid,
        retry: RetryPolicyConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            db,
            target,
            notifier,
            scope,
            task_id,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            retry,
            call_timeout,
            operations: OperationRepository::new(),
            directory: DirectoryRepository::new(),
        }
    }

    pub fn with_worker_id<S: Into<String>>(mut self, worker_id: S) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn retry_policy(&self) -> &RetryPolicyConfig {
        &self.retry
    }

    pub async fn run(&self, operation_id: &str) -> Result<RunOutcome, SyncError> {
        let Some(model) = self.operations.find(&self.db, operation_id).await? else {
            return Err(SyncError::storage(format!("operation {operation_id} not found")));
        };
        let status: OperationStatus = model.status.parse()?;
        match status {
            OperationStatus::Pending => {}
            OperationStatus::Running => return Ok(RunOutcome::AlreadyClaimed),
            finished => return Ok(RunOutcome::Finished(finished)),
        }

        let op = OperationRecord::try_from(model)?;
        if !self.operations.claim(&self.db, operation_id, &self.worker_id).await? {
            return Ok(RunOutcome::AlreadyClaimed);
        }

        let attempts = op.attempts.max(0) as u32 + 1;
        let started = Instant::now();
        let result = self.dispatch(&op).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!(
            "dirsync_operation_duration_ms",
            "entity_type" => op.entity_type.as_str(),
            "operation" => op.operation_type.as_str()
        )
        .record(elapsed_ms);

        match self.settle(&op, attempts, result).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // The claim must not outlive a failed state write.
                match self.operations.release_claim(&self.db, &op.id, &self.worker_id).await {
                    Ok(released) => warn!(
                        operation_id = %op.id,
                        released,
                        error = %err,
                        "recording operation outcome failed"
                    ),
                    Err(release_err) => warn!(
                        operation_id = %op.id,
                        error = %err,
                        release_error = %release_err,
                        "recording operation outcome failed, claim left to expire"
                    ),
                }
                Err(err)
            }
        }
    }

    /// Persists the result of a dispatch on the claimed operation.
    async fn settle(
        &self,
        op: &OperationRecord,
        attempts: u32,
        result: Result<TargetOutcome, SyncError>,
    ) -> Result<RunOutcome, SyncError> {
        match result {
            Ok(outcome) => {
                let value = serde_json::to_value(&outcome).unwrap_or_default();
                self.operations.complete(&self.db, &op.id, value).await?;
                if let Err(err) = self
                    .directory
                    .mark_synced(&self.db, &self.scope, op.entity_type, &op.entity_id, Utc::now())
                    .await
                {
                    warn!(
                        operation_id = %op.id,
                        entity_type = %op.entity_type,
                        entity_id = %op.entity_id,
                        error = %err,
                        "marking entity synced failed"
                    );
                }
                record_metric(op.entity_type, op.operation_type, "completed");
                debug!(
                    operation_id = %op.id,
                    entity_type = %op.entity_type,
                    entity_id = %op.entity_id,
                    operation = %op.operation_type,
                    already_applied = outcome.already_applied,
                    "operation completed"
                );
                Ok(RunOutcome::Completed(outcome))
            }
            Err(err) => {
                let err = err
                    .with_entity(op.entity_type.as_str(), op.entity_id.as_str())
                    .with_operation(op.operation_type.as_str())
                    .with_attempts(attempts);
                let error_json = serde_json::to_value(&err).unwrap_or_default();

                if err.is_retryable() && attempts < self.retry.max_attempts {
                    let delay = retry_delay(&self.retry, attempts);
                    let at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    self.operations
                        .schedule_retry(&self.db, &op.id, at, error_json)
                        .await?;
                    record_metric(op.entity_type, op.operation_type, "retry");
                    warn!(
                        operation_id = %op.id,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "operation failed, retry scheduled"
                    );
                    return Ok(RunOutcome::RetryScheduled { at, error: err });
                }

                self.operations.fail(&self.db, &op.id, error_json).await?;
                record_metric(op.entity_type, op.operation_type, "failed");
                warn!(operation_id = %op.id, attempts, error = %err, "operation failed");
                self.notifier
                    .notify(NotificationEvent::OperationFailed {
                        scope: self.scope,
                        task_id: self.task_id,
                        operation_id: op.id.clone(),
                        error: err.clone(),
                    })
                    .await;
                Ok(RunOutcome::Failed(err))
            }
        }
    }

    async fn dispatch(&self, op: &OperationRecord) -> Result<TargetOutcome, SyncError> {
        let call = async {
            match op.operation_type {
                OperationType::Delete => {
                    self.target
                        .delete(&self.scope, op.entity_type, &op.entity_id)
                        .await
                }
                OperationType::Create => {
                    let record = op.record().map_err(|e| SyncError::invalid_snapshot(e.message))?;
                    self.target.create(&self.scope, &record).await
                }
                other => {
                    let record = op.record().map_err(|e| SyncError::invalid_snapshot(e.message))?;
                    self.target.update(&self.scope, other, &record).await
                }
            }
        };
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::timeout(format!(
                "{} call exceeded {}ms",
                self.target.kind(),
                self.call_timeout.as_millis()
            ))),
        }
    }
}

fn record_metric(entity_type: EntityType, operation: OperationType, outcome: &'static str) {
    counter!(
        "dirsync_operations_total",
        "entity_type" => entity_type.as_str(),
        "operation" => operation.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Progress notification handed to the task manager for checkpointing.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub done: u64,
    pub total: u64,
    pub batch_index: u32,
    pub last_operation_id: Option<String>,
}

#[async_trait]
pub trait ProgressObserver: Send + Sync {
    async fn observe(&self, update: ProgressUpdate);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

#[async_trait]
impl ProgressObserver for NoopObserver {
    async fn observe(&self, _update: ProgressUpdate) {}
}

/// Shared state for one execution pass.
#[derive(Clone)]
pub struct ExecutionContext {
    pub runner: Arc<OperationRunner>,
    pub cancel: CancellationToken,
    pub observer: Arc<dyn ProgressObserver>,
    pub total: u64,
    pub checkpoint_every: u32,
    done: Arc<AtomicU64>,
}

impl ExecutionContext {
    pub fn new(
        runner: Arc<OperationRunner>,
        cancel: CancellationToken,
        observer: Arc<dyn ProgressObserver>,
        total: u64,
        already_done: u64,
        checkpoint_every: u32,
    ) -> Self {
        Self {
            runner,
            cancel,
            observer,
            total,
            checkpoint_every,
            done: Arc::new(AtomicU64::new(already_done)),
        }
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::SeqCst)
    }

    /// Counts a finished operation and reports every `checkpoint_every`.
    async fn finished(&self, operation_id: &str, batch_index: u32) {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        let every = u64::from(self.checkpoint_every.max(1));
        if done % every == 0 {
            self.report(Some(operation_id.to_string()), batch_index).await;
        }
    }

    async fn report(&self, last_operation_id: Option<String>, batch_index: u32) {
        self.observer
            .observe(ProgressUpdate {
                done: self.done(),
                total: self.total,
                batch_index,
                last_operation_id,
            })
            .await;
    }

    /// Runs one operation, sleeping through scheduled retries until it
    /// reaches a final state or the context is cancelled.
    async fn run_inline(&self, operation_id: &str) -> Result<RunOutcome, SyncError> {
        loop {
            let outcome = self.runner.run(operation_id).await?;
            let RunOutcome::RetryScheduled { at, .. } = &outcome else {
                return Ok(outcome);
            };
            let wait = (*at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(outcome),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// Tally of one execution pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub paused: u64,
    /// Operations left pending with a retry scheduled
    pub deferred: u64,
    pub cancelled: bool,
    /// Set when `stop_on_error` halted the pass early
    pub stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_error: Option<SyncError>,
}

impl ExecutionReport {
    pub fn record(&mut self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Completed(_) | RunOutcome::Finished(OperationStatus::Completed) => {
                self.completed += 1
            }
            RunOutcome::Finished(OperationStatus::Skipped) => self.skipped += 1,
            RunOutcome::Finished(OperationStatus::Paused) => self.paused += 1,
            RunOutcome::Finished(OperationStatus::Failed) => self.failed += 1,
            RunOutcome::Finished(_) | RunOutcome::AlreadyClaimed => {}
            RunOutcome::RetryScheduled { .. } => self.deferred += 1,
            RunOutcome::Failed(err) => {
                self.failed += 1;
                if self.first_error.is_none() {
                    self.first_error = Some(err.clone());
                }
            }
        }
    }

    pub fn has_permanent_failure(&self) -> bool {
        self.first_error.is_some()
    }
}

#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Executes `operations` (already in plan order). Implementations check
    /// `ctx.cancel` before every dispatch and let in-flight calls finish.
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        operations: Vec<OperationRecord>,
    ) -> Result<ExecutionReport, SyncError>;
}

pub fn strategy_for(options: &ExecutionOptions) -> Box<dyn ExecutionStrategy> {
    match options.strategy {
        StrategyKind::Realtime => Box::new(RealtimeStrategy),
        StrategyKind::Batch => Box::new(BatchedStrategy::new(options.batch())),
        StrategyKind::Queue => Box::new(QueuedStrategy::new(options.queue(), options.stop_on_error)),
    }
}

/// Splits plan-ordered operations into runs of equal priority.
pub(crate) fn tier_groups(operations: &[OperationRecord]) -> Vec<&[OperationRecord]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for i in 1..=operations.len() {
        if i == operations.len() || operations[i].priority != operations[start].priority {
            if start < i {
                groups.push(&operations[start..i]);
            }
            start = i;
        }
    }
    groups
}

pub(crate) fn log_summary(strategy: &str, task_id: Uuid, report: &ExecutionReport) {
    info!(
        strategy,
        task_id = %task_id,
        completed = report.completed,
        skipped = report.skipped,
        failed = report.failed,
        paused = report.paused,
        deferred = report.deferred,
        cancelled = report.cancelled,
        stopped = report.stopped,
        "execution pass finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy(jitter: f64) -> RetryPolicyConfig {
        RetryPolicyConfig {
            max_attempts: 5,
            base_ms: 100,
            max_ms: 1_000,
            jitter_factor: jitter,
        }
    }

    fn op(priority: i32, id: &str) -> OperationRecord {
        OperationRecord {
            id: id.into(),
            task_id: Uuid::nil(),
            entity_type: EntityType::User,
            entity_id: id.into(),
            operation_type: OperationType::Create,
            data: json!({}),
            status: OperationStatus::Pending,
            priority,
            sequence: 0,
            queue: "user".into(),
            batch: None,
            attempts: 0,
            next_attempt_at: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(0.0);
        assert_eq!(retry_delay(&p, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(&p, 2), Duration::from_millis(200));
        assert_eq!(retry_delay(&p, 3), Duration::from_millis(400));
        assert_eq!(retry_delay(&p, 10), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_factor() {
        let p = policy(0.5);
        for _ in 0..50 {
            let d = retry_delay(&p, 2).as_millis();
            assert!((200..=300).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn tier_groups_split_on_priority_change() {
        let ops = vec![op(0, "a"), op(0, "b"), op(1, "c"), op(3, "d"), op(3, "e")];
        let groups: Vec<usize> = tier_groups(&ops).iter().map(|g| g.len()).collect();
        assert_eq!(groups, vec![2, 1, 2]);
        assert!(tier_groups(&[]).is_empty());
    }

    #[test]
    fn report_keeps_first_permanent_error() {
        let mut report = ExecutionReport::default();
        report.record(&RunOutcome::Completed(TargetOutcome::applied()));
        report.record(&RunOutcome::Failed(SyncError::target_rejected(true, "first")));
        report.record(&RunOutcome::Failed(SyncError::target_rejected(true, "second")));
        report.record(&RunOutcome::Finished(OperationStatus::Skipped));
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.first_error.unwrap().message, "first");
    }
}
