//! Per-tier consumer pools over the persisted operation table.
//!
//! Each tier gets an organization pool and a user pool with separate
//! concurrency. Workers claim ready operations (`next_attempt_at <= now`)
//! until the tier has no pending or running work left in their queue. A
//! failed attempt is redelivered after its backoff instead of retried inline.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{ExecutionContext, ExecutionReport, ExecutionStrategy, RunOutcome, log_summary};
use crate::config::QueueConfig;
use crate::repositories::OperationRepository;
use crate::sync::error::SyncError;
use crate::sync::operation::OperationRecord;

const ORGANIZATION_QUEUE: &str = "organization";
const USER_QUEUE: &str = "user";

#[derive(Debug, Clone)]
pub struct QueuedStrategy {
    config: QueueConfig,
    stop_on_error: bool,
}

impl QueuedStrategy {
    pub fn new(config: QueueConfig, stop_on_error: bool) -> Self {
        Self {
            config,
            stop_on_error,
        }
    }
}

async fn consume(
    ctx: ExecutionContext,
    priority: i32,
    queue: &'static str,
    poll_interval: Duration,
    batch_index: u32,
) -> Result<Vec<RunOutcome>, SyncError> {
    let repo = OperationRepository::new();
    let db = ctx.runner.db().clone();
    let task_id = ctx.runner.task_id();
    let mut outcomes = Vec::new();

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        match repo.next_ready(&db, task_id, priority, queue, Utc::now()).await? {
            Some(model) => {
                let outcome = ctx.runner.run(&model.id).await?;
                if outcome.is_final() {
                    ctx.finished(&model.id, batch_index).await;
                }
                if !matches!(outcome, RunOutcome::AlreadyClaimed | RunOutcome::RetryScheduled { .. }) {
                    outcomes.push(outcome);
                }
            }
            None => {
                if repo.unfinished(&db, task_id, priority, queue).await? == 0 {
                    break;
                }
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }
    Ok(outcomes)
}

#[async_trait]
impl ExecutionStrategy for QueuedStrategy {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        operations: Vec<OperationRecord>,
    ) -> Result<ExecutionReport, SyncError> {
        let mut report = ExecutionReport::default();
        let tiers: BTreeSet<i32> = operations.iter().map(|op| op.priority).collect();
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));

        for (index, priority) in tiers.into_iter().enumerate() {
            let batch_index = index as u32;
            if ctx.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let mut workers: JoinSet<Result<Vec<RunOutcome>, SyncError>> = JoinSet::new();
            let pools = [
                (ORGANIZATION_QUEUE, self.config.org_concurrency),
                (USER_QUEUE, self.config.user_concurrency),
            ];
            for (queue, concurrency) in pools {
                for _ in 0..concurrency.max(1) {
                    workers.spawn(consume(ctx.clone(), priority, queue, poll_interval, batch_index));
                }
            }

            let mut first_error = None;
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(Ok(outcomes)) => outcomes.iter().for_each(|o| report.record(o)),
                    Ok(Err(err)) => {
                        first_error.get_or_insert(err);
                    }
                    Err(join_err) => {
                        warn!(error = %join_err, "queue worker panicked");
                        first_error.get_or_insert(SyncError::storage(format!("queue worker failed: {join_err}")));
                    }
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }

            ctx.report(None, batch_index).await;
            debug!(priority, "tier drained");

            if self.stop_on_error && report.has_permanent_failure() {
                report.stopped = true;
                break;
            }
        }
        if ctx.cancel.is_cancelled() {
            report.cancelled = true;
        }

        log_summary(self.name(), ctx.runner.task_id(), &report);
        Ok(report)
    }
}
