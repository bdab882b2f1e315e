//! Fixed-size slices; contiguous equal-tier groups inside a slice run
//! concurrently under a semaphore.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{
    ExecutionContext, ExecutionReport, ExecutionStrategy, RunOutcome, log_summary, tier_groups,
};
use crate::config::BatchConfig;
use crate::sync::error::SyncError;
use crate::sync::operation::OperationRecord;

#[derive(Debug, Clone)]
pub struct BatchedStrategy {
    config: BatchConfig,
}

impl BatchedStrategy {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    async fn run_group(
        &self,
        ctx: &ExecutionContext,
        group: &[OperationRecord],
        batch_index: u32,
    ) -> Result<Vec<RunOutcome>, SyncError> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1) as usize));
        let mut joins: JoinSet<Result<Option<RunOutcome>, SyncError>> = JoinSet::new();

        for op in group {
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let id = op.id.clone();
            joins.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| SyncError::cancelled("batch semaphore closed"))?;
                if ctx.cancel.is_cancelled() {
                    return Ok(None);
                }
                let outcome = ctx.run_inline(&id).await?;
                if outcome.is_final() {
                    ctx.finished(&id, batch_index).await;
                }
                Ok(Some(outcome))
            });
        }

        let mut outcomes = Vec::with_capacity(group.len());
        let mut first_error = None;
        while let Some(joined) = joins.join_next().await {
            match joined {
                Ok(Ok(Some(outcome))) => outcomes.push(outcome),
                Ok(Ok(None)) => {}
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    warn!(error = %join_err, "batch worker panicked");
                    first_error.get_or_insert(SyncError::storage(format!("batch worker failed: {join_err}")));
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(outcomes),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for BatchedStrategy {
    fn name(&self) -> &'static str {
        "batch"
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        operations: Vec<OperationRecord>,
    ) -> Result<ExecutionReport, SyncError> {
        let mut report = ExecutionReport::default();
        let size = self.config.size.max(1) as usize;
        let slices: Vec<&[OperationRecord]> = operations.chunks(size).collect();
        let delay = Duration::from_millis(self.config.delay_ms);

        for (index, slice) in slices.iter().enumerate() {
            let batch_index = index as u32;
            if ctx.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            for group in tier_groups(slice) {
                for outcome in self.run_group(ctx, group, batch_index).await? {
                    report.record(&outcome);
                }
            }

            let last = slice.last().map(|op| op.id.clone());
            ctx.report(last, batch_index).await;
            debug!(batch_index, size = slice.len(), "batch finished");

            if self.config.stop_on_error && report.has_permanent_failure() {
                report.stopped = true;
                break;
            }

            let more = index + 1 < slices.len();
            if more && !delay.is_zero() {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        if ctx.cancel.is_cancelled() {
            report.cancelled = true;
        }

        log_summary(self.name(), ctx.runner.task_id(), &report);
        Ok(report)
    }
}
