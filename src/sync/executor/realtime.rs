//! Sequential execution with inline retries.

use async_trait::async_trait;

use super::{ExecutionContext, ExecutionReport, ExecutionStrategy, log_summary};
use crate::sync::error::SyncError;
use crate::sync::operation::OperationRecord;

#[derive(Debug, Clone, Copy, Default)]
pub struct RealtimeStrategy;

#[async_trait]
impl ExecutionStrategy for RealtimeStrategy {
    fn name(&self) -> &'static str {
        "realtime"
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        operations: Vec<OperationRecord>,
    ) -> Result<ExecutionReport, SyncError> {
        let mut report = ExecutionReport::default();
        let mut last = None;

        for op in &operations {
            if ctx.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let outcome = ctx.run_inline(&op.id).await?;
            report.record(&outcome);
            if outcome.is_final() {
                ctx.finished(&op.id, 0).await;
            }
            last = Some(op.id.clone());
        }
        if ctx.cancel.is_cancelled() {
            report.cancelled = true;
        }

        ctx.report(last, 0).await;
        log_summary(self.name(), ctx.runner.task_id(), &report);
        Ok(report)
    }
}
