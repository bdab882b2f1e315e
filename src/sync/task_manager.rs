//! # Task Manager
//!
//! Owns the sync task lifecycle: creation, the full and incremental
//! pipelines, cooperative cancellation, resume from checkpoints and recovery
//! of tasks interrupted by a crash.
//!
//! A run claims the task (`pending -> running`), takes the scope locks, then
//! walks fetching, diffing, executing and finalizing, persisting a checkpoint
//! at every step boundary and periodically while executing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{ConnectionTrait, DatabaseConnection, TransactionTrait};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::adapters::source::{ChangeSet, DeletedEntity, SourceAdapter, SyncCursor};
use crate::adapters::{AdapterRegistry, ChangeType, SourceConfig, TargetAdapter, TargetConfig};
use crate::config::{AppConfig, StrategyKind};
use crate::directory::{
    DirectoryRecord, DirectorySnapshot, EntityKey, EntityType, Scope, normalize_entity_types,
    validate_snapshot,
};
use crate::models::{sync_conflict, sync_task};
use crate::repositories::change_record::changes_from_set;
use crate::repositories::{
    ChangeRecordRepository, ConflictRepository, DirectoryRepository, OperationRepository,
    TaskRepository,
};
use crate::sync::checkpoint::{Checkpoint, TaskStep, execution_progress};
use crate::sync::conflict::{
    ConflictCandidate, ConflictDecision, ConflictResolution, ConflictResolver, ConflictSummary,
    ResolveAction, is_conflict,
};
use crate::sync::diff::{DiffEngine, DiffStrategy};
use crate::sync::error::{SyncError, SyncErrorKind};
use crate::sync::executor::{
    ExecutionContext, ExecutionReport, ExecutionStrategy, NoopObserver, OperationRunner,
    ProgressObserver, ProgressUpdate, RealtimeStrategy, RunOutcome, strategy_for,
};
use crate::sync::lock::{LockSettings, ScopeLock};
use crate::sync::notifier::{NotificationEvent, Notifier};
use crate::sync::operation::{OperationRecord, OperationStatus, PlannedOperation};
use crate::sync::task::{
    OperationCounts, SyncOptions, SyncRequest, TaskConfig, TaskStatus, TaskType, TaskView,
};
use crate::telemetry::{TraceContext, with_trace_context};

/// How many recent incremental tasks are inspected for a cursor hand-off.
const CURSOR_LOOKBACK: u64 = 20;
const CONFLICT_LIST_LIMIT: u64 = 10_000;

#[derive(Debug, Error)]
pub enum TaskManagerError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    InvalidState(String),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl From<sea_orm::DbErr> for TaskManagerError {
    fn from(err: sea_orm::DbErr) -> Self {
        TaskManagerError::Sync(err.into())
    }
}

/// Stored in `sync_tasks.result`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub operations: OperationCounts,
    #[serde(default)]
    pub conflicts: ConflictSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_strategy: Option<DiffStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<SyncCursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_watermark: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<SyncError>,
}

/// Changes pushed through `POST /notify/changes`, grouped by entity type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushedEntityChanges {
    #[serde(default)]
    pub created: Vec<Value>,
    #[serde(default)]
    pub updated: Vec<Value>,
    #[serde(default)]
    pub deleted: Vec<DeletedEntity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub changes: BTreeMap<EntityType, PushedEntityChanges>,
    pub target: TargetConfig,
    #[serde(default)]
    pub options: SyncOptions,
}

impl PushRequest {
    /// Parses every pushed payload; any malformed entity rejects the whole push.
    pub fn into_change_set(self) -> Result<(ChangeSet, TargetConfig, SyncOptions), SyncError> {
        let mut set = ChangeSet::default();
        for (entity_type, pushed) in self.changes {
            let mut created = Vec::with_capacity(pushed.created.len());
            for value in pushed.created {
                created.push(DirectoryRecord::from_value(entity_type, value)?);
            }
            let mut updated = Vec::with_capacity(pushed.updated.len());
            for value in pushed.updated {
                updated.push(DirectoryRecord::from_value(entity_type, value)?);
            }
            for record in created.iter().chain(updated.iter()) {
                set.observe(record.source_updated_at());
            }
            for deleted in &pushed.deleted {
                set.observe(deleted.deleted_at);
            }
            let entry = set.entry(entity_type);
            entry.created = created;
            entry.updated = updated;
            entry.deleted = pushed.deleted;
        }
        Ok((set, self.target, self.options))
    }
}

/// Outcome of startup recovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub resumed: Vec<Uuid>,
    pub paused: Vec<Uuid>,
}

/// What a pipeline produced before finalization.
struct PipelineOutcome {
    report: ExecutionReport,
    diff_strategy: Option<DiffStrategy>,
    cursor: Option<SyncCursor>,
    high_watermark: Option<DateTime<Utc>>,
}

/// Per-run state shared by the pipeline steps.
struct TaskRun {
    task_id: Uuid,
    task_type: TaskType,
    scope: Scope,
    config: TaskConfig,
    checkpoint: Option<Checkpoint>,
    cancel: CancellationToken,
    source: Arc<dyn SourceAdapter>,
    target: Arc<dyn TargetAdapter>,
}

impl TaskRun {
    fn resumes_at(&self, step: TaskStep) -> bool {
        self.checkpoint.as_ref().is_some_and(|cp| cp.step >= step)
    }

    fn ensure_active(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::cancelled("task cancellation requested"));
        }
        Ok(())
    }
}

/// Writes executing-step checkpoints and relays cancellation requested by
/// other processes.
struct CheckpointObserver {
    db: DatabaseConnection,
    task_id: Uuid,
    base: Checkpoint,
    cancel: CancellationToken,
}

#[async_trait]
impl ProgressObserver for CheckpointObserver {
    async fn observe(&self, update: ProgressUpdate) {
        let tasks = TaskRepository::new();
        let mut checkpoint = self.base.clone();
        checkpoint.batch_index = update.batch_index;
        checkpoint.last_operation_id = update.last_operation_id.clone().or(checkpoint.last_operation_id);
        checkpoint.operations_total = update.total;
        checkpoint.operations_done = update.done;
        checkpoint.saved_at = Utc::now();

        let progress = execution_progress(update.done, update.total) as i16;
        if let Err(err) = tasks
            .save_progress(&self.db, self.task_id, TaskStep::Executing.as_str(), progress, Some(checkpoint.to_json()))
            .await
        {
            warn!(task_id = %self.task_id, error = %err, "failed to persist checkpoint");
        }
        match tasks.cancel_requested(&self.db, self.task_id).await {
            Ok(true) => self.cancel.cancel(),
            Ok(false) => {}
            Err(err) => warn!(task_id = %self.task_id, error = %err, "failed to read cancel flag"),
        }
    }
}

#[derive(Clone)]
pub struct TaskManager {
    db: DatabaseConnection,
    config: Arc<AppConfig>,
    registry: AdapterRegistry,
    notifier: Arc<dyn Notifier>,
    running: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    tasks: TaskRepository,
    operations: OperationRepository,
    directory: DirectoryRepository,
    changes: ChangeRecordRepository,
    conflicts: ConflictRepository,
}

impl TaskManager {
    pub fn new(
        db: DatabaseConnection,
        config: Arc<AppConfig>,
        registry: AdapterRegistry,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            db,
            config,
            registry,
            notifier,
            running: Arc::new(Mutex::new(HashMap::new())),
            tasks: TaskRepository::new(),
            operations: OperationRepository::new(),
            directory: DirectoryRepository::new(),
            changes: ChangeRecordRepository::new(),
            conflicts: ConflictRepository::new(),
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Persists a `pending` task with its effective options.
    pub async fn create_task(
        &self,
        scope: &Scope,
        task_type: TaskType,
        request: SyncRequest,
    ) -> Result<TaskView, TaskManagerError> {
        let config = TaskConfig::from_request(&self.config, request)?;
        if task_type == TaskType::Full && matches!(config.source, SourceConfig::Push) {
            return Err(SyncError::configuration(
                "push sources cannot serve full snapshots; use an incremental sync",
            )
            .into());
        }
        let config_json = serde_json::to_value(&config)
            .map_err(|err| SyncError::configuration(format!("task config is not serializable: {err}")))?;
        let model = self.tasks.create(&self.db, scope, task_type, config_json).await?;
        Ok(model.into())
    }

    /// Creates the task and starts it in the background.
    pub async fn submit(
        &self,
        scope: &Scope,
        task_type: TaskType,
        request: SyncRequest,
    ) -> Result<TaskView, TaskManagerError> {
        let view = self.create_task(scope, task_type, request).await?;
        self.start(view.id);
        Ok(view)
    }

    /// Spawns `run_task` on the runtime.
    pub fn start(&self, task_id: Uuid) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(with_trace_context(TraceContext::for_task(task_id), async move {
            match manager.run_task(task_id).await {
                Ok(status) => debug!(task_id = %task_id, status = %status, "task run returned"),
                Err(err) => error!(task_id = %task_id, error = %err, "task run aborted"),
            }
        }))
    }

    /// Runs a pending task to a terminal or paused state. Returns the status
    /// the task ended in; a task that is not pending is left alone and its
    /// current status returned.
    pub async fn run_task(&self, task_id: Uuid) -> Result<TaskStatus, TaskManagerError> {
        let Some(task) = self.tasks.find_by_id(&self.db, task_id).await? else {
            return Err(TaskManagerError::NotFound("task"));
        };
        if !self
            .tasks
            .transition(&self.db, task_id, &[TaskStatus::Pending], TaskStatus::Running)
            .await?
        {
            let current = self
                .tasks
                .find_by_id(&self.db, task_id)
                .await?
                .map(|t| t.status)
                .unwrap_or(task.status);
            debug!(task_id = %task_id, status = %current, "task already claimed");
            return Ok(current.parse()?);
        }

        let span = info_span!("sync_task", task_id = %task_id, task_type = %task.task_type);
        async {
            let cancel = CancellationToken::new();
            self.running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(task_id, cancel.clone());

            let status = self.run_claimed(task, cancel).await;

            self.running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&task_id);
            status
        }
        .instrument(span)
        .await
    }

    async fn run_claimed(
        &self,
        task: sync_task::Model,
        cancel: CancellationToken,
    ) -> Result<TaskStatus, TaskManagerError> {
        let task_id = task.id;
        let scope = Scope::new(task.tenant_id, task.project_id);
        let task_type: TaskType = task.task_type.parse()?;

        let prepared = async {
            let config = TaskConfig::from_json(&task.config)?;
            let source = self.registry.build_source(&config.source).await?;
            let target = self.registry.build_target(&config.target, task_id).await?;
            Ok::<_, SyncError>((config, source, target))
        }
        .await;
        let (config, source, target) = match prepared {
            Ok(parts) => parts,
            Err(err) => return self.fail_task(&scope, task_id, task_type, err, None).await,
        };

        let settings = LockSettings::from(&self.config.lock);
        // A lease lost mid-run pauses the task like a cancellation would.
        let lock = match ScopeLock::acquire_for(
            &self.db,
            &scope,
            &config.entity_types,
            &format!("task:{task_id}"),
            &settings,
            cancel.clone(),
        )
        .await
        {
            Ok(lock) => lock,
            Err(err) => return self.fail_task(&scope, task_id, task_type, err, None).await,
        };

        if cancel.is_cancelled() || task.cancel_requested {
            cancel.cancel();
        }
        let run = TaskRun {
            task_id,
            task_type,
            scope,
            checkpoint: task.checkpoint.as_ref().and_then(Checkpoint::from_json),
            config,
            cancel,
            source,
            target,
        };

        if let Err(err) = run.source.init().await {
            if let Err(release_err) = lock.release().await {
                warn!(task_id = %task_id, error = %release_err, "scope lock release failed");
            }
            return self.fail_task(&scope, task_id, task_type, err, None).await;
        }
        let outcome = match task_type {
            TaskType::Full => self.full_pipeline(&run).await,
            TaskType::Incremental => self.incremental_pipeline(&run).await,
        };
        if let Err(err) = run.source.close().await {
            warn!(task_id = %task_id, error = %err, "source close failed");
        }

        let status = self.finalize(&run, outcome).await;
        if lock.is_lost() {
            warn!(task_id = %task_id, "scope lease taken over while running");
        }
        if let Err(err) = lock.release().await {
            warn!(task_id = %task_id, error = %err, "scope lock release failed");
        }
        if matches!(&status, Ok(s) if s.is_terminal()) {
            self.registry.release_task_collector(task_id);
        }
        status
    }

    async fn save_step(&self, run: &TaskRun, checkpoint: &Checkpoint, progress: i16) -> Result<(), SyncError> {
        self.tasks
            .save_progress(
                &self.db,
                run.task_id,
                checkpoint.step.as_str(),
                progress,
                Some(checkpoint.to_json()),
            )
            .await
    }

    async fn full_pipeline(&self, run: &TaskRun) -> Result<PipelineOutcome, SyncError> {
        let types = normalize_entity_types(&run.config.entity_types);
        let mut diff_strategy = None;

        if !run.resumes_at(TaskStep::Executing) {
            run.ensure_active()?;
            self.save_step(run, &Checkpoint::at(TaskStep::Fetching), 0).await?;

            let mut snapshot = run
                .source
                .fetch_full(&run.scope, &types, &run.config.filter)
                .await?;
            snapshot.retain_types(&types);
            self.validate_in_context(&self.db, &run.scope, &snapshot, &types).await?;
            info!(
                task_id = %run.task_id,
                organizations = snapshot.organizations.len(),
                users = snapshot.users.len(),
                memberships = snapshot.memberships.len(),
                "source snapshot fetched"
            );

            let txn = self.db.begin().await?;
            self.directory
                .ingest_snapshot(&txn, &run.scope, &snapshot, &types, Utc::now())
                .await?;
            txn.commit().await?;

            run.ensure_active()?;
            self.save_step(run, &Checkpoint::at(TaskStep::Diffing), 10).await?;

            let local = self.directory.load_snapshot(&self.db, &run.scope, &types).await?;
            let remote = run.target.fetch_current(&run.scope, &types).await?;
            let plan = self.engine().diff(&local, &remote.snapshot, &types).await?;
            diff_strategy = Some(plan.strategy);

            let ids = self
                .operations
                .insert_planned(&self.db, &run.scope, run.task_id, &plan.operations, self.batch_size(run))
                .await?;

            let candidates: Vec<ConflictCandidate> = ids
                .iter()
                .zip(&plan.operations)
                .filter_map(|(id, op)| {
                    let target_at = remote.modified(op.entity_type, &op.entity_id);
                    candidate_for(id, op, &local, target_at, &remote.snapshot)
                })
                .collect();
            self.apply_conflicts(run, candidates).await?;
        }

        let report = self.execute(run, None, None).await?;
        Ok(PipelineOutcome {
            report,
            diff_strategy,
            cursor: None,
            high_watermark: None,
        })
    }

    async fn incremental_pipeline(&self, run: &TaskRun) -> Result<PipelineOutcome, SyncError> {
        let types = normalize_entity_types(&run.config.entity_types);
        let mut diff_strategy = None;

        let (mut cursor, mut watermark) = match &run.checkpoint {
            Some(cp) => (cp.cursor.clone(), checkpoint_watermark(cp)),
            None => self.previous_cursor(&run.scope, run.source.kind()).await?,
        };
        if run.checkpoint.is_none()
            && let Some(since) = run.config.since
        {
            watermark = Some(since);
        }

        if !run.resumes_at(TaskStep::Diffing) {
            run.ensure_active()?;
            let mut fetching = Checkpoint::at(TaskStep::Fetching).with_cursor(cursor.clone());
            fetching.source_state = Some(json!({ "highWatermark": watermark }));
            self.save_step(run, &fetching, 0).await?;

            let set = run
                .source
                .fetch_changes(&run.scope, &types, watermark, cursor.as_ref())
                .await?;
            let captured = changes_from_set(&set, Utc::now());
            self.changes
                .record(&self.db, &run.scope, run.source.kind(), &captured)
                .await?;
            info!(task_id = %run.task_id, changes = captured.len(), "source changes captured");

            if set.next_cursor.is_some() {
                cursor = set.next_cursor.clone();
            }
            watermark = match (watermark, set.high_watermark) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };

            run.ensure_active()?;
            let mut diffing = Checkpoint::at(TaskStep::Diffing).with_cursor(cursor.clone());
            diffing.source_state = Some(json!({ "highWatermark": watermark }));
            self.save_step(run, &diffing, 10).await?;
        }

        if !run.resumes_at(TaskStep::Executing) {
            let txn = self.db.begin().await?;
            let before = self.directory.load_snapshot(&txn, &run.scope, &types).await?;
            let records = self.changes.unprocessed(&txn, &run.scope, &types).await?;
            let (after, touched) = apply_changes(&before, &records)?;
            // Dropping the transaction on error leaves the store and the
            // change records untouched.
            self.validate_in_context(&txn, &run.scope, &after, &types).await?;
            for (entity_type, id) in &touched {
                if let Some(record) = after.get(*entity_type, id) {
                    self.directory.save_record(&txn, &run.scope, &record).await?;
                }
            }

            let plan = self.engine().diff_within(&txn, &after, &before, &types).await?;
            diff_strategy = Some(plan.strategy);
            let ids = self
                .operations
                .insert_planned(&txn, &run.scope, run.task_id, &plan.operations, self.batch_size(run))
                .await?;
            let consumed: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
            self.changes.mark_processed(&txn, &consumed, run.task_id).await?;
            txn.commit().await?;
            debug!(
                task_id = %run.task_id,
                consumed = consumed.len(),
                operations = ids.len(),
                "change records applied"
            );

            let keys: Vec<EntityKey> = plan
                .operations
                .iter()
                .filter(|op| op.operation_type.touches_existing())
                .map(|op| (op.entity_type, op.entity_id.clone()))
                .collect();
            let modified = if keys.is_empty() {
                BTreeMap::new()
            } else {
                run.target.fetch_modified(&run.scope, &keys).await?
            };
            let empty = DirectorySnapshot::default();
            let candidates: Vec<ConflictCandidate> = ids
                .iter()
                .zip(&plan.operations)
                .filter_map(|(id, op)| {
                    let target_at = modified.get(&(op.entity_type, op.entity_id.clone())).copied();
                    candidate_for(id, op, &before, target_at, &empty)
                })
                .collect();
            self.apply_conflicts(run, candidates).await?;
        }

        let source_state = watermark.map(|at| json!({ "highWatermark": at }));
        let report = self.execute(run, cursor.clone(), source_state).await?;
        Ok(PipelineOutcome {
            report,
            diff_strategy,
            cursor,
            high_watermark: watermark,
        })
    }

    /// Validates `snapshot` with the stored rows of every type outside
    /// `types` standing in for the types that were not fetched.
    async fn validate_in_context<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &Scope,
        snapshot: &DirectorySnapshot,
        types: &[EntityType],
    ) -> Result<(), SyncError> {
        let missing: Vec<EntityType> = EntityType::ALL
            .into_iter()
            .filter(|t| !types.contains(t))
            .collect();
        if missing.is_empty() {
            return validate_snapshot(snapshot);
        }
        let stored = self.directory.load_snapshot(conn, scope, &missing).await?;
        validate_snapshot(&snapshot.with_context(&stored, types))
    }

    fn engine(&self) -> DiffEngine {
        DiffEngine::new(self.db.clone(), self.config.sync.diff_join_threshold)
    }

    fn batch_size(&self, run: &TaskRun) -> Option<u32> {
        (run.config.options.strategy == StrategyKind::Batch).then_some(run.config.options.batch_size)
    }

    /// Cursor and watermark of the latest completed incremental task that
    /// used the same source kind.
    async fn previous_cursor(
        &self,
        scope: &Scope,
        source_kind: &str,
    ) -> Result<(Option<SyncCursor>, Option<DateTime<Utc>>), SyncError> {
        let recent = self
            .tasks
            .recent_completed_incremental(&self.db, scope, CURSOR_LOOKBACK)
            .await?;
        for task in recent {
            let Ok(config) = TaskConfig::from_json(&task.config) else {
                continue;
            };
            if config.source.kind() != source_kind {
                continue;
            }
            let result: TaskResult = task
                .result
                .and_then(|value| serde_json::from_value(value).ok())
                .unwrap_or_default();
            return Ok((result.next_cursor, result.high_watermark));
        }
        Ok((None, None))
    }

    async fn apply_conflicts(&self, run: &TaskRun, candidates: Vec<ConflictCandidate>) -> Result<(), SyncError> {
        let resolver = ConflictResolver::new(run.config.options.conflict_policy);
        let policy = resolver.policy();
        for candidate in candidates {
            let decision = resolver.decide(&candidate);
            let changed = match decision {
                ConflictDecision::Apply => true,
                ConflictDecision::Skip => {
                    self.operations
                        .transition(&self.db, &candidate.operation_id, &[OperationStatus::Pending], OperationStatus::Skipped)
                        .await?
                }
                ConflictDecision::Hold => {
                    self.operations
                        .transition(&self.db, &candidate.operation_id, &[OperationStatus::Pending], OperationStatus::Paused)
                        .await?
                }
            };
            if !changed {
                continue;
            }
            let conflict = self
                .conflicts
                .record(&self.db, &run.scope, run.task_id, &candidate, policy.as_str(), decision.resolution())
                .await?;
            counter!("dirsync_conflicts_total", "strategy" => policy.as_str()).increment(1);
            info!(
                task_id = %run.task_id,
                entity_type = %candidate.entity_type,
                entity_id = %candidate.entity_id,
                policy = policy.as_str(),
                resolution = decision.resolution().as_str(),
                "conflict detected"
            );
            if decision == ConflictDecision::Hold {
                self.notifier
                    .notify(NotificationEvent::ConflictRecorded {
                        scope: run.scope,
                        task_id: run.task_id,
                        conflict_id: conflict.id,
                        entity_type: candidate.entity_type.as_str().to_string(),
                        entity_id: candidate.entity_id.clone(),
                    })
                    .await;
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        run: &TaskRun,
        cursor: Option<SyncCursor>,
        source_state: Option<Value>,
    ) -> Result<ExecutionReport, SyncError> {
        let reaped = self.operations.reap_running(&self.db, run.task_id).await?;
        if reaped > 0 {
            info!(task_id = %run.task_id, reaped, "returned stale claims to pending");
        }

        let total = self.operations.count_for_task(&self.db, run.task_id).await?;
        let counts = self.operations.counts(&self.db, run.task_id).await?;
        let done = counts.completed + counts.skipped + counts.failed + counts.paused;

        let mut base = Checkpoint::at(TaskStep::Executing)
            .with_cursor(cursor)
            .with_operations(total, done);
        base.source_state = source_state;
        if let Some(previous) = run.checkpoint.as_ref().filter(|cp| cp.step == TaskStep::Executing) {
            base.batch_index = previous.batch_index;
            base.last_operation_id = previous.last_operation_id.clone();
        }
        self.save_step(run, &base, execution_progress(done, total) as i16).await?;
        run.ensure_active()?;

        let pending: Vec<OperationRecord> = self
            .operations
            .for_task(&self.db, run.task_id, Some(OperationStatus::Pending))
            .await?
            .into_iter()
            .map(OperationRecord::try_from)
            .collect::<Result<_, _>>()?;

        let options = &run.config.options;
        let runner = OperationRunner::new(
            self.db.clone(),
            run.target.clone(),
            self.notifier.clone(),
            run.scope,
            run.task_id,
            options.retry(),
            Duration::from_millis(options.call_timeout_ms),
        );
        let observer = Arc::new(CheckpointObserver {
            db: self.db.clone(),
            task_id: run.task_id,
            base,
            cancel: run.cancel.clone(),
        });
        let ctx = ExecutionContext::new(
            Arc::new(runner),
            run.cancel.clone(),
            observer,
            total,
            done,
            options.checkpoint_every,
        );
        let strategy = strategy_for(options);
        info!(
            task_id = %run.task_id,
            strategy = strategy.name(),
            pending = pending.len(),
            total,
            "executing operations"
        );
        strategy.execute(&ctx, pending).await
    }

    async fn conflict_summary(&self, scope: &Scope, task_id: Uuid) -> Result<ConflictSummary, SyncError> {
        let rows = self
            .conflicts
            .list(&self.db, scope, None, Some(task_id), CONFLICT_LIST_LIMIT)
            .await?;
        let mut summary = ConflictSummary::default();
        for row in rows {
            let decision = match row.resolution.parse::<ConflictResolution>()? {
                ConflictResolution::Pending => ConflictDecision::Hold,
                ConflictResolution::SourceApplied => ConflictDecision::Apply,
                ConflictResolution::TargetKept => ConflictDecision::Skip,
            };
            summary.add(decision);
        }
        Ok(summary)
    }

    async fn finalize(
        &self,
        run: &TaskRun,
        outcome: Result<PipelineOutcome, SyncError>,
    ) -> Result<TaskStatus, TaskManagerError> {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) if err.kind == SyncErrorKind::Cancelled => {
                return self.pause_task(run, None).await;
            }
            Err(err) => {
                return self
                    .fail_task(&run.scope, run.task_id, run.task_type, err, None)
                    .await;
            }
        };

        let counts = self.operations.counts(&self.db, run.task_id).await?;
        let conflicts = self.conflict_summary(&run.scope, run.task_id).await?;
        let mut warnings = Vec::new();
        if conflicts.pending > 0 {
            warnings.push(SyncError::conflict_unresolved(format!(
                "{} conflict(s) await manual resolution",
                conflicts.pending
            )));
        }
        let result = TaskResult {
            operations: counts,
            conflicts,
            strategy: Some(run.config.options.strategy),
            diff_strategy: outcome.diff_strategy,
            next_cursor: outcome.cursor,
            high_watermark: outcome.high_watermark,
            collected: run.target.collected(),
            warnings,
        };
        let result_json = serde_json::to_value(&result).ok();

        if outcome.report.cancelled {
            return self.pause_task(run, result_json).await;
        }

        if counts.failed > 0 {
            let err = outcome.report.first_error.unwrap_or_else(|| {
                SyncError::target_rejected(true, format!("{} operation(s) failed", counts.failed))
            });
            let err = err.with_details(json!({
                "failedOperations": counts.failed,
                "stoppedEarly": outcome.report.stopped,
            }));
            return self
                .fail_task(&run.scope, run.task_id, run.task_type, err, result_json)
                .await;
        }

        let finalizing = Checkpoint::at(TaskStep::Finalizing).with_operations(counts.total, counts.total);
        self.save_step(run, &finalizing, 95).await?;
        self.tasks
            .finish(&self.db, run.task_id, TaskStatus::Completed, result_json, None)
            .await?;
        counter!("dirsync_tasks_total", "type" => run.task_type.as_str(), "status" => "completed").increment(1);
        info!(
            task_id = %run.task_id,
            total = counts.total,
            completed = counts.completed,
            skipped = counts.skipped,
            paused = counts.paused,
            "sync task completed"
        );
        Ok(TaskStatus::Completed)
    }

    async fn pause_task(&self, run: &TaskRun, result: Option<Value>) -> Result<TaskStatus, TaskManagerError> {
        self.tasks
            .finish(&self.db, run.task_id, TaskStatus::Paused, result, None)
            .await?;
        counter!("dirsync_tasks_total", "type" => run.task_type.as_str(), "status" => "paused").increment(1);
        info!(task_id = %run.task_id, "sync task paused");
        Ok(TaskStatus::Paused)
    }

    async fn fail_task(
        &self,
        scope: &Scope,
        task_id: Uuid,
        task_type: TaskType,
        err: SyncError,
        result: Option<Value>,
    ) -> Result<TaskStatus, TaskManagerError> {
        let error_json = serde_json::to_value(&err).ok();
        self.tasks
            .finish(&self.db, task_id, TaskStatus::Failed, result, error_json)
            .await?;
        counter!("dirsync_tasks_total", "type" => task_type.as_str(), "status" => "failed").increment(1);
        error!(task_id = %task_id, error = %err, "sync task failed");
        self.notifier
            .notify(NotificationEvent::TaskFailed {
                scope: *scope,
                task_id,
                error: err,
            })
            .await;
        Ok(TaskStatus::Failed)
    }

    async fn scoped_task(&self, scope: &Scope, task_id: Uuid) -> Result<sync_task::Model, TaskManagerError> {
        self.tasks
            .find_scoped(&self.db, scope, task_id)
            .await?
            .ok_or(TaskManagerError::NotFound("task"))
    }

    /// Requests cooperative cancellation. Pending tasks pause immediately;
    /// running tasks stop dispatching and pause once in-flight calls finish.
    pub async fn cancel(&self, scope: &Scope, task_id: Uuid) -> Result<TaskView, TaskManagerError> {
        let task = self.scoped_task(scope, task_id).await?;
        let status: TaskStatus = task.status.parse()?;
        match status {
            TaskStatus::Pending => {
                if !self
                    .tasks
                    .transition(&self.db, task_id, &[TaskStatus::Pending], TaskStatus::Paused)
                    .await?
                {
                    self.tasks.request_cancel(&self.db, task_id).await?;
                }
            }
            TaskStatus::Running => {
                self.tasks.request_cancel(&self.db, task_id).await?;
                if let Some(token) = self
                    .running
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&task_id)
                {
                    token.cancel();
                }
            }
            TaskStatus::Paused => {}
            TaskStatus::Completed | TaskStatus::Failed => {
                return Err(TaskManagerError::InvalidState(format!(
                    "task {task_id} is already {status}"
                )));
            }
        }
        info!(task_id = %task_id, previous = %status, "task cancellation requested");
        Ok(self.scoped_task(scope, task_id).await?.into())
    }

    /// Moves a paused task back to pending and starts it from its checkpoint.
    pub async fn resume(&self, scope: &Scope, task_id: Uuid) -> Result<TaskView, TaskManagerError> {
        self.scoped_task(scope, task_id).await?;
        if !self
            .tasks
            .transition(&self.db, task_id, &[TaskStatus::Paused], TaskStatus::Pending)
            .await?
        {
            return Err(TaskManagerError::InvalidState(format!(
                "task {task_id} is not paused"
            )));
        }
        info!(task_id = %task_id, "task resumed");
        self.start(task_id);
        Ok(self.scoped_task(scope, task_id).await?.into())
    }

    /// Inspects tasks left `running` by a previous process. Resumable ones go
    /// back to `pending` (and are started when `start` is set); the rest are
    /// paused with a notification.
    pub async fn recover_interrupted(&self, start: bool) -> Result<RecoveryReport, TaskManagerError> {
        let max_age = chrono::Duration::seconds(self.config.recovery.max_checkpoint_age_seconds as i64);
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        for task in self.tasks.with_status(&self.db, TaskStatus::Running).await? {
            let scope = Scope::new(task.tenant_id, task.project_id);
            let persisted = self.operations.count_for_task(&self.db, task.id).await?;
            let checkpoint = task.checkpoint.as_ref().and_then(Checkpoint::from_json);
            let resumable = checkpoint
                .as_ref()
                .is_some_and(|cp| cp.is_resumable(now, max_age, persisted));

            if resumable {
                self.operations.reap_running(&self.db, task.id).await?;
                if self
                    .tasks
                    .transition(&self.db, task.id, &[TaskStatus::Running], TaskStatus::Pending)
                    .await?
                {
                    info!(task_id = %task.id, "interrupted task will resume from checkpoint");
                    report.resumed.push(task.id);
                }
                continue;
            }

            let reason = match &checkpoint {
                None => "no usable checkpoint".to_string(),
                Some(cp) if now - cp.saved_at > max_age => {
                    format!("checkpoint from {} is older than the recovery window", cp.saved_at)
                }
                Some(cp) => format!(
                    "checkpoint expects {} operations but {} are persisted",
                    cp.operations_total, persisted
                ),
            };
            if self
                .tasks
                .transition(&self.db, task.id, &[TaskStatus::Running], TaskStatus::Paused)
                .await?
            {
                warn!(task_id = %task.id, reason = %reason, "interrupted task paused for manual intervention");
                self.notifier
                    .notify(NotificationEvent::TaskPaused {
                        scope,
                        task_id: task.id,
                        reason,
                    })
                    .await;
                report.paused.push(task.id);
            }
        }

        if start {
            for task_id in &report.resumed {
                self.start(*task_id);
            }
        }
        Ok(report)
    }

    /// Resets a failed operation to pending and executes it alone.
    pub async fn retry_operation(
        &self,
        scope: &Scope,
        task_id: Uuid,
        operation_id: &str,
    ) -> Result<OperationRecord, TaskManagerError> {
        let task = self.scoped_task(scope, task_id).await?;
        let status: TaskStatus = task.status.parse()?;
        if status == TaskStatus::Running {
            return Err(TaskManagerError::InvalidState(format!(
                "task {task_id} is running; retry after it stops"
            )));
        }
        let op = self
            .operations
            .find(&self.db, operation_id)
            .await?
            .filter(|op| op.task_id == task_id)
            .ok_or(TaskManagerError::NotFound("operation"))?;
        if op.status != OperationStatus::Failed.as_str() {
            return Err(TaskManagerError::InvalidState(format!(
                "operation {operation_id} is {}; only failed operations can be retried",
                op.status
            )));
        }

        self.operations
            .transition(&self.db, operation_id, &[OperationStatus::Failed], OperationStatus::Pending)
            .await?;
        let outcome = self.run_single(&task, operation_id).await?;
        info!(task_id = %task_id, operation_id, outcome = ?outcome, "operation replayed");
        self.refresh_result(&task).await?;
        self.load_operation(operation_id).await
    }

    /// Applies an operator decision to a pending manual conflict.
    pub async fn resolve_conflict(
        &self,
        scope: &Scope,
        conflict_id: Uuid,
        action: ResolveAction,
    ) -> Result<sync_conflict::Model, TaskManagerError> {
        let conflict = self
            .conflicts
            .find_scoped(&self.db, scope, conflict_id)
            .await?
            .ok_or(TaskManagerError::NotFound("conflict"))?;
        if !self
            .conflicts
            .resolve(&self.db, conflict_id, action.resolution())
            .await?
        {
            return Err(TaskManagerError::InvalidState(format!(
                "conflict {conflict_id} is already resolved"
            )));
        }

        let task = self.scoped_task(scope, conflict.task_id).await?;
        match action {
            ResolveAction::KeepTarget => {
                self.operations
                    .transition(&self.db, &conflict.operation_id, &[OperationStatus::Paused], OperationStatus::Skipped)
                    .await?;
            }
            ResolveAction::ApplySource => {
                if self
                    .operations
                    .transition(&self.db, &conflict.operation_id, &[OperationStatus::Paused], OperationStatus::Pending)
                    .await?
                {
                    let status: TaskStatus = task.status.parse()?;
                    // A task still executing picks the operation up itself.
                    if status != TaskStatus::Running {
                        self.run_single(&task, &conflict.operation_id).await?;
                    }
                }
            }
        }
        self.refresh_result(&task).await?;
        info!(conflict_id = %conflict_id, action = ?action, "conflict resolved");

        self.conflicts
            .find_scoped(&self.db, scope, conflict_id)
            .await?
            .ok_or(TaskManagerError::NotFound("conflict"))
    }

    /// Stores pushed changes for the scope and starts an incremental task
    /// backed by the push source.
    pub async fn push_changes(&self, scope: &Scope, request: PushRequest) -> Result<(TaskView, usize), TaskManagerError> {
        let (set, target, options) = request.into_change_set()?;
        let entity_types: Vec<EntityType> = set.changes.keys().copied().collect();
        let captured = changes_from_set(&set, Utc::now());
        self.changes.record(&self.db, scope, "push", &captured).await?;

        let view = self
            .submit(
                scope,
                TaskType::Incremental,
                SyncRequest {
                    entity_types,
                    source: SourceConfig::Push,
                    target,
                    options,
                    filter: Default::default(),
                    since: None,
                },
            )
            .await?;
        Ok((view, captured.len()))
    }

    async fn run_single(&self, task: &sync_task::Model, operation_id: &str) -> Result<RunOutcome, TaskManagerError> {
        let scope = Scope::new(task.tenant_id, task.project_id);
        let config = TaskConfig::from_json(&task.config)?;
        let target = self.registry.build_target(&config.target, task.id).await?;
        let runner = OperationRunner::new(
            self.db.clone(),
            target,
            self.notifier.clone(),
            scope,
            task.id,
            config.options.retry(),
            Duration::from_millis(config.options.call_timeout_ms),
        );
        let op = self
            .operations
            .find(&self.db, operation_id)
            .await?
            .ok_or(TaskManagerError::NotFound("operation"))?;
        let record = OperationRecord::try_from(op)?;
        let ctx = ExecutionContext::new(
            Arc::new(runner),
            CancellationToken::new(),
            Arc::new(NoopObserver),
            1,
            0,
            config.options.checkpoint_every,
        );
        let report = RealtimeStrategy.execute(&ctx, vec![record]).await?;
        Ok(match report.first_error {
            Some(err) => RunOutcome::Failed(err),
            None => self
                .operations
                .find(&self.db, operation_id)
                .await?
                .and_then(|op| op.status.parse().ok())
                .map(RunOutcome::Finished)
                .unwrap_or(RunOutcome::AlreadyClaimed),
        })
    }

    /// Rewrites the operation counts of a stopped task after a manual replay.
    async fn refresh_result(&self, task: &sync_task::Model) -> Result<(), TaskManagerError> {
        let Some(current) = self.tasks.find_by_id(&self.db, task.id).await? else {
            return Ok(());
        };
        if current.status == TaskStatus::Running.as_str() {
            return Ok(());
        }
        let scope = Scope::new(task.tenant_id, task.project_id);
        let mut result: TaskResult = current
            .result
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();
        result.operations = self.operations.counts(&self.db, task.id).await?;
        result.conflicts = self.conflict_summary(&scope, task.id).await?;
        let status: TaskStatus = current.status.parse()?;
        self.tasks
            .finish(
                &self.db,
                task.id,
                status,
                serde_json::to_value(&result).ok(),
                current.error.clone(),
            )
            .await?;
        Ok(())
    }

    async fn load_operation(&self, operation_id: &str) -> Result<OperationRecord, TaskManagerError> {
        let op = self
            .operations
            .find(&self.db, operation_id)
            .await?
            .ok_or(TaskManagerError::NotFound("operation"))?;
        Ok(OperationRecord::try_from(op)?)
    }
}

fn checkpoint_watermark(checkpoint: &Checkpoint) -> Option<DateTime<Utc>> {
    checkpoint
        .source_state
        .as_ref()
        .and_then(|state| state.get("highWatermark"))
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

/// Conflict candidate for an operation on an entity the target changed
/// after our last sync of it.
fn candidate_for(
    operation_id: &str,
    op: &PlannedOperation,
    local: &DirectorySnapshot,
    target_updated_at: Option<DateTime<Utc>>,
    remote: &DirectorySnapshot,
) -> Option<ConflictCandidate> {
    if !op.operation_type.touches_existing() {
        return None;
    }
    let stored = local.get(op.entity_type, &op.entity_id)?;
    if !is_conflict(stored.last_synced_at(), target_updated_at) {
        return None;
    }
    Some(ConflictCandidate {
        operation_id: operation_id.to_string(),
        entity_type: op.entity_type,
        entity_id: op.entity_id.clone(),
        source_updated_at: stored.source_updated_at(),
        target_updated_at: target_updated_at?,
        last_synced_at: stored.last_synced_at(),
        source_data: Some(op.data.clone()),
        target_data: remote.get(op.entity_type, &op.entity_id).map(|r| r.to_value()),
    })
}

/// Applies unprocessed change records on top of `before`. Returns the new
/// state and the keys that changed.
fn apply_changes(
    before: &DirectorySnapshot,
    records: &[crate::models::incremental_change::Model],
) -> Result<(DirectorySnapshot, BTreeSet<EntityKey>), SyncError> {
    let mut after = before.clone();
    let mut touched = BTreeSet::new();

    for change in records {
        let entity_type: EntityType = change.entity_type.parse()?;
        let change_type: ChangeType = change.change_type.parse()?;
        let existing = after.get(entity_type, &change.entity_id);

        match change_type {
            ChangeType::Deleted => {
                if let Some(mut record) = existing.filter(|r| !r.is_deleted()) {
                    record.mark_deleted(change.changed_at.with_timezone(&Utc));
                    after.insert(record);
                    touched.insert((entity_type, change.entity_id.clone()));
                }
            }
            ChangeType::Created | ChangeType::Updated => {
                let Some(payload) = change.payload.clone() else {
                    return Err(SyncError::source_schema(format!(
                        "change record {} has no payload",
                        change.id
                    ))
                    .with_entity(entity_type.as_str(), change.entity_id.as_str()));
                };
                let mut record = DirectoryRecord::from_value(entity_type, payload)?;
                let last_synced = existing.as_ref().and_then(DirectoryRecord::last_synced_at);
                record.set_sync_state(false, last_synced);
                after.insert(record);
                touched.insert((entity_type, change.entity_id.clone()));
            }
        }
    }
    Ok((after, touched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryEntity, Organization, User};
    use crate::sync::operation::OperationType;
    use chrono::Duration as ChronoDuration;

    fn change_row(
        entity_type: EntityType,
        id: &str,
        change_type: ChangeType,
        payload: Option<Value>,
    ) -> crate::models::incremental_change::Model {
        let now = Utc::now().fixed_offset();
        crate::models::incremental_change::Model {
            id: format!("{id}-{}", change_type.as_str()),
            tenant_id: Uuid::nil(),
            project_id: Uuid::nil(),
            entity_type: entity_type.as_str().to_string(),
            entity_id: id.to_string(),
            change_type: change_type.as_str().to_string(),
            changed_at: now,
            payload,
            source: "custom".into(),
            processed: false,
            processed_at: None,
            task_id: None,
            created_at: now,
        }
    }

    #[test]
    fn changes_apply_over_previous_state() {
        let synced_at = Utc::now() - ChronoDuration::hours(1);
        let mut alice = User::new("u1", "alice");
        alice.set_sync_state(true, Some(synced_at));
        let before = DirectorySnapshot::from_parts(vec![], vec![alice, User::new("u2", "bob")], vec![]);

        let mut renamed = User::new("u1", "alice");
        renamed.display_name = "Alice A.".into();
        let records = vec![
            change_row(EntityType::User, "u1", ChangeType::Updated, Some(serde_json::to_value(&renamed).unwrap())),
            change_row(EntityType::User, "u2", ChangeType::Deleted, None),
            change_row(EntityType::User, "u9", ChangeType::Deleted, None),
        ];

        let (after, touched) = apply_changes(&before, &records).unwrap();
        let u1 = after.users.get("u1").unwrap();
        assert_eq!(u1.display_name, "Alice A.");
        assert!(!u1.synced);
        assert_eq!(u1.last_synced_at, Some(synced_at));
        assert!(after.users.get("u2").unwrap().deleted);
        assert_eq!(touched.len(), 2);
    }

    #[test]
    fn change_without_payload_is_a_schema_error() {
        let records = vec![change_row(EntityType::Organization, "o1", ChangeType::Created, None)];
        let err = apply_changes(&DirectorySnapshot::default(), &records).unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::SourceSchemaError);
    }

    #[test]
    fn only_synced_entities_changed_remotely_become_candidates() {
        let synced_at = Utc::now() - ChronoDuration::hours(2);
        let mut org = Organization::new("o1", None, "Ops");
        org.set_sync_state(true, Some(synced_at));
        let local = DirectorySnapshot::from_parts(vec![org, Organization::new("o2", None, "New")], vec![], vec![]);
        let update = PlannedOperation {
            entity_type: EntityType::Organization,
            entity_id: "o1".into(),
            operation_type: OperationType::Rename,
            priority: 0,
            data: json!({"id": "o1"}),
        };
        let later = Some(Utc::now());

        let candidate = candidate_for("op1", &update, &local, later, &DirectorySnapshot::default()).unwrap();
        assert_eq!(candidate.last_synced_at, Some(synced_at));
        assert!(candidate_for("op1", &update, &local, Some(synced_at - ChronoDuration::minutes(1)), &local).is_none());

        let never_synced = PlannedOperation {
            entity_id: "o2".into(),
            ..update.clone()
        };
        assert!(candidate_for("op2", &never_synced, &local, later, &local).is_none());

        let create = PlannedOperation {
            operation_type: OperationType::Create,
            ..update
        };
        assert!(candidate_for("op3", &create, &local, later, &local).is_none());
    }

    #[test]
    fn pushed_payloads_are_parsed_per_type() {
        let request: PushRequest = serde_json::from_value(json!({
            "changes": {
                "users": {
                    "created": [{"id": "u1", "username": "alice", "displayName": "Alice"}],
                    "deleted": [{"id": "u2"}]
                }
            },
            "target": {"type": "collecting"}
        }))
        .unwrap();
        let (set, _, _) = request.into_change_set().unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.changes[&EntityType::User].created[0].id(), "u1");

        let bad: PushRequest = serde_json::from_value(json!({
            "changes": {"organization": {"created": [{"name": "missing id"}]}},
            "target": {"type": "collecting"}
        }))
        .unwrap();
        assert!(bad.into_change_set().is_err());
    }

    #[test]
    fn task_result_round_trips_cursor() {
        let result = TaskResult {
            next_cursor: Some(SyncCursor::from_json(json!({"user": "abc"}))),
            high_watermark: Some(Utc::now()),
            ..TaskResult::default()
        };
        let back: TaskResult = serde_json::from_value(serde_json::to_value(&result).unwrap()).unwrap();
        assert_eq!(back.next_cursor, result.next_cursor);
        assert!(serde_json::to_value(&result).unwrap().get("warnings").is_none());
    }
}
