//! Task lifecycle: full and incremental runs, conflicts, retries and recovery.

#[path = "test_utils/mod.rs"]
mod test_utils;

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use dirsync::adapters::custom::StaticSource;
use dirsync::directory::{DirectoryRecord, EntityType, Membership, Scope, User};
use dirsync::repositories::{
    ConflictRepository, DirectoryRepository, LockRepository, OperationRepository, TaskRepository,
};
use dirsync::sync::checkpoint::{Checkpoint, TaskStep};
use dirsync::sync::conflict::{ConflictResolution, ResolveAction};
use dirsync::sync::lock::lock_key;
use dirsync::sync::notifier::NotificationEvent;
use dirsync::sync::operation::OperationStatus;
use dirsync::sync::task::{SyncRequest, TaskStatus, TaskType};
use dirsync::sync::TaskResult;
use serde_json::{Value, json};
use test_utils::{Harness, harness, load_task, sample_snapshot, test_scope, wait_for_task};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(body: Value) -> SyncRequest {
    serde_json::from_value(body).expect("valid sync request")
}

fn custom_request(collector: &str, options: Value) -> SyncRequest {
    request(json!({
        "source": {"type": "custom", "name": "hr"},
        "target": {"type": "collecting", "name": collector},
        "options": options,
    }))
}

fn register_hr(h: &Harness) -> Arc<StaticSource> {
    let source = Arc::new(StaticSource::new(sample_snapshot()));
    h.manager.registry().register_source("hr", source.clone());
    source
}

async fn run(h: &Harness, scope: &Scope, task_type: TaskType, req: SyncRequest) -> Result<(Uuid, TaskStatus)> {
    let view = h.manager.create_task(scope, task_type, req).await?;
    let status = h.manager.run_task(view.id).await?;
    Ok((view.id, status))
}

async fn result_of(h: &Harness, scope: &Scope, task_id: Uuid) -> Result<TaskResult> {
    let view = load_task(&h.db, scope, task_id).await?;
    let value = view.result.ok_or_else(|| anyhow::anyhow!("task has no result"))?;
    Ok(serde_json::from_value(value)?)
}

#[tokio::test]
async fn full_sync_projects_source_onto_target() -> Result<()> {
    let h = harness().await?;
    register_hr(&h);
    let scope = test_scope();

    let (task_id, status) = run(&h, &scope, TaskType::Full, custom_request("dir", json!({}))).await?;
    assert_eq!(status, TaskStatus::Completed);

    let target = h.manager.registry().collector("dir").expect("named collector kept");
    assert_eq!(target.snapshot().len(), sample_snapshot().len());

    let result = result_of(&h, &scope, task_id).await?;
    assert_eq!(result.operations.total, 7);
    assert_eq!(result.operations.completed, 7);
    assert!(result.warnings.is_empty());

    let view = load_task(&h.db, &scope, task_id).await?;
    assert_eq!(view.progress, 100);
    assert!(view.finished_at.is_some());
    Ok(())
}

#[tokio::test]
async fn repeated_full_sync_plans_nothing() -> Result<()> {
    let h = harness().await?;
    register_hr(&h);
    let scope = test_scope();

    run(&h, &scope, TaskType::Full, custom_request("dir", json!({}))).await?;
    let (second, status) = run(&h, &scope, TaskType::Full, custom_request("dir", json!({}))).await?;

    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(result_of(&h, &scope, second).await?.operations.total, 0);

    // Rerunning a finished task leaves it alone.
    assert_eq!(h.manager.run_task(second).await?, TaskStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn every_execution_strategy_reaches_the_same_target_state() -> Result<()> {
    let mut projections = Vec::new();
    for strategy in ["queue", "batch", "realtime"] {
        let h = harness().await?;
        register_hr(&h);
        let scope = test_scope();

        let options = json!({"strategy": strategy, "batchSize": 2});
        let (_, status) = run(&h, &scope, TaskType::Full, custom_request("dir", options)).await?;
        assert_eq!(status, TaskStatus::Completed, "{strategy}");

        let snapshot = h.manager.registry().collector("dir").unwrap().snapshot();
        let keys: Vec<String> = snapshot
            .organizations
            .keys()
            .chain(snapshot.users.keys())
            .chain(snapshot.memberships.keys())
            .cloned()
            .collect();
        projections.push(keys);
    }
    assert_eq!(projections[0], projections[1]);
    assert_eq!(projections[1], projections[2]);
    Ok(())
}

#[tokio::test]
async fn incremental_sync_applies_only_source_changes() -> Result<()> {
    let h = harness().await?;
    let source = register_hr(&h);
    let scope = test_scope();
    run(&h, &scope, TaskType::Full, custom_request("dir", json!({}))).await?;

    source.upsert(DirectoryRecord::User(User::new("u3", "linus")));
    source.upsert(DirectoryRecord::Membership(Membership::new("m3", "eng", "u3", true)));
    source.remove(EntityType::Membership, "m2");

    let (first, status) =
        run(&h, &scope, TaskType::Incremental, custom_request("dir", json!({}))).await?;
    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(result_of(&h, &scope, first).await?.operations.total, 3);

    let target = h.manager.registry().collector("dir").unwrap().snapshot();
    assert!(target.users.contains_key("u3"));
    assert!(target.memberships.contains_key("m3"));
    assert!(!target.memberships.contains_key("m2"));

    // The stored cursor means nothing is replayed on the next run.
    let (second, status) =
        run(&h, &scope, TaskType::Incremental, custom_request("dir", json!({}))).await?;
    assert_eq!(status, TaskStatus::Completed);
    let result = result_of(&h, &scope, second).await?;
    assert_eq!(result.operations.total, 0);
    assert!(result.next_cursor.is_some());
    Ok(())
}

#[tokio::test]
async fn membership_only_full_sync_resolves_stored_entities() -> Result<()> {
    let h = harness().await?;
    let source = register_hr(&h);
    let scope = test_scope();
    run(&h, &scope, TaskType::Full, custom_request("dir", json!({}))).await?;

    source.upsert(DirectoryRecord::Membership(Membership::new("m3", "eng", "u2", false)));
    let req = request(json!({
        "entityTypes": ["membership"],
        "source": {"type": "custom", "name": "hr"},
        "target": {"type": "collecting", "name": "dir"},
    }));
    let (task_id, status) = run(&h, &scope, TaskType::Full, req).await?;
    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(result_of(&h, &scope, task_id).await?.operations.total, 1);

    let target = h.manager.registry().collector("dir").unwrap().snapshot();
    assert!(target.memberships.contains_key("m3"));
    Ok(())
}

#[tokio::test]
async fn repeated_updates_in_one_fetch_apply_the_latest() -> Result<()> {
    let h = harness().await?;
    let source = register_hr(&h);
    let scope = test_scope();
    run(&h, &scope, TaskType::Full, custom_request("dir", json!({}))).await?;

    for name in ["First", "Second"] {
        let mut user = User::new("u1", "ada");
        user.display_name = name.to_string();
        source.upsert(DirectoryRecord::User(user));
    }
    let (_, status) = run(&h, &scope, TaskType::Incremental, custom_request("dir", json!({}))).await?;
    assert_eq!(status, TaskStatus::Completed);

    let target = h.manager.registry().collector("dir").unwrap().snapshot();
    assert_eq!(target.users["u1"].display_name, "Second");
    let stored = DirectoryRepository::new()
        .load_snapshot(&h.db, &scope, &[EntityType::User])
        .await?;
    assert_eq!(stored.users["u1"].display_name, "Second");
    Ok(())
}

#[tokio::test]
async fn incremental_change_breaking_store_rules_is_rejected() -> Result<()> {
    let h = harness().await?;
    let source = register_hr(&h);
    let scope = test_scope();
    run(&h, &scope, TaskType::Full, custom_request("dir", json!({}))).await?;

    // u1 already holds a primary membership in eng.
    source.upsert(DirectoryRecord::Membership(Membership::new("m9", "ops", "u1", true)));
    let (task_id, status) =
        run(&h, &scope, TaskType::Incremental, custom_request("dir", json!({}))).await?;
    assert_eq!(status, TaskStatus::Failed);
    let view = load_task(&h.db, &scope, task_id).await?;
    assert_eq!(
        view.error.as_ref().and_then(|e| e["type"].as_str()),
        Some("invalid_snapshot")
    );

    let stored = DirectoryRepository::new()
        .load_snapshot(&h.db, &scope, &[EntityType::Membership])
        .await?;
    assert!(!stored.memberships.contains_key("m9"));
    let primaries = stored.memberships.values().filter(|m| m.is_primary && m.user_id == "u1");
    assert_eq!(primaries.count(), 1);
    assert!(OperationRepository::new().for_task(&h.db, task_id, None).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn unavailable_source_fails_the_task() -> Result<()> {
    let h = harness().await?;
    let source = register_hr(&h);
    source.set_unavailable(true);
    let scope = test_scope();

    let (task_id, status) = run(&h, &scope, TaskType::Full, custom_request("dir", json!({}))).await?;

    assert_eq!(status, TaskStatus::Failed);
    let view = load_task(&h.db, &scope, task_id).await?;
    assert_eq!(
        view.error.as_ref().and_then(|e| e["type"].as_str()),
        Some("source_unavailable")
    );
    assert!(h
        .notifier
        .events()
        .iter()
        .any(|e| matches!(e, NotificationEvent::TaskFailed { task_id: id, .. } if *id == task_id)));
    Ok(())
}

#[tokio::test]
async fn failed_source_init_releases_scope_locks() -> Result<()> {
    let h = harness().await?;
    let source = register_hr(&h);
    source.set_unavailable(true);
    let scope = test_scope();

    let (_, status) = run(&h, &scope, TaskType::Full, custom_request("dir", json!({}))).await?;
    assert_eq!(status, TaskStatus::Failed);
    let leases = LockRepository::new();
    for entity_type in EntityType::ALL {
        assert!(leases.find(&h.db, &lock_key(entity_type, &scope)).await?.is_none());
    }

    source.set_unavailable(false);
    let (_, status) = run(&h, &scope, TaskType::Full, custom_request("dir", json!({}))).await?;
    assert_eq!(status, TaskStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn manual_conflict_holds_operation_until_resolved() -> Result<()> {
    let h = harness().await?;
    let source = register_hr(&h);
    let scope = test_scope();
    run(&h, &scope, TaskType::Full, custom_request("dir", json!({}))).await?;

    let target = h.manager.registry().collector("dir").unwrap();
    let mut renamed = User::new("u1", "ada");
    renamed.display_name = "Ada Lovelace".to_string();
    source.upsert(DirectoryRecord::User(renamed));
    target.touch(EntityType::User, "u1", Utc::now() + Duration::hours(1));

    let options = json!({"conflictPolicy": "manual"});
    let (task_id, status) = run(&h, &scope, TaskType::Full, custom_request("dir", options)).await?;
    assert_eq!(status, TaskStatus::Completed);

    let result = result_of(&h, &scope, task_id).await?;
    assert_eq!(result.operations.paused, 1);
    assert_eq!(result.conflicts.pending, 1);
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(target.snapshot().users["u1"].display_name, "ada");

    let conflict_id = h
        .notifier
        .events()
        .into_iter()
        .find_map(|e| match e {
            NotificationEvent::ConflictRecorded { conflict_id, entity_id, .. } if entity_id == "u1" => {
                Some(conflict_id)
            }
            _ => None,
        })
        .expect("conflict notification");

    let resolved = h
        .manager
        .resolve_conflict(&scope, conflict_id, ResolveAction::ApplySource)
        .await?;
    assert_eq!(resolved.resolution, ConflictResolution::SourceApplied.as_str());
    assert!(resolved.resolved_at.is_some());
    assert_eq!(target.snapshot().users["u1"].display_name, "Ada Lovelace");

    let pending = ConflictRepository::new()
        .list(&h.db, &scope, Some(ConflictResolution::Pending), None, 10)
        .await?;
    assert!(pending.is_empty());
    assert_eq!(result_of(&h, &scope, task_id).await?.operations.paused, 0);

    // A second decision on the same conflict is refused.
    assert!(h
        .manager
        .resolve_conflict(&scope, conflict_id, ResolveAction::KeepTarget)
        .await
        .is_err());
    Ok(())
}

#[tokio::test]
async fn target_wins_skips_concurrently_modified_entities() -> Result<()> {
    let h = harness().await?;
    let source = register_hr(&h);
    let scope = test_scope();
    run(&h, &scope, TaskType::Full, custom_request("dir", json!({}))).await?;

    let target = h.manager.registry().collector("dir").unwrap();
    let mut renamed = User::new("u2", "grace");
    renamed.display_name = "Rear Admiral Hopper".to_string();
    source.upsert(DirectoryRecord::User(renamed));
    target.touch(EntityType::User, "u2", Utc::now() + Duration::hours(1));

    let options = json!({"conflictPolicy": "target_wins"});
    let (task_id, _) = run(&h, &scope, TaskType::Full, custom_request("dir", options)).await?;

    let result = result_of(&h, &scope, task_id).await?;
    assert_eq!(result.operations.skipped, 1);
    assert_eq!(result.conflicts.pending, 0);
    assert_eq!(target.snapshot().users["u2"].display_name, "grace");
    Ok(())
}

#[tokio::test]
async fn failed_operation_can_be_retried() -> Result<()> {
    let server = MockServer::start().await;
    for list in ["/organizations", "/users"] {
        Mock::given(method("GET"))
            .and(path(list))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
            .mount(&server)
            .await;
    }
    for item in ["/organizations/root", "/users/u1"] {
        Mock::given(method("GET"))
            .and(path(item))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path("/organizations"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(422).set_body_string("username reserved"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let h = harness().await?;
    let snapshot = dirsync::directory::DirectorySnapshot::from_parts(
        vec![dirsync::directory::Organization::new("root", None, "Acme")],
        vec![User::new("u1", "ada")],
        vec![],
    );
    h.manager
        .registry()
        .register_source("hr", Arc::new(StaticSource::new(snapshot)));
    let scope = test_scope();
    let req = request(json!({
        "entityTypes": ["organization", "user"],
        "source": {"type": "custom", "name": "hr"},
        "target": {"type": "api", "baseUrl": server.uri()},
        "options": {"strategy": "realtime"},
    }));

    let (task_id, status) = run(&h, &scope, TaskType::Full, req).await?;
    assert_eq!(status, TaskStatus::Failed);

    let failed = OperationRepository::new()
        .for_task(&h.db, task_id, Some(OperationStatus::Failed))
        .await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].entity_id, "u1");
    assert!(h
        .notifier
        .events()
        .iter()
        .any(|e| matches!(e, NotificationEvent::OperationFailed { .. })));

    let replayed = h.manager.retry_operation(&scope, task_id, &failed[0].id).await?;
    assert_eq!(replayed.status, OperationStatus::Completed);

    let result = result_of(&h, &scope, task_id).await?;
    assert_eq!(result.operations.failed, 0);
    assert_eq!(result.operations.completed, 2);

    // Completed operations are not replayable.
    assert!(h
        .manager
        .retry_operation(&scope, task_id, &failed[0].id)
        .await
        .is_err());
    Ok(())
}

#[tokio::test]
async fn interrupted_task_with_fresh_checkpoint_resumes() -> Result<()> {
    let h = harness().await?;
    register_hr(&h);
    let scope = test_scope();
    let tasks = TaskRepository::new();

    let view = h
        .manager
        .create_task(&scope, TaskType::Full, custom_request("dir", json!({})))
        .await?;
    tasks
        .transition(&h.db, view.id, &[TaskStatus::Pending], TaskStatus::Running)
        .await?;
    let checkpoint = Checkpoint::at(TaskStep::Fetching);
    tasks
        .save_progress(&h.db, view.id, checkpoint.step.as_str(), 0, Some(checkpoint.to_json()))
        .await?;

    let report = h.manager.recover_interrupted(false).await?;
    assert_eq!(report.resumed, vec![view.id]);
    assert!(report.paused.is_empty());
    assert_eq!(load_task(&h.db, &scope, view.id).await?.status, "pending");

    assert_eq!(h.manager.run_task(view.id).await?, TaskStatus::Completed);
    let target = h.manager.registry().collector("dir").unwrap();
    assert_eq!(target.snapshot().len(), sample_snapshot().len());
    Ok(())
}

#[tokio::test]
async fn interrupted_task_without_checkpoint_is_paused_then_resumable() -> Result<()> {
    let h = harness().await?;
    register_hr(&h);
    let scope = test_scope();

    let view = h
        .manager
        .create_task(&scope, TaskType::Full, custom_request("dir", json!({})))
        .await?;
    TaskRepository::new()
        .transition(&h.db, view.id, &[TaskStatus::Pending], TaskStatus::Running)
        .await?;

    let report = h.manager.recover_interrupted(false).await?;
    assert_eq!(report.paused, vec![view.id]);
    assert!(h
        .notifier
        .events()
        .iter()
        .any(|e| matches!(e, NotificationEvent::TaskPaused { task_id, .. } if *task_id == view.id)));

    h.manager.resume(&scope, view.id).await?;
    let finished = wait_for_task(&h.db, &scope, view.id).await?;
    assert_eq!(finished.status, "completed");
    Ok(())
}

#[tokio::test]
async fn cancelled_pending_task_never_runs() -> Result<()> {
    let h = harness().await?;
    let source = register_hr(&h);
    let scope = test_scope();

    let view = h
        .manager
        .create_task(&scope, TaskType::Full, custom_request("dir", json!({})))
        .await?;
    let cancelled = h.manager.cancel(&scope, view.id).await?;
    assert_eq!(cancelled.status, "paused");

    assert_eq!(h.manager.run_task(view.id).await?, TaskStatus::Paused);
    assert_eq!(source.full_fetches(), 0);
    Ok(())
}

#[tokio::test]
async fn tasks_of_other_scopes_are_not_found() -> Result<()> {
    let h = harness().await?;
    register_hr(&h);
    let owner = test_scope();
    let (task_id, _) = run(&h, &owner, TaskType::Full, custom_request("dir", json!({}))).await?;

    let stranger = test_scope();
    assert!(h.manager.cancel(&stranger, task_id).await.is_err());
    assert!(h.manager.resume(&stranger, task_id).await.is_err());
    Ok(())
}
