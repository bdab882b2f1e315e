//! Test utilities for database-backed sync tests.
//!
//! In-memory SQLite with migrations applied, fixture directories and a task
//! manager wired to a collecting target.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dirsync::adapters::AdapterRegistry;
use dirsync::config::AppConfig;
use dirsync::db::{init_pool, run_migrations};
use dirsync::directory::{DirectorySnapshot, Membership, Organization, Scope, User};
use dirsync::repositories::TaskRepository;
use dirsync::sync::notifier::MemoryNotifier;
use dirsync::sync::task::TaskView;
use dirsync::sync::TaskManager;
use rand::Rng;
use rand::rngs::StdRng;
use sea_orm::DatabaseConnection;
use uuid::Uuid;

/// Config pointing at a private in-memory database with fast retries.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        database_url: "sqlite::memory:".to_string(),
        ..AppConfig::default()
    };
    config.retry.base_ms = 1;
    config.retry.max_ms = 5;
    config.lock.acquire_attempts = 1;
    config.queue.poll_interval_ms = 5;
    config.batch.delay_ms = 0;
    config
}

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = init_pool(&test_config()).await?;
    run_migrations(&db).await?;
    Ok(db)
}

pub fn test_scope() -> Scope {
    Scope::new(Uuid::new_v4(), Uuid::new_v4())
}

/// Two-level org tree with one user placed in the child.
pub fn sample_snapshot() -> DirectorySnapshot {
    DirectorySnapshot::from_parts(
        vec![
            Organization::new("root", None, "Acme"),
            Organization::new("eng", Some("root"), "Engineering"),
            Organization::new("ops", Some("root"), "Operations"),
        ],
        vec![User::new("u1", "ada"), User::new("u2", "grace")],
        vec![
            Membership::new("m1", "eng", "u1", true),
            Membership::new("m2", "ops", "u2", true),
        ],
    )
}

/// Random, valid directory: every parent precedes its children and every
/// membership points at existing entities.
pub fn random_snapshot(rng: &mut StdRng, orgs: usize, users: usize) -> DirectorySnapshot {
    let mut organizations = Vec::with_capacity(orgs);
    for i in 0..orgs {
        let parent = if i == 0 || rng.gen_bool(0.1) {
            None
        } else {
            Some(format!("o{}", rng.gen_range(0..i)))
        };
        organizations.push(Organization::new(
            format!("o{i}"),
            parent.as_deref(),
            format!("Org {}", rng.gen_range(0..4)),
        ));
    }

    let mut people = Vec::with_capacity(users);
    let mut memberships = Vec::new();
    for i in 0..users {
        let mut user = User::new(format!("u{i}"), format!("user{i}"));
        if rng.gen_bool(0.5) {
            user.email = Some(format!("user{i}.{}@example.com", rng.gen_range(0..3)));
        }
        people.push(user);
        if orgs > 0 {
            let org = rng.gen_range(0..orgs);
            memberships.push(Membership::new(
                format!("m{i}"),
                &format!("o{org}"),
                &format!("u{i}"),
                true,
            ));
        }
    }

    DirectorySnapshot::from_parts(organizations, people, memberships)
}

pub struct Harness {
    pub db: DatabaseConnection,
    pub manager: TaskManager,
    pub notifier: Arc<MemoryNotifier>,
}

pub async fn harness() -> Result<Harness> {
    harness_with(test_config()).await
}

pub async fn harness_with(config: AppConfig) -> Result<Harness> {
    let db = init_pool(&config).await?;
    run_migrations(&db).await?;
    let notifier = Arc::new(MemoryNotifier::new());
    let registry = AdapterRegistry::new(db.clone(), reqwest::Client::new());
    let manager = TaskManager::new(db.clone(), Arc::new(config), registry, notifier.clone());
    Ok(Harness {
        db,
        manager,
        notifier,
    })
}

pub async fn load_task(db: &DatabaseConnection, scope: &Scope, task_id: Uuid) -> Result<TaskView> {
    let model = TaskRepository::new()
        .find_scoped(db, scope, task_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))?;
    Ok(model.into())
}

/// Polls until the task leaves pending/running.
pub async fn wait_for_task(
    db: &DatabaseConnection,
    scope: &Scope,
    task_id: Uuid,
) -> Result<TaskView> {
    for _ in 0..250 {
        let view = load_task(db, scope, task_id).await?;
        if !matches!(view.status.as_str(), "pending" | "running") {
            return Ok(view);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("task {task_id} did not settle")
}
