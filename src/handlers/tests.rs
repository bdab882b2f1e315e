use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use crate::adapters::custom::StaticSource;
use crate::config::AppConfig;
use crate::db::{init_pool, run_migrations};
use crate::directory::{DirectorySnapshot, Membership, Organization, User};
use crate::scope::{PROJECT_HEADER, TENANT_HEADER};
use crate::server::{AppState, create_app};
use crate::sync::notifier::MemoryNotifier;

async fn test_state() -> AppState {
    let config = AppConfig {
        database_url: "sqlite::memory:".to_string(),
        ..AppConfig::default()
    };
    let db = init_pool(&config).await.expect("sqlite pool");
    run_migrations(&db).await.expect("migrations");
    AppState::with_notifier(Arc::new(config), db, Arc::new(MemoryNotifier::new()))
}

struct Scoped {
    tenant: Uuid,
    project: Uuid,
}

impl Scoped {
    fn new() -> Self {
        Self {
            tenant: Uuid::new_v4(),
            project: Uuid::new_v4(),
        }
    }

    fn get(&self, uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(TENANT_HEADER, self.tenant.to_string())
            .header(PROJECT_HEADER, self.project.to_string())
            .body(Body::empty())
            .unwrap()
    }

    fn post(&self, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header(TENANT_HEADER, self.tenant.to_string())
            .header(PROJECT_HEADER, self.project.to_string())
            .body(Body::from(body.to_string()))
            .unwrap()
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn hr_snapshot() -> DirectorySnapshot {
    DirectorySnapshot::from_parts(
        vec![
            Organization::new("root", None, "Acme"),
            Organization::new("eng", Some("root"), "Engineering"),
        ],
        vec![User::new("u1", "ada")],
        vec![Membership::new("m1", "eng", "u1", true)],
    )
}

fn full_sync_body() -> Value {
    json!({
        "source": {"type": "custom", "name": "hr"},
        "target": {"type": "collecting", "name": "dir"},
        "options": {"strategy": "realtime"}
    })
}

async fn wait_terminal(app: &Router, scoped: &Scoped, task_id: &str) -> Value {
    for _ in 0..200 {
        let (status, body) = send(app, scoped.get(&format!("/tasks/{task_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        if matches!(body["status"].as_str(), Some("completed" | "failed" | "paused")) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {task_id} did not finish");
}

#[tokio::test]
async fn healthz_reports_database() {
    let app = create_app(test_state().await);
    let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "ok");
}

#[tokio::test]
async fn scope_headers_are_required() {
    let app = create_app(test_state().await);
    let request = Request::builder().uri("/tasks").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn full_sync_from_push_source_is_rejected() {
    let app = create_app(test_state().await);
    let scoped = Scoped::new();
    let body = json!({
        "source": {"type": "push"},
        "target": {"type": "collecting"}
    });
    let (status, _) = send(&app, scoped.post("/sync/full", body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_body_is_a_validation_error() {
    let app = create_app(test_state().await);
    let scoped = Scoped::new();
    let request = Request::builder()
        .method("POST")
        .uri("/sync/full")
        .header("content-type", "application/json")
        .header(TENANT_HEADER, scoped.tenant.to_string())
        .header(PROJECT_HEADER, scoped.project.to_string())
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn full_sync_runs_to_completion() {
    let state = test_state().await;
    state
        .manager
        .registry()
        .register_source("hr", Arc::new(StaticSource::new(hr_snapshot())));
    let app = create_app(state.clone());
    let scoped = Scoped::new();

    let (status, accepted) = send(&app, scoped.post("/sync/full", full_sync_body())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = accepted["taskId"].as_str().unwrap().to_string();

    let task = wait_terminal(&app, &scoped, &task_id).await;
    assert_eq!(task["status"], "completed");
    assert_eq!(task["progress"], 100);
    assert_eq!(task["type"], "full");

    let (status, ops) = send(&app, scoped.get(&format!("/tasks/{task_id}/operations"))).await;
    assert_eq!(status, StatusCode::OK);
    let ops = ops["operations"].as_array().unwrap();
    assert_eq!(ops.len(), 4);
    assert!(ops.iter().all(|op| op["status"] == "completed"));

    let collector = state.manager.registry().collector("dir").unwrap();
    let remote = collector.snapshot();
    assert_eq!(remote.organizations.len(), 2);
    assert_eq!(remote.users.len(), 1);
    assert_eq!(remote.memberships.len(), 1);
}

#[tokio::test]
async fn tasks_are_invisible_outside_their_scope() {
    let state = test_state().await;
    state
        .manager
        .registry()
        .register_source("hr", Arc::new(StaticSource::new(hr_snapshot())));
    let app = create_app(state);
    let owner = Scoped::new();
    let stranger = Scoped::new();

    let (_, accepted) = send(&app, owner.post("/sync/full", full_sync_body())).await;
    let task_id = accepted["taskId"].as_str().unwrap().to_string();
    wait_terminal(&app, &owner, &task_id).await;

    let (status, _) = send(&app, stranger.get(&format!("/tasks/{task_id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, stranger.get(&format!("/tasks/{task_id}/operations"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn task_listing_paginates_with_cursor() {
    let state = test_state().await;
    let app = create_app(state.clone());
    let scoped = Scoped::new();
    let scope = crate::directory::Scope::new(scoped.tenant, scoped.project);

    for _ in 0..3 {
        let request = serde_json::from_value(json!({
            "source": {"type": "push"},
            "target": {"type": "collecting"}
        }))
        .unwrap();
        state
            .manager
            .create_task(&scope, crate::sync::task::TaskType::Incremental, request)
            .await
            .unwrap();
    }

    let (status, first) = send(&app, scoped.get("/tasks?limit=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["tasks"].as_array().unwrap().len(), 2);
    let cursor = first["nextCursor"].as_str().unwrap().to_string();

    let (status, second) = send(&app, scoped.get(&format!("/tasks?limit=2&cursor={cursor}"))).await;
    assert_eq!(status, StatusCode::OK);
    let rest = second["tasks"].as_array().unwrap();
    assert_eq!(rest.len(), 1);
    assert!(second["nextCursor"].is_null());

    let mut ids: Vec<&str> = first["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .chain(rest.iter())
        .map(|t| t["id"].as_str().unwrap())
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn task_listing_validates_query() {
    let app = create_app(test_state().await);
    let scoped = Scoped::new();

    let (status, _) = send(&app, scoped.get("/tasks?limit=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, scoped.get("/tasks?limit=101")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, scoped.get("/tasks?status=sleeping")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, scoped.get("/tasks?cursor=%24%24%24")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancelling_pending_task_pauses_it() {
    let state = test_state().await;
    let app = create_app(state.clone());
    let scoped = Scoped::new();
    let scope = crate::directory::Scope::new(scoped.tenant, scoped.project);
    let request = serde_json::from_value(json!({
        "source": {"type": "push"},
        "target": {"type": "collecting"}
    }))
    .unwrap();
    let view = state
        .manager
        .create_task(&scope, crate::sync::task::TaskType::Incremental, request)
        .await
        .unwrap();

    let (status, body) = send(&app, scoped.post(&format!("/tasks/{}/cancel", view.id), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "paused");

    let (status, _) = send(&app, scoped.post(&format!("/tasks/{}/cancel", view.id), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn completed_task_cannot_be_cancelled() {
    let state = test_state().await;
    state
        .manager
        .registry()
        .register_source("hr", Arc::new(StaticSource::new(hr_snapshot())));
    let app = create_app(state);
    let scoped = Scoped::new();

    let (_, accepted) = send(&app, scoped.post("/sync/full", full_sync_body())).await;
    let task_id = accepted["taskId"].as_str().unwrap().to_string();
    wait_terminal(&app, &scoped, &task_id).await;

    let (status, body) = send(&app, scoped.post(&format!("/tasks/{task_id}/cancel"), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_STATE");

    let (status, _) = send(&app, scoped.post(&format!("/tasks/{task_id}/resume"), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn conflicts_default_to_empty_pending_list() {
    let app = create_app(test_state().await);
    let scoped = Scoped::new();

    let (status, body) = send(&app, scoped.get("/conflicts")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["conflicts"], json!([]));
}

#[tokio::test]
async fn resolving_unknown_conflict_is_not_found() {
    let app = create_app(test_state().await);
    let scoped = Scoped::new();
    let uri = format!("/conflicts/{}/resolve", Uuid::new_v4());

    let (status, _) = send(&app, scoped.post(&uri, json!({"resolution": "apply_source"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pushed_changes_start_incremental_task() {
    let state = test_state().await;
    let app = create_app(state);
    let scoped = Scoped::new();
    let body = json!({
        "changes": {
            "organization": {
                "created": [{"id": "root", "name": "Acme"}]
            }
        },
        "target": {"type": "collecting", "name": "pushed"}
    });

    let (status, accepted) = send(&app, scoped.post("/notify/changes", body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["accepted"], 1);

    let task_id = accepted["taskId"].as_str().unwrap().to_string();
    let task = wait_terminal(&app, &scoped, &task_id).await;
    assert_eq!(task["type"], "incremental");
    assert_eq!(task["status"], "completed");
}
