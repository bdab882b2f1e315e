//! HTTP source and API target behavior against a mock directory service.

use chrono::{TimeZone, Utc};
use dirsync::adapters::api_target::{ApiTarget, ApiTargetConfig, TargetAuth};
use dirsync::adapters::http_source::{ApiSourceConfig, EntityPaths, HttpSource};
use dirsync::adapters::{SourceAdapter, SourceFilter, SyncErrorKind, TargetAdapter};
use dirsync::directory::{DirectoryRecord, EntityType, Organization, Scope, User};
use dirsync::normalization::FieldMapping;
use dirsync::sync::operation::OperationType;
use reqwest::Client;
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;
use wiremock::matchers::{header, header_exists, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn scope() -> Scope {
    Scope::new(Uuid::new_v4(), Uuid::new_v4())
}

fn source_for(server: &MockServer) -> HttpSource {
    HttpSource::new(
        Client::new(),
        ApiSourceConfig {
            base_url: server.uri(),
            token: Some("src-token".to_string()),
            paths: EntityPaths::default(),
            field_mapping: FieldMapping::default(),
            page_size: 1,
            headers: BTreeMap::new(),
        },
    )
    .expect("valid source config")
}

fn target_for(server: &MockServer, auth: TargetAuth) -> ApiTarget {
    ApiTarget::new(
        Client::new(),
        ApiTargetConfig {
            base_url: server.uri(),
            auth,
            paths: EntityPaths::default(),
            page_size: 100,
        },
    )
    .expect("valid target config")
}

#[tokio::test]
async fn source_pages_through_full_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/organizations"))
        .and(query_param_is_missing("cursor"))
        .and(header("Authorization", "Bearer src-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"id": "root", "name": "Acme"}],
            "nextCursor": "p2"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/organizations"))
        .and(query_param("cursor", "p2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"id": "eng", "name": "Engineering", "parentId": "root"}],
            "nextCursor": null
        })))
        .expect(1)
        .mount(&server)
        .await;

    let snapshot = source_for(&server)
        .fetch_full(&scope(), &[EntityType::Organization], &SourceFilter::default())
        .await
        .expect("full fetch succeeds");

    assert_eq!(snapshot.organizations.len(), 2);
    assert_eq!(
        snapshot.organizations["eng"].parent_id.as_deref(),
        Some("root")
    );
}

#[tokio::test]
async fn source_server_error_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = source_for(&server)
        .fetch_full(&scope(), &[EntityType::User], &SourceFilter::default())
        .await
        .expect_err("503 must fail the fetch");

    assert_eq!(err.kind, SyncErrorKind::SourceUnavailable);
}

#[tokio::test]
async fn source_changes_track_watermark_and_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/changes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "created": [{"id": "u1", "username": "ada", "updatedAt": "2024-05-01T10:00:00Z"}],
            "updated": [],
            "deleted": ["u9", {"id": "u8", "deletedAt": "2024-05-02T08:30:00Z"}],
            "nextCursor": "c1"
        })))
        .mount(&server)
        .await;

    let set = source_for(&server)
        .fetch_changes(&scope(), &[EntityType::User], None, None)
        .await
        .expect("change fetch succeeds");

    let users = &set.changes[&EntityType::User];
    assert_eq!(users.created.len(), 1);
    let deleted: Vec<&str> = users.deleted.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(deleted, vec!["u9", "u8"]);
    assert_eq!(
        set.high_watermark,
        Some(Utc.with_ymd_and_hms(2024, 5, 2, 8, 30, 0).unwrap())
    );
    let cursor = set.next_cursor.expect("cursor returned");
    assert_eq!(cursor.part(EntityType::User), Some(&json!("c1")));
}

#[tokio::test]
async fn target_create_skips_entities_already_present() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/organizations/root"))
        .and(header_exists("X-Tenant-Id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "root", "name": "Acme"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/organizations"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let record = DirectoryRecord::Organization(Organization::new("root", None, "Acme"));
    let outcome = target_for(&server, TargetAuth::None)
        .create(&scope(), &record)
        .await
        .expect("create succeeds");

    assert!(outcome.already_applied);
}

#[tokio::test]
async fn target_create_reports_remote_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/u1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "remote-77"})))
        .expect(1)
        .mount(&server)
        .await;

    let record = DirectoryRecord::User(User::new("u1", "ada"));
    let outcome = target_for(&server, TargetAuth::None)
        .create(&scope(), &record)
        .await
        .expect("create succeeds");

    assert!(!outcome.already_applied);
    assert_eq!(outcome.remote_id.as_deref(), Some("remote-77"));
}

#[tokio::test]
async fn target_validation_failure_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/users/u1"))
        .respond_with(ResponseTemplate::new(422).set_body_string("username taken"))
        .mount(&server)
        .await;

    let record = DirectoryRecord::User(User::new("u1", "ada"));
    let err = target_for(&server, TargetAuth::None)
        .update(&scope(), OperationType::Update, &record)
        .await
        .expect_err("422 must be rejected");

    assert_eq!(err.kind, SyncErrorKind::TargetRejected { permanent: true });
    assert!(err.message.contains("username taken"));
}

#[tokio::test]
async fn target_refreshes_token_after_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "fresh", "expires_in": 3600})),
        )
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/memberships/m1"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/memberships/m1"))
        .and(header("Authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let auth = TargetAuth::ClientCredentials {
        token_url: format!("{}/token", server.uri()),
        client_id: "dirsync".to_string(),
        client_secret: "secret".to_string(),
        scope: None,
    };
    let outcome = target_for(&server, auth)
        .delete(&scope(), EntityType::Membership, "m1")
        .await
        .expect("delete succeeds after refresh");

    assert!(!outcome.already_applied);
}

#[tokio::test]
async fn target_delete_of_missing_entity_is_already_applied() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/users/ghost"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let outcome = target_for(&server, TargetAuth::Bearer { token: "t".to_string() })
        .delete(&scope(), EntityType::User, "ghost")
        .await
        .expect("missing entity counts as deleted");

    assert!(outcome.already_applied);
}

#[tokio::test]
async fn target_fetch_current_reads_modification_times() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"id": "u1", "username": "ada", "displayName": "Ada", "updatedAt": "2024-06-01T12:00:00Z"},
                {"id": "u2", "username": "grace", "displayName": "Grace"}
            ],
            "nextCursor": null
        })))
        .mount(&server)
        .await;

    let state = target_for(&server, TargetAuth::None)
        .fetch_current(&scope(), &[EntityType::User])
        .await
        .expect("fetch succeeds");

    assert_eq!(state.snapshot.users.len(), 2);
    assert_eq!(
        state.modified(EntityType::User, "u1"),
        Some(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
    );
    assert_eq!(state.modified(EntityType::User, "u2"), None);
}
