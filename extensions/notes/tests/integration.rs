//! Boots the real `ServiceContainer` / `ExtensionRegistry` /
//! `NamespacedRouter` stack with this crate's extension mounted, the
//! shape an operator's own binary would use in place of the default
//! host's WASM-only `main.rs`. Exercises the full request path: router
//! dispatch, permission gate, migration, and hook emission together
//! rather than any one of them in isolation.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use solobase_core::config::HostConfig;
use solobase_core::container::ServiceContainer;
use solobase_core::db;
use solobase_core::registry::ExtensionRegistry;
use solobase_core::router::NamespacedRouter;

use solobase_ext_notes::NotesExtensionHandle;

async fn boot() -> (Arc<NamespacedRouter>, Arc<ExtensionRegistry>, Arc<ServiceContainer>) {
    let pool = db::init_memory_pool().await.unwrap();
    let container = ServiceContainer::new(HostConfig::default(), pool, b"integration-test-secret");
    let registry = ExtensionRegistry::new(container.clone());
    let router = NamespacedRouter::new(registry.clone(), container.clone());

    let handle = NotesExtensionHandle::new();
    registry
        .register(solobase_ext_notes::descriptor(), handle.clone())
        .unwrap();
    registry.initialize("notes", None).await.unwrap();
    registry.start("notes").await.unwrap();
    router
        .mount("notes", handle.router(), handle.route_permissions())
        .unwrap();
    router.seal();

    (router, registry, container)
}

fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

#[tokio::test]
async fn anonymous_write_is_forbidden_but_health_is_public() {
    let (router, _registry, _container) = boot().await;
    let app = router.build();

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/ext/notes/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/ext/notes/notes")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"title":"hi"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn granted_subject_can_create_and_read_notes() {
    let (router, _registry, container) = boot().await;
    container.iam.grant_role("notes", "notes.write", "editor");
    container.iam.grant_role("notes", "notes.read", "editor");
    let token = container
        .iam
        .issue_token("alice", vec!["editor".to_string()], 3600)
        .unwrap();
    let app = router.build();

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/ext/notes/notes")
                .header("content-type", "application/json")
                .header("authorization", bearer(&token))
                .body(Body::from(r#"{"title":"hello","body":"world"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let created: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["title"], "hello");

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/ext/notes/notes/{id}"))
                .header("authorization", bearer(&token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/ext/notes/notes")
                .header("authorization", bearer(&token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let list: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(list.len(), 1);
}

#[tokio::test]
async fn empty_title_is_rejected() {
    let (router, _registry, container) = boot().await;
    container.iam.grant_role("notes", "notes.write", "editor");
    let token = container
        .iam
        .issue_token("alice", vec!["editor".to_string()], 3600)
        .unwrap();
    let app = router.build();

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/ext/notes/notes")
                .header("content-type", "application/json")
                .header("authorization", bearer(&token))
                .body(Body::from(r#"{"title":""}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn ext_docs_exposes_declared_documentation() {
    let (router, _registry, _container) = boot().await;
    let app = router.build();

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/ext/notes/docs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(!doc["endpoints"].as_array().unwrap().is_empty());
}
