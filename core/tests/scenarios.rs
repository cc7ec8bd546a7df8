//! Crate-level coverage for the end-to-end scenarios in spec §8 that
//! aren't already exercised by a narrower unit test elsewhere:
//!
//! - S1 (extension isolation) and S5 (migration idempotence) are
//!   covered directly against `MigrationOrchestrator` in
//!   `db::migration`'s own test module.
//! - S3 (hook ordering, error isolation) is covered directly against
//!   `HookBus` in `hooks`'s own test module.
//! - S2 (permission gate) is covered end to end, including the real
//!   router and IAM stack, by `extensions/notes`'s integration suite.
//! - S6 (lifecycle failure containment) has a `registry`-level unit
//!   test; this file adds the router-facing half — the part S6 actually
//!   promises an operator (`GET /ext/<name>/health`).
//!
//! This file rounds those out with S6 driven through the real HTTP
//! surface, and a registry-level restatement of S1 so the isolation
//! guarantee is also visible from the `ExtensionRegistry` entry point
//! extensions actually go through (not just the orchestrator beneath it).

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use solobase_core::config::HostConfig;
use solobase_core::container::{ExtensionServices, ServiceContainer};
use solobase_core::db;
use solobase_core::db::migration::ModelSpec;
use solobase_core::db::model::ColumnDef;
use solobase_core::descriptor::{
    Documentation, ExtensionDescriptor, ExtensionState, HealthStatus, HealthStatusKind, SemVer,
};
use solobase_core::error::LifecycleError;
use solobase_core::registry::{ExtensionHandle, ExtensionRegistry};
use solobase_core::router::NamespacedRouter;

fn descriptor(name: &str) -> ExtensionDescriptor {
    ExtensionDescriptor {
        name: name.to_string(),
        version: SemVer::new(1, 0, 0),
        min_host_version: SemVer::new(1, 0, 0),
        max_host_version: SemVer::new(2, 0, 0),
        description: String::new(),
        author: String::new(),
        license: String::new(),
        homepage: String::new(),
        tags: vec![],
        required_permissions: vec![],
        config_schema: serde_json::json!({}),
        database_schema: name.to_string(),
        documentation: Documentation::default(),
    }
}

/// An extension declaring one `Item` model, used by two different
/// extension names in the S1 test below.
struct ItemExtension;

#[async_trait]
impl ExtensionHandle for ItemExtension {
    async fn initialize(&self, _services: ExtensionServices) -> Result<Vec<ModelSpec>, LifecycleError> {
        Ok(vec![ModelSpec {
            logical_table: "items",
            columns: Box::leak(Box::new([
                ColumnDef::new("id", solobase_core::db::model::ColumnType::Text).primary_key(),
                ColumnDef::new("title", solobase_core::db::model::ColumnType::Text).not_null(),
            ])),
        }])
    }
    async fn start(&self) -> Result<(), LifecycleError> {
        Ok(())
    }
    async fn stop(&self) -> Result<(), LifecycleError> {
        Ok(())
    }
    async fn health(&self) -> HealthStatus {
        HealthStatus {
            status: HealthStatusKind::Healthy,
            message: "ok".to_string(),
            checked_at: SystemTime::now(),
            checks: vec![],
        }
    }
}

#[tokio::test]
async fn s1_two_extensions_with_the_same_model_never_share_a_table() {
    let pool = db::init_memory_pool().await.unwrap();
    let container = ServiceContainer::new(HostConfig::default(), pool.clone(), b"test-secret");
    let registry = ExtensionRegistry::new(container);

    registry.register(descriptor("alpha"), Arc::new(ItemExtension)).unwrap();
    registry.register(descriptor("beta"), Arc::new(ItemExtension)).unwrap();
    registry.initialize("alpha", None).await.unwrap();
    registry.initialize("beta", None).await.unwrap();

    let names: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 'ext_%_items'")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"ext_alpha_items".to_string()));
    assert!(names.contains(&"ext_beta_items".to_string()));

    // Dropping alpha's physical table must not touch beta's.
    sqlx::query("DROP TABLE ext_alpha_items").execute(&pool).await.unwrap();
    let beta_count: i64 = sqlx::query_scalar("SELECT count(*) FROM ext_beta_items")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(beta_count, 0);
}

struct FailingInitExtension;

#[async_trait]
impl ExtensionHandle for FailingInitExtension {
    async fn initialize(&self, _services: ExtensionServices) -> Result<Vec<ModelSpec>, LifecycleError> {
        Err(LifecycleError::InitializeFailed(
            "simulated migration error".to_string(),
        ))
    }
    async fn start(&self) -> Result<(), LifecycleError> {
        unreachable!("never reaches Start once Initialize fails")
    }
    async fn stop(&self) -> Result<(), LifecycleError> {
        Ok(())
    }
    async fn health(&self) -> HealthStatus {
        unreachable!("never started, never polled")
    }
}

#[tokio::test]
async fn s6_one_extensions_failed_initialize_does_not_affect_another() {
    let pool = db::init_memory_pool().await.unwrap();
    let container = ServiceContainer::new(HostConfig::default(), pool, b"test-secret");
    let registry = ExtensionRegistry::new(container.clone());
    let router = NamespacedRouter::new(registry.clone(), container);

    registry
        .register(descriptor("webhooks"), Arc::new(FailingInitExtension))
        .unwrap();
    registry.register(descriptor("hugo"), Arc::new(ItemExtension)).unwrap();

    assert!(registry.initialize("webhooks", None).await.is_err());
    assert_eq!(registry.state_of("webhooks"), Some(ExtensionState::Failed));

    registry.initialize("hugo", None).await.unwrap();
    registry.start("hugo").await.unwrap();
    router.mount("hugo", axum::Router::new(), vec![]).unwrap();
    router.seal();

    let app = router.build();

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/ext/hugo/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/ext/webhooks/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(status["message"].as_str().unwrap().contains("failed"));
}
