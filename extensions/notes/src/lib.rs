//! A small note-taking extension that exercises the full native contract
//! in one place: a descriptor with real permissions and a config schema,
//! an `AutoMigrate`-registered model, a router mounted under its own
//! namespace, and a `PostDbWrite` hook emission on every write. An
//! operator wiring a native extension into their own binary follows this
//! same `ExtensionHandle` + `ServiceContainer::scoped` shape.

mod error;
mod model;
mod routes;

pub use error::NotesError;
pub use model::{Note, NoteRow};
pub use routes::CreateNoteRequest;

use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use axum::Router;

use solobase_core::container::ExtensionServices;
use solobase_core::db::migration::ModelSpec;
use solobase_core::db::model::{physical_table_name, Model};
use solobase_core::descriptor::{
    DocEndpoint, Documentation, ExtensionDescriptor, HealthStatus, HealthStatusKind, PermissionDecl, SemVer,
};
use solobase_core::error::LifecycleError;
use solobase_core::registry::ExtensionHandle;
use solobase_core::router::RoutePermission;

/// The descriptor `main` (or a custom binary) registers this extension
/// under. `name` and `database_schema` are both `"notes"`: this extension
/// doesn't need a URL namespace distinct from its table namespace.
pub fn descriptor() -> ExtensionDescriptor {
    ExtensionDescriptor {
        name: "notes".to_string(),
        version: SemVer::new(1, 0, 0),
        min_host_version: SemVer::new(0, 1, 0),
        max_host_version: SemVer::new(1, 0, 0),
        description: "Minimal note-taking sample extension".to_string(),
        author: "solobase".to_string(),
        license: "MIT".to_string(),
        homepage: String::new(),
        tags: vec!["sample".to_string()],
        required_permissions: vec![
            PermissionDecl {
                name: "notes.read".to_string(),
                description: "List and read notes".to_string(),
                resource: "notes".to_string(),
                actions: std::collections::BTreeSet::from(["read".to_string()]),
            },
            PermissionDecl {
                name: "notes.write".to_string(),
                description: "Create and delete notes".to_string(),
                resource: "notes".to_string(),
                actions: std::collections::BTreeSet::from(["write".to_string()]),
            },
        ],
        config_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "max_body_len": { "type": "integer", "minimum": 0 }
            },
            "additionalProperties": false
        }),
        database_schema: "notes".to_string(),
        documentation: Documentation {
            overview: "Stores short free-form notes, one row per note.".to_string(),
            endpoints: vec![
                DocEndpoint {
                    method: "GET".to_string(),
                    path: routes::LIST_PATH.to_string(),
                    summary: "List the most recent 100 notes".to_string(),
                },
                DocEndpoint {
                    method: "POST".to_string(),
                    path: routes::LIST_PATH.to_string(),
                    summary: "Create a note".to_string(),
                },
                DocEndpoint {
                    method: "GET".to_string(),
                    path: routes::ITEM_PATH.to_string(),
                    summary: "Fetch one note by id".to_string(),
                },
                DocEndpoint {
                    method: "DELETE".to_string(),
                    path: routes::ITEM_PATH.to_string(),
                    summary: "Delete one note by id".to_string(),
                },
            ],
            data_collected: vec!["note title".to_string(), "note body".to_string()],
            examples: vec![r#"curl -XPOST /ext/notes/notes -d '{"title":"hi"}'"#.to_string()],
        },
    }
}

/// The `ExtensionHandle` this crate hands to `ExtensionRegistry::register`.
/// Holds the `ExtensionServices` it's given at `Initialize` so `start`,
/// `health`, and the router built by `router()` all have something to
/// talk to the database with.
pub struct NotesExtensionHandle {
    services: RwLock<Option<ExtensionServices>>,
}

impl NotesExtensionHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            services: RwLock::new(None),
        })
    }

    fn services(&self) -> ExtensionServices {
        self.services
            .read()
            .expect("notes services lock poisoned")
            .clone()
            .expect("router()/health() called before initialize() completed")
    }

    /// The sub-router the host mounts at `/ext/notes` once this extension
    /// is `Started`. Panics if called before `initialize` — the registry
    /// never does that, since `Start` only follows a successful
    /// `Initialize` (§4.B).
    pub fn router(&self) -> Router {
        routes::build(self.services())
    }

    pub fn route_permissions(&self) -> Vec<RoutePermission> {
        routes::permissions()
    }
}

#[async_trait]
impl ExtensionHandle for NotesExtensionHandle {
    async fn initialize(&self, services: ExtensionServices) -> Result<Vec<ModelSpec>, LifecycleError> {
        services.logger().info("initializing notes extension");
        *self.services.write().expect("notes services lock poisoned") = Some(services);
        Ok(vec![ModelSpec {
            logical_table: Note::table_name(),
            columns: Note::columns(),
        }])
    }

    async fn start(&self) -> Result<(), LifecycleError> {
        self.services().logger().info("notes extension started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), LifecycleError> {
        self.services().logger().info("notes extension stopped");
        Ok(())
    }

    async fn health(&self) -> HealthStatus {
        let services = self.services();
        let table = physical_table_name(&services.name, Note::table_name());
        let result: Result<i64, sqlx::Error> = sqlx::query_scalar(&format!("SELECT count(*) FROM \"{table}\""))
            .fetch_one(&services.db_pool)
            .await;

        match result {
            Ok(_) => HealthStatus {
                status: HealthStatusKind::Healthy,
                message: "ok".to_string(),
                checked_at: SystemTime::now(),
                checks: vec![],
            },
            Err(e) => HealthStatus {
                status: HealthStatusKind::Failed,
                message: e.to_string(),
                checked_at: SystemTime::now(),
                checks: vec![],
            },
        }
    }
}
