//! HTTP surface (§4.A `Router(prefix)`, §4.C). Every path here is the
//! *full* `/ext/notes/...` path, not a sub-path relative to some nested
//! mount point — the host's `NamespacedRouter` forwards the whole
//! request into whatever this extension mounted, unchanged (§4.C step 1).

use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::routing::MethodRouter;
use axum::{Json, Router};
use cuid2::cuid;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use solobase_core::container::ExtensionServices;
use solobase_core::db::model::{physical_table_name, Model};
use solobase_core::hooks::EventType;
use solobase_core::router::RoutePermission;

use crate::error::NotesError;
use crate::model::{Note, NoteRow};

pub const LIST_PATH: &str = "/ext/notes/notes";
pub const ITEM_PATH: &str = "/ext/notes/notes/{id}";

pub fn build(services: ExtensionServices) -> Router {
    Router::new()
        .route(LIST_PATH, list_route())
        .route(ITEM_PATH, item_route())
        .with_state(services)
}

fn list_route() -> MethodRouter<ExtensionServices> {
    axum::routing::get(list).post(create)
}

fn item_route() -> MethodRouter<ExtensionServices> {
    axum::routing::get(get_one).delete(remove)
}

/// Declares which of the routes above need which permission, read by the
/// host's permission-check middleware stage before `list`/`create`/etc.
/// ever run (§4.C step 3) — this extension never checks IAM itself.
pub fn permissions() -> Vec<RoutePermission> {
    vec![
        RoutePermission {
            method: Method::GET,
            path: LIST_PATH.to_string(),
            permission: "notes.read".to_string(),
        },
        RoutePermission {
            method: Method::POST,
            path: LIST_PATH.to_string(),
            permission: "notes.write".to_string(),
        },
        RoutePermission {
            method: Method::GET,
            path: ITEM_PATH.to_string(),
            permission: "notes.read".to_string(),
        },
        RoutePermission {
            method: Method::DELETE,
            path: ITEM_PATH.to_string(),
            permission: "notes.write".to_string(),
        },
    ]
}

fn table(services: &ExtensionServices) -> String {
    physical_table_name(&services.name, Note::table_name())
}

async fn list(State(services): State<ExtensionServices>) -> Result<Json<Vec<NoteRow>>, NotesError> {
    let sql = format!(
        "SELECT id, title, body, created_at FROM \"{}\" ORDER BY created_at DESC LIMIT 100",
        table(&services)
    );
    let rows: Vec<NoteRow> = sqlx::query_as(&sql).fetch_all(&services.db_pool).await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct CreateNoteRequest {
    pub title: String,
    pub body: Option<String>,
}

async fn create(
    State(services): State<ExtensionServices>,
    Json(req): Json<CreateNoteRequest>,
) -> Result<(StatusCode, Json<NoteRow>), NotesError> {
    if req.title.trim().is_empty() {
        return Err(NotesError::EmptyTitle);
    }

    let id = cuid();
    let sql = format!(
        "INSERT INTO \"{}\" (id, title, body, created_at) VALUES (?, ?, ?, datetime('now'))",
        table(&services)
    );
    sqlx::query(&sql)
        .bind(&id)
        .bind(&req.title)
        .bind(&req.body)
        .execute(&services.db_pool)
        .await?;

    let row = fetch_one(&services, &id).await?;

    services
        .hooks
        .emit(
            EventType::PostDbWrite,
            json!({ "extension": "notes", "table": Note::table_name(), "id": id }),
            CancellationToken::new(),
        )
        .await;

    Ok((StatusCode::CREATED, Json(row)))
}

async fn get_one(
    State(services): State<ExtensionServices>,
    Path(id): Path<String>,
) -> Result<Json<NoteRow>, NotesError> {
    let row = fetch_one(&services, &id).await?;
    Ok(Json(row))
}

async fn remove(
    State(services): State<ExtensionServices>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, NotesError> {
    fetch_one(&services, &id).await?;

    let sql = format!("DELETE FROM \"{}\" WHERE id = ?", table(&services));
    sqlx::query(&sql).bind(&id).execute(&services.db_pool).await?;

    services
        .hooks
        .emit(
            EventType::PostDbWrite,
            json!({ "extension": "notes", "table": Note::table_name(), "id": id, "deleted": true }),
            CancellationToken::new(),
        )
        .await;

    Ok(Json(json!({ "deleted": id })))
}

async fn fetch_one(services: &ExtensionServices, id: &str) -> Result<NoteRow, NotesError> {
    let sql = format!(
        "SELECT id, title, body, created_at FROM \"{}\" WHERE id = ?",
        table(services)
    );
    sqlx::query_as(&sql)
        .bind(id)
        .fetch_optional(&services.db_pool)
        .await?
        .ok_or_else(|| NotesError::NotFound(id.to_string()))
}
