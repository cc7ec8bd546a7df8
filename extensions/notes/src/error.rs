//! The extension's own error surface. Kept separate from
//! `solobase_core::error` — an extension's handlers only ever need to
//! speak in terms of its own failures, not the host's whole taxonomy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum NotesError {
    #[error("title must not be empty")]
    EmptyTitle,
    #[error("note `{0}` not found")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for NotesError {
    fn into_response(self) -> Response {
        let status = match self {
            NotesError::EmptyTitle => StatusCode::BAD_REQUEST,
            NotesError::NotFound(_) => StatusCode::NOT_FOUND,
            NotesError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, axum::Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
