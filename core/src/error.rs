//! Error taxonomy (spec §7).
//!
//! Every error that can cross an extension boundary or the WASM ABI is a
//! variant here, not a bare `anyhow::Error` string. `anyhow` is still used
//! for operator-facing startup/IO failures that never reach an end user.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("extension name `{0}` is already registered")]
    DuplicateName(String),
    #[error("url prefix `{0}` is already claimed by another extension")]
    DuplicateUrlPrefix(String),
    #[error("table prefix `{0}` is already claimed by another extension")]
    DuplicateTablePrefix(String),
    #[error("permission `{0}` is already claimed by another extension")]
    DuplicatePermission(String),
    #[error("invalid extension name `{0}`: must match [a-z][a-z0-9_-]{{0,31}}")]
    InvalidName(String),
    #[error("host version {host} is outside extension's supported window [{min}, {max}]")]
    VersionWindow {
        host: String,
        min: String,
        max: String,
    },
    #[error("config failed schema validation: {0}")]
    InvalidConfig(String),
    #[error("missing required capability: {0}")]
    MissingCapability(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("extension `{name}` is in state {state}, expected {expected}")]
    InvalidTransition {
        name: String,
        state: String,
        expected: String,
    },
    #[error("initialize hook failed: {0}")]
    InitializeFailed(String),
    #[error("extension `{name}` requires host version in [{min}, {max}], host is {host}")]
    IncompatibleHostVersion {
        name: String,
        min: String,
        max: String,
        host: String,
    },
    #[error("config failed schema validation: {0}")]
    InvalidConfig(String),
    #[error("start hook failed: {0}")]
    StartFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("extension not started")]
    NotStarted,
    #[error("unknown extension `{0}`")]
    UnknownExtension(String),
    #[error("forbidden")]
    Forbidden,
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("handler error: {0}")]
    Internal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("handler for `{extension}` on `{event:?}` failed: {message}")]
    HandlerFailed {
        extension: String,
        event: String,
        message: String,
    },
    #[error("bus deadline elapsed")]
    DeadlineElapsed,
    #[error("cancelled")]
    Cancelled,
    #[error("request vetoed by `{extension}`: {reason}")]
    Vetoed { extension: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum AbiError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("pointer {ptr}+{len} out of bounds of {memory_len}-byte guest memory")]
    OutOfBounds {
        ptr: u32,
        len: u32,
        memory_len: usize,
    },
    #[error("guest returned zero-length result from required call `{0}`")]
    ZeroLengthReturn(String),
    #[error("guest trapped: {0}")]
    Trap(String),
    #[error("guest call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("missing required guest export `{0}`")]
    MissingExport(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    Abi(#[from] AbiError),
}

/// The only shape an error is ever allowed to take once it reaches an
/// end user: `{code, message}`. Details stay in the trace-id-keyed log line.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl CoreError {
    /// Maps a `CoreError` to its REST status code (spec §6.1) and the body
    /// that is safe to hand back to a caller. This is the single place that
    /// mapping is decided, so it stays exhaustive and easy to audit.
    pub fn into_response_parts(self) -> (StatusCode, ErrorBody) {
        match self {
            CoreError::Registration(e) => (
                StatusCode::CONFLICT,
                ErrorBody {
                    code: "registration_error",
                    message: e.to_string(),
                },
            ),
            CoreError::Lifecycle(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    code: "extension_failed",
                    message: "extension is not available".to_string(),
                },
            ),
            CoreError::Handler(HandlerError::NotStarted) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    code: "not_started",
                    message: "extension not started".to_string(),
                },
            ),
            CoreError::Handler(HandlerError::UnknownExtension(_)) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    code: "not_found",
                    message: "not found".to_string(),
                },
            ),
            CoreError::Handler(HandlerError::Forbidden) => (
                StatusCode::FORBIDDEN,
                ErrorBody {
                    code: "forbidden",
                    message: "forbidden".to_string(),
                },
            ),
            CoreError::Handler(HandlerError::Unauthenticated) => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    code: "unauthenticated",
                    message: "unauthenticated".to_string(),
                },
            ),
            CoreError::Handler(HandlerError::Internal(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    code: "internal_error",
                    message: "internal error".to_string(),
                },
            ),
            CoreError::Hook(HookError::Vetoed { .. }) => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    code: "unauthenticated",
                    message: "request vetoed".to_string(),
                },
            ),
            CoreError::Hook(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    code: "hook_error",
                    message: "internal error".to_string(),
                },
            ),
            CoreError::Abi(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    code: "abi_error",
                    message: "extension fault".to_string(),
                },
            ),
        }
    }
}

/// Lets extension handlers return `Result<_, CoreError>` directly and have
/// axum render the `{code, message}` body itself (§7 "every error that
/// crosses an extension boundary... carries no internal detail").
impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let (status, body) = self.into_response_parts();
        (status, axum::Json(body)).into_response()
    }
}
