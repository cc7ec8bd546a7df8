//! The five-stage core middleware chain (§4.C step 2): trace-id
//! injection → request logging → authentication → permission check →
//! handler. Built on `axum::middleware::from_fn_with_state`, the same
//! idiom the teacher uses for its tracing layer in `api/server.rs`.
//!
//! Emits the hook-bus event sequence §5 requires for an extension
//! route: `PreRequest` (request_logging, chain entry) → `PreAuth` →
//! `PostAuth` (both in authenticate) → handler → `PostRequest`
//! (request_logging, on the way back out).

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use cuid2::cuid;
use tokio_util::sync::CancellationToken;

use crate::hooks::{EventType, HookOutcome};
use crate::iam::Claims;

use super::NamespacedRouter;

pub const TRACE_ID_HEADER: &str = "x-trace-id";

fn extension_name_from_path(path: &str) -> Option<&str> {
    let mut segments = path.trim_start_matches('/').splitn(3, '/');
    match (segments.next(), segments.next()) {
        (Some("ext"), Some(name)) if !name.is_empty() => Some(name),
        _ => None,
    }
}

pub async fn trace_id(mut req: Request, next: Next) -> Response {
    let trace_id = cuid();
    req.extensions_mut().insert(TraceId(trace_id.clone()));

    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        resp.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    resp
}

#[derive(Clone)]
pub struct TraceId(pub String);

pub async fn request_logging(
    State(state): State<Arc<NamespacedRouter>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let trace_id = req
        .extensions()
        .get::<TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_default();

    if let Some(extension) = extension_name_from_path(&path) {
        let hooks = state.container().hooks.clone();
        let payload = serde_json::json!({
            "method": method.as_str(),
            "path": path,
        });
        let _ = extension;
        hooks.emit(EventType::PreRequest, payload, CancellationToken::new()).await;
    }

    let started = Instant::now();
    let resp = next.run(req).await;
    let elapsed = started.elapsed();
    let status = resp.status();

    tracing::info!(
        %trace_id,
        %method,
        %path,
        status = status.as_u16(),
        elapsed_ms = elapsed.as_millis() as u64,
        "request completed"
    );

    if let Some(extension) = extension_name_from_path(&path) {
        let payload = serde_json::json!({
            "method": method.as_str(),
            "path": path,
            "status": status.as_u16(),
            "elapsed_ms": elapsed.as_millis() as u64,
        });
        let hooks = state.container().hooks.clone();
        let extension = extension.to_string();
        tokio::spawn(async move {
            hooks
                .emit(EventType::PostRequest, payload, CancellationToken::new())
                .await;
            let _ = extension;
        });
    }

    resp
}

/// Verifies a bearer token if present. A missing or malformed token is
/// *not* rejected here — it yields anonymous claims (no roles) and lets
/// the permission-check stage decide whether the route actually needs
/// one, matching §4.C's "handler is reached only if the subject holds
/// every required permission," not "every request must carry a token."
pub async fn authenticate(
    State(state): State<Arc<NamespacedRouter>>,
    mut req: Request,
    next: Next,
) -> Response {
    let claims = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .and_then(|token| state.container().iam.verify_token(token).ok())
        .unwrap_or(Claims {
            sub: String::new(),
            roles: vec![],
            exp: 0,
        });

    let path = req.uri().path().to_string();
    if let Some(extension) = extension_name_from_path(&path) {
        let hooks = state.container().hooks.clone();
        let payload = serde_json::json!({ "subject": claims.sub });
        let results = hooks
            .emit(EventType::PreAuth, payload.clone(), CancellationToken::new())
            .await;
        for r in results {
            if let Ok(HookOutcome::Veto { reason }) = r.outcome {
                return (
                    StatusCode::UNAUTHORIZED,
                    axum::Json(serde_json::json!({"error": "unauthenticated", "reason": reason})),
                )
                    .into_response();
            }
        }
        hooks.emit(EventType::PostAuth, payload, CancellationToken::new()).await;
        let _ = extension;
    }

    req.extensions_mut().insert(claims);
    next.run(req).await
}

/// Consults IAM against the route-permission table recorded at mount
/// time (§4.C step 3). This has to run *before* `next.run`, not after —
/// the handler must never execute for a subject lacking the required
/// permission — so the lookup goes through `NamespacedRouter`'s own
/// table rather than route-attached request state, which axum only
/// makes visible to code nested inside the matched route.
pub async fn check_permission(
    State(state): State<Arc<NamespacedRouter>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let extension = match extension_name_from_path(&path) {
        Some(name) => name.to_string(),
        None => return next.run(req).await,
    };

    if let Some(required) = state.required_permission(&extension, &method, &path) {
        let claims = req.extensions().get::<Claims>().cloned().unwrap_or(Claims {
            sub: String::new(),
            roles: vec![],
            exp: 0,
        });
        if !state.container().iam.may(&claims, &extension, &required) {
            return (
                StatusCode::FORBIDDEN,
                axum::Json(serde_json::json!({"error": "forbidden"})),
            )
                .into_response();
        }
    }

    next.run(req).await
}
