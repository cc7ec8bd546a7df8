//! WASM Host ABI (§4.F): a sandboxed alternative to an in-process
//! `ExtensionHandle`, for extensions the operator doesn't want running
//! native code. Everything here only ever talks to the rest of the
//! crate through `registry::ExtensionHandle`, so the registry can't
//! tell a WASM-backed extension from a native one.

pub mod engine;
pub mod envelope;
pub mod host_imports;
pub mod session;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use base64::Engine as _;

use crate::container::ExtensionServices;
use crate::db::migration::ModelSpec;
use crate::descriptor::{HealthStatus, HealthStatusKind};
use crate::error::{AbiError, LifecycleError};
use crate::registry::ExtensionHandle;

use envelope::{RequestEnvelope, ResponseEnvelope};
use session::{GuestModule, GuestSession};

/// Wraps one compiled guest module as an `ExtensionHandle`. The guest
/// itself never runs until `initialize`, mirroring the native
/// lifecycle: a `Discovered` WASM extension is just bytes on disk.
///
/// The session lives behind an `Arc` rather than a bare value so
/// `dispatch` (called from an axum handler) can clone it out from under
/// the read lock before awaiting — holding a `std::sync::RwLockReadGuard`
/// across an `.await` would make the router's handler future `!Send`.
pub struct WasmExtensionHandle {
    module_path: PathBuf,
    call_timeout: Duration,
    session: RwLock<Option<Arc<GuestSession>>>,
}

impl WasmExtensionHandle {
    pub fn new(module_path: PathBuf, call_timeout: Duration) -> Self {
        Self {
            module_path,
            call_timeout,
            session: RwLock::new(None),
        }
    }

    async fn with_session(&self, request: RequestEnvelope) -> Result<ResponseEnvelope, LifecycleError> {
        let session = {
            let guard = self.session.read().expect("wasm session lock poisoned");
            guard.clone()
        };
        let session =
            session.ok_or_else(|| LifecycleError::InitializeFailed("guest not instantiated".to_string()))?;
        session
            .call_async(request)
            .await
            .map_err(|e| LifecycleError::InitializeFailed(e.to_string()))
    }

    /// Forwards one inbound HTTP request straight into the guest. This is
    /// what a WASM extension's entire mounted sub-router boils down to
    /// (§4.F "the handler is a single opaque dispatch into the guest") —
    /// there's no per-route dispatch on the host side, just this one
    /// catch-all.
    pub async fn dispatch(&self, req: axum::extract::Request) -> axum::response::Response {
        let session = {
            let guard = self.session.read().expect("wasm session lock poisoned");
            guard.clone()
        };
        match session {
            Some(session) => dispatch_to_guest(session, req).await,
            None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        }
    }

    /// Builds the `axum::Router` the registry mounts at `/ext/<name>` for
    /// this guest once it's started — every method and sub-path funnels
    /// through `dispatch`, since the guest itself decides what it
    /// recognizes.
    pub fn router(self: &Arc<Self>) -> axum::Router {
        let handle = self.clone();
        axum::Router::new().fallback(move |req: axum::extract::Request| {
            let handle = handle.clone();
            async move { handle.dispatch(req).await }
        })
    }
}

#[async_trait]
impl ExtensionHandle for WasmExtensionHandle {
    async fn initialize(&self, services: ExtensionServices) -> Result<Vec<ModelSpec>, LifecycleError> {
        let module = GuestModule::load(&self.module_path)
            .map_err(|e| LifecycleError::InitializeFailed(e.to_string()))?;
        let config = HashMap::new();
        let session = Arc::new(
            GuestSession::instantiate(&module, services.db_pool.clone(), config, self.call_timeout)
                .map_err(|e| LifecycleError::InitializeFailed(e.to_string()))?,
        );

        let request = RequestEnvelope {
            method: "LIFECYCLE".to_string(),
            path: "/initialize".to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        };
        let response: ResponseEnvelope = session
            .call_async(request)
            .await
            .map_err(|e| LifecycleError::InitializeFailed(e.to_string()))?;
        if response.status >= 400 {
            return Err(LifecycleError::InitializeFailed(format!(
                "guest initialize returned status {}",
                response.status
            )));
        }

        *self.session.write().expect("wasm session lock poisoned") = Some(session);
        Ok(vec![])
    }

    async fn start(&self) -> Result<(), LifecycleError> {
        let request = RequestEnvelope {
            method: "LIFECYCLE".to_string(),
            path: "/start".to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        };
        let _: ResponseEnvelope = self.with_session(request).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), LifecycleError> {
        let request = RequestEnvelope {
            method: "LIFECYCLE".to_string(),
            path: "/stop".to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        };
        let _: ResponseEnvelope = self.with_session(request).await?;
        Ok(())
    }

    async fn health(&self) -> HealthStatus {
        let request = RequestEnvelope {
            method: "LIFECYCLE".to_string(),
            path: "/health".to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        };
        let result = self.with_session(request).await;

        match result {
            Ok(response) if response.status < 400 => HealthStatus {
                status: HealthStatusKind::Healthy,
                message: response
                    .decode_body()
                    .ok()
                    .and_then(|b| String::from_utf8(b).ok())
                    .unwrap_or_default(),
                checked_at: std::time::SystemTime::now(),
                checks: vec![],
            },
            Ok(response) => HealthStatus {
                status: HealthStatusKind::Degraded,
                message: format!("guest reported status {}", response.status),
                checked_at: std::time::SystemTime::now(),
                checks: vec![],
            },
            Err(e) => HealthStatus {
                status: HealthStatusKind::Failed,
                message: e.to_string(),
                checked_at: std::time::SystemTime::now(),
                checks: vec![],
            },
        }
    }
}

/// Forwards one inbound HTTP request into the guest's `handle_request`
/// export and rebuilds an `axum::Response` from whatever it returns.
/// Mounted as the WASM extension's whole sub-router (§4.F "the handler
/// is a single opaque dispatch into the guest").
pub async fn dispatch_to_guest(
    session: Arc<GuestSession>,
    req: axum::extract::Request,
) -> axum::response::Response {
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), vec![v.to_str().unwrap_or_default().to_string()]))
        .fold(HashMap::<String, Vec<String>>::new(), |mut acc, (k, v)| {
            acc.entry(k).or_default().extend(v);
            acc
        });

    let body_bytes = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(b) => b.to_vec(),
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let envelope = RequestEnvelope {
        method,
        path,
        headers,
        body: body_bytes,
    };

    let response: Result<ResponseEnvelope, AbiError> = session.call_async(envelope).await;
    match response {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body = resp
                .decode_body()
                .unwrap_or_else(|_| base64::engine::general_purpose::STANDARD.decode("").unwrap_or_default());
            let mut builder = axum::response::Response::builder().status(status);
            for (name, values) in resp.headers {
                for value in values {
                    builder = builder.header(&name, value);
                }
            }
            builder
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(AbiError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
