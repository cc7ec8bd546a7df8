//! Namespaced Router (§4.C). Replaces the teacher's GraphQL federation
//! stack — this host's extension surface is REST, not a composed
//! supergraph — but keeps the teacher's shape of "one `RouterState`
//! built from whatever extensions are currently registered" and its
//! `axum` + `tower-http` base.

pub mod middleware;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tower::ServiceExt;

use crate::container::ServiceContainer;
use crate::error::HandlerError;
use crate::registry::ExtensionRegistry;

/// One route's declared permission requirement, recorded at mount time
/// so the permission-check middleware stage can consult it *before*
/// the handler runs, rather than after — axum only makes a matched
/// route's own layers visible to code nested inside it, so the
/// requirement has to be looked up out of band by the outer middleware
/// instead of riding in as a request extension.
#[derive(Clone)]
pub struct RoutePermission {
    pub method: axum::http::Method,
    pub path: String,
    pub permission: String,
}

/// Holds one `axum::Router` per extension, mounted by name, plus that
/// extension's declared route permissions. Registration is
/// additive-only and closes for good once `seal()` is called — after
/// the registry has started every extension, no further `/ext/<name>`
/// mount may be added (§4.C "routing is additive only... the router is
/// sealed").
pub struct NamespacedRouter {
    extensions: std::sync::RwLock<HashMap<String, Router>>,
    permissions: std::sync::RwLock<HashMap<String, Vec<RoutePermission>>>,
    sealed: AtomicBool,
    registry: Arc<ExtensionRegistry>,
    container: Arc<ServiceContainer>,
}

impl NamespacedRouter {
    pub fn new(registry: Arc<ExtensionRegistry>, container: Arc<ServiceContainer>) -> Arc<Self> {
        Arc::new(Self {
            extensions: std::sync::RwLock::new(HashMap::new()),
            permissions: std::sync::RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
            registry,
            container,
        })
    }

    /// Mounts `router` at `/ext/<name>`, with `permissions` naming which
    /// of its routes require which permission. Called once, from
    /// `Initialize`, with whatever routes the extension declares.
    pub fn mount(
        &self,
        name: &str,
        router: Router,
        permissions: Vec<RoutePermission>,
    ) -> Result<(), HandlerError> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(HandlerError::Internal(format!(
                "router is sealed; cannot mount `{name}` after Start"
            )));
        }
        let mut extensions = self.extensions.write().expect("router lock poisoned");
        extensions.insert(name.to_string(), router);
        let paths: Vec<String> = permissions.iter().map(|p| format!("{} {}", p.method, p.path)).collect();
        let mut perms = self.permissions.write().expect("router lock poisoned");
        perms.insert(name.to_string(), permissions);
        drop(perms);
        self.registry.record_routes(name, paths);
        Ok(())
    }

    /// Looks up the permission (if any) required for `method path` under
    /// `extension`'s mounted namespace. `p.path` may be a literal path or
    /// an axum-style template (`/ext/notes/notes/{id}`); a `{segment}` in
    /// the declared path matches any single path segment in the request.
    pub fn required_permission(&self, extension: &str, method: &axum::http::Method, path: &str) -> Option<String> {
        let perms = self.permissions.read().expect("router lock poisoned");
        perms.get(extension)?.iter().find_map(|p| {
            if &p.method == method && path_matches_template(&p.path, path) {
                Some(p.permission.clone())
            } else {
                None
            }
        })
    }

    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    /// Builds the top-level `axum::Router`: `/health` and `/ext/<name>`
    /// plus core middleware chain wrapping the whole thing (trace-id →
    /// logging → auth → permission check, handler last).
    pub fn build(self: &Arc<Self>) -> Router {
        let state = self.clone();
        Router::new()
            .route("/health", axum::routing::get(health_root))
            .route(
                "/admin/extensions",
                axum::routing::get(admin_list_extensions).with_state(self.clone()),
            )
            .route(
                "/admin/extensions/{name}/config",
                axum::routing::get(admin_get_config)
                    .post(admin_apply_config)
                    .with_state(self.clone()),
            )
            .route(
                "/ext/{name}/health",
                axum::routing::get(ext_health).with_state(self.clone()),
            )
            .route(
                "/ext/{name}/docs",
                axum::routing::get(ext_docs).with_state(self.clone()),
            )
            .fallback(move |req: Request<Body>| {
                let state = state.clone();
                async move { state.dispatch(req).await }
            })
            .layer(axum::middleware::from_fn_with_state(
                self.clone(),
                middleware::trace_id,
            ))
            .layer(axum::middleware::from_fn_with_state(
                self.clone(),
                middleware::request_logging,
            ))
            .layer(axum::middleware::from_fn_with_state(
                self.clone(),
                middleware::authenticate,
            ))
            .layer(axum::middleware::from_fn_with_state(
                self.clone(),
                middleware::check_permission,
            ))
            .layer(
                tower_http::cors::CorsLayer::new()
                    .allow_origin(tower_http::cors::Any)
                    .allow_headers(tower_http::cors::Any)
                    .allow_methods(tower_http::cors::Any),
            )
    }

    /// Parses `/ext/<name>/...`, looks up `<name>`'s mounted router, and
    /// forwards the request to it. An unknown extension or one that
    /// isn't `Started` never panics into a 500 — it's 404 or 503 by
    /// contract (§4.C step 1, §8 property 1).
    async fn dispatch(self: Arc<Self>, req: Request<Body>) -> Response {
        let path = req.uri().path().to_string();
        let mut segments = path.trim_start_matches('/').splitn(3, '/');
        let ext_marker = segments.next();
        let name = segments.next();

        let name = match (ext_marker, name) {
            (Some("ext"), Some(name)) if !name.is_empty() => name,
            _ => return not_found(),
        };

        match self.registry.state_of(name) {
            None => not_found(),
            Some(crate::descriptor::ExtensionState::Started) => {
                let router = {
                    let extensions = self.extensions.read().expect("router lock poisoned");
                    extensions.get(name).cloned()
                };
                match router {
                    Some(router) => router.oneshot(req).await.unwrap_or_else(|_| not_found()),
                    None => not_found(),
                }
            }
            Some(_) => (StatusCode::SERVICE_UNAVAILABLE, "extension not started").into_response(),
        }
    }

    pub fn container(&self) -> &Arc<ServiceContainer> {
        &self.container
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

fn path_matches_template(template: &str, path: &str) -> bool {
    let mut t = template.trim_start_matches('/').split('/');
    let mut p = path.trim_start_matches('/').split('/');
    loop {
        match (t.next(), p.next()) {
            (None, None) => return true,
            (Some(ts), Some(ps)) => {
                let is_param = ts.starts_with('{') && ts.ends_with('}');
                if !is_param && ts != ps {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

async fn health_root() -> &'static str {
    "ok"
}

/// `GET /ext/<name>/health` (§6.1). Extensions never mount this route
/// themselves — it reads straight from the registry's memoized health
/// check, so 404 means "no such extension" and 503 covers both a
/// stopped/failed extension and a degraded one (§8 property 1, S6).
async fn ext_health(
    axum::extract::State(state): axum::extract::State<Arc<NamespacedRouter>>,
    axum::extract::Path(name): axum::extract::Path<String>,
) -> Response {
    use crate::descriptor::HealthStatusKind;

    match state.registry.health(&name).await {
        Ok(status) => {
            let code = match status.status {
                HealthStatusKind::Healthy | HealthStatusKind::Degraded => StatusCode::OK,
                HealthStatusKind::Stopped | HealthStatusKind::Failed => StatusCode::SERVICE_UNAVAILABLE,
            };
            (code, axum::Json(status)).into_response()
        }
        Err(_) => not_found(),
    }
}

/// `GET /ext/<name>/docs` (§6.1): the extension's declared `Documentation`
/// block, verbatim — this router never generates or edits it.
async fn ext_docs(
    axum::extract::State(state): axum::extract::State<Arc<NamespacedRouter>>,
    axum::extract::Path(name): axum::extract::Path<String>,
) -> Response {
    let doc = state
        .registry
        .list()
        .into_iter()
        .find(|(d, _)| d.name == name)
        .map(|(d, _)| d.documentation);
    match doc {
        Some(doc) => axum::Json(doc).into_response(),
        None => not_found(),
    }
}

/// Summary row for `GET /admin/extensions` — what `solobase-ctl list`
/// renders, and intentionally narrower than the full `ExtensionDescriptor`
/// (no `config_schema` JSON Schema document, no documentation block).
#[derive(serde::Serialize)]
struct ExtensionSummary {
    name: String,
    version: String,
    state: crate::descriptor::ExtensionState,
    url_prefix: String,
    table_prefix: String,
}

fn require_admin(req: &Request<Body>) -> Result<(), Response> {
    use crate::iam::{Claims, ADMIN_ROLE};
    let claims = req.extensions().get::<Claims>();
    let is_admin = claims.is_some_and(|c| c.roles.iter().any(|r| r == ADMIN_ROLE));
    if is_admin {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            axum::Json(serde_json::json!({"error": "forbidden"})),
        )
            .into_response())
    }
}

/// `GET /admin/extensions` (§4.B `List`): every registered extension's
/// descriptor summary plus current lifecycle state, the data
/// `solobase-ctl list` renders as a table. Admin-role gated directly
/// here rather than through the route-permission table, since this
/// endpoint isn't namespaced under any one extension's `/ext/<name>`
/// prefix.
async fn admin_list_extensions(
    axum::extract::State(state): axum::extract::State<Arc<NamespacedRouter>>,
    req: Request<Body>,
) -> Response {
    if let Err(resp) = require_admin(&req) {
        return resp;
    }
    let summaries: Vec<ExtensionSummary> = state
        .registry
        .list()
        .into_iter()
        .map(|(d, state)| ExtensionSummary {
            name: d.name.clone(),
            version: d.version.to_string(),
            state,
            url_prefix: d.url_prefix(),
            table_prefix: d.table_prefix(),
        })
        .collect();
    axum::Json(summaries).into_response()
}

/// `GET /admin/extensions/<name>/config` — the extension's last
/// successfully applied, schema-validated configuration (§3.2
/// `config_current`), or `null` if none has ever been applied.
async fn admin_get_config(
    axum::extract::State(state): axum::extract::State<Arc<NamespacedRouter>>,
    axum::extract::Path(name): axum::extract::Path<String>,
    req: Request<Body>,
) -> Response {
    if let Err(resp) = require_admin(&req) {
        return resp;
    }
    match state.registry.config_of(&name) {
        Some(cfg) => axum::Json(cfg).into_response(),
        None if state.registry.state_of(&name).is_some() => axum::Json(serde_json::Value::Null).into_response(),
        None => not_found(),
    }
}

/// `POST /admin/extensions/<name>/config` (§6.4 `ApplyConfig`): validates
/// the request body against the extension's `config_schema` and, if it
/// passes, replaces `config_current`. 409 if the extension is `Started`
/// (config is frozen the instant `Start` succeeds) or unknown-extension
/// shaped errors otherwise; 400 on schema validation failure.
async fn admin_apply_config(
    axum::extract::State(state): axum::extract::State<Arc<NamespacedRouter>>,
    axum::extract::Path(name): axum::extract::Path<String>,
    req: Request<Body>,
) -> Response {
    if let Err(resp) = require_admin(&req) {
        return resp;
    }
    let (parts, body) = req.into_parts();
    let _ = parts;
    let bytes = match axum::body::to_bytes(body, 1024 * 1024).await {
        Ok(b) => b,
        Err(_) => return (StatusCode::BAD_REQUEST, "could not read request body").into_response(),
    };
    let config: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(serde_json::json!({"error": format!("invalid json: {e}")})),
            )
                .into_response();
        }
    };

    match state.registry.apply_config(&name, config) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(crate::error::LifecycleError::InvalidConfig(msg)) => (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({"error": msg})),
        )
            .into_response(),
        Err(crate::error::LifecycleError::InvalidTransition { state, .. }) if state == "unknown" => not_found(),
        Err(e) => (
            StatusCode::CONFLICT,
            axum::Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;

    async fn setup() -> (Arc<NamespacedRouter>, Arc<ExtensionRegistry>) {
        let pool = crate::db::init_memory_pool().await.unwrap();
        let container = ServiceContainer::new(HostConfig::default(), pool, b"test-secret");
        let registry = ExtensionRegistry::new(container.clone());
        let router = NamespacedRouter::new(registry.clone(), container);
        (router, registry)
    }

    #[tokio::test]
    async fn unknown_extension_is_404_not_500() {
        let (router, _registry) = setup().await;
        let app = router.build();
        let req = Request::builder()
            .uri("/ext/nonexistent/ping")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn mount_after_seal_is_rejected() {
        let (router, _registry) = setup().await;
        router.seal();
        let err = router.mount("late", Router::new(), vec![]).unwrap_err();
        assert!(matches!(err, HandlerError::Internal(_)));
    }

    #[test]
    fn template_matching_covers_path_params() {
        assert!(path_matches_template("/ext/notes/notes/{id}", "/ext/notes/notes/abc123"));
        assert!(path_matches_template("/ext/notes/notes", "/ext/notes/notes"));
        assert!(!path_matches_template("/ext/notes/notes/{id}", "/ext/notes/notes"));
        assert!(!path_matches_template("/ext/notes/notes", "/ext/notes/notes/abc123"));
    }

    #[tokio::test]
    async fn ext_health_is_404_for_unknown_and_503_for_unstarted() {
        let (router, registry) = setup().await;
        let app = router.build();

        let req = Request::builder()
            .uri("/ext/nonexistent/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let descriptor = crate::descriptor::ExtensionDescriptor {
            name: "hugo".into(),
            version: crate::descriptor::SemVer::new(1, 0, 0),
            min_host_version: crate::descriptor::SemVer::new(1, 0, 0),
            max_host_version: crate::descriptor::SemVer::new(2, 0, 0),
            description: String::new(),
            author: String::new(),
            license: String::new(),
            homepage: String::new(),
            tags: vec![],
            required_permissions: vec![],
            config_schema: serde_json::json!({}),
            database_schema: "hugo".into(),
            documentation: crate::descriptor::Documentation::default(),
        };

        struct NeverStarted;
        #[async_trait::async_trait]
        impl crate::registry::ExtensionHandle for NeverStarted {
            async fn initialize(
                &self,
                _services: crate::container::ExtensionServices,
            ) -> Result<Vec<crate::db::migration::ModelSpec>, crate::error::LifecycleError> {
                Ok(vec![])
            }
            async fn start(&self) -> Result<(), crate::error::LifecycleError> {
                Ok(())
            }
            async fn stop(&self) -> Result<(), crate::error::LifecycleError> {
                Ok(())
            }
            async fn health(&self) -> crate::descriptor::HealthStatus {
                unreachable!("never started, never polled")
            }
        }

        registry.register(descriptor, Arc::new(NeverStarted)).unwrap();
        registry.initialize("hugo", None).await.unwrap();

        let req = Request::builder()
            .uri("/ext/hugo/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn admin_extensions_list_requires_admin_role() {
        let (router, _registry) = setup().await;
        let app = router.build();

        let req = Request::builder()
            .uri("/admin/extensions")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let token = router
            .container()
            .iam
            .issue_token("root", vec!["admin".to_string()], 3600)
            .unwrap();
        let req = Request::builder()
            .uri("/admin/extensions")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_apply_config_is_rejected_once_started() {
        let (router, registry) = setup().await;

        struct NoopExtension;
        #[async_trait::async_trait]
        impl crate::registry::ExtensionHandle for NoopExtension {
            async fn initialize(
                &self,
                _services: crate::container::ExtensionServices,
            ) -> Result<Vec<crate::db::migration::ModelSpec>, crate::error::LifecycleError> {
                Ok(vec![])
            }
            async fn start(&self) -> Result<(), crate::error::LifecycleError> {
                Ok(())
            }
            async fn stop(&self) -> Result<(), crate::error::LifecycleError> {
                Ok(())
            }
            async fn health(&self) -> crate::descriptor::HealthStatus {
                unreachable!()
            }
        }

        let descriptor = crate::descriptor::ExtensionDescriptor {
            name: "notes".into(),
            version: crate::descriptor::SemVer::new(1, 0, 0),
            min_host_version: crate::descriptor::SemVer::new(1, 0, 0),
            max_host_version: crate::descriptor::SemVer::new(2, 0, 0),
            description: String::new(),
            author: String::new(),
            license: String::new(),
            homepage: String::new(),
            tags: vec![],
            required_permissions: vec![],
            config_schema: serde_json::json!({
                "type": "object",
                "properties": { "max_body_len": { "type": "integer" } }
            }),
            database_schema: "notes".into(),
            documentation: crate::descriptor::Documentation::default(),
        };
        registry.register(descriptor, Arc::new(NoopExtension)).unwrap();
        registry.initialize("notes", None).await.unwrap();

        let app = router.build();
        let token = router
            .container()
            .iam
            .issue_token("root", vec!["admin".to_string()], 3600)
            .unwrap();

        let req = Request::builder()
            .method("POST")
            .uri("/admin/extensions/notes/config")
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"max_body_len":500}"#))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        registry.start("notes").await.unwrap();

        let req = Request::builder()
            .method("POST")
            .uri("/admin/extensions/notes/config")
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"max_body_len":999}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
