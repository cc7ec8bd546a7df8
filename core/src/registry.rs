//! Extension Registry (§4.B): the single process-wide authority over
//! extension identity, state transitions, and namespace collisions.
//! Grounded in the teacher's `extensions::loader` module shape (one
//! `RwLock`-guarded table keyed by extension name, loaded at startup)
//! but generalized from "load a `.wasm` file" to the full
//! Discovered→Initialized→Started⇄Stopped→Failed lifecycle the spec
//! requires.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::container::{ExtensionServices, ServiceContainer};
use crate::db::migration::ModelSpec;
use crate::descriptor::{
    ExtensionDescriptor, ExtensionRuntimeState, ExtensionState, HealthStatus, TransitionRecord, HOST_VERSION,
};
use crate::error::{LifecycleError, RegistrationError};
use crate::hooks::EventType;

/// The behavior every extension — native or WASM-backed — must provide.
/// A WASM-backed implementation forwards each call through the Host ABI
/// (§4.F) instead of running code in-process; both sides of that split
/// implement the identical trait so the registry never has to know which
/// one it's holding.
#[async_trait]
pub trait ExtensionHandle: Send + Sync {
    async fn initialize(&self, services: ExtensionServices) -> Result<Vec<ModelSpec>, LifecycleError>;
    async fn start(&self) -> Result<(), LifecycleError>;
    async fn stop(&self) -> Result<(), LifecycleError>;
    async fn health(&self) -> HealthStatus;
}

struct Entry {
    descriptor: ExtensionDescriptor,
    handle: Arc<dyn ExtensionHandle>,
    runtime: ExtensionRuntimeState,
    health_cache_ttl: Duration,
}

pub struct ExtensionRegistry {
    container: Arc<ServiceContainer>,
    entries: RwLock<HashMap<String, Entry>>,
    url_prefixes: RwLock<HashSet<String>>,
    table_prefixes: RwLock<HashSet<String>>,
    permission_names: RwLock<HashSet<String>>,
    sealed: std::sync::atomic::AtomicBool,
}

impl ExtensionRegistry {
    pub fn new(container: Arc<ServiceContainer>) -> Arc<Self> {
        Arc::new(Self {
            container,
            entries: RwLock::new(HashMap::new()),
            url_prefixes: RwLock::new(HashSet::new()),
            table_prefixes: RwLock::new(HashSet::new()),
            permission_names: RwLock::new(HashSet::new()),
            sealed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Adds a descriptor to the registry in the `Discovered` state.
    /// Fails fast on any of the three namespace collisions §3.2 rule 2
    /// names: name, URL prefix, table prefix, or a permission name.
    pub fn register(
        &self,
        descriptor: ExtensionDescriptor,
        handle: Arc<dyn ExtensionHandle>,
    ) -> Result<(), RegistrationError> {
        descriptor
            .validate()
            .map_err(RegistrationError::InvalidConfig)?;

        let mut entries = self.entries.write().expect("registry lock poisoned");
        if entries.contains_key(&descriptor.name) {
            return Err(RegistrationError::DuplicateName(descriptor.name.clone()));
        }

        let url_prefix = descriptor.url_prefix();
        let table_prefix = descriptor.table_prefix();

        {
            let mut urls = self.url_prefixes.write().expect("registry lock poisoned");
            if urls.contains(&url_prefix) {
                return Err(RegistrationError::DuplicateUrlPrefix(url_prefix));
            }
            urls.insert(url_prefix);
        }
        {
            let mut tables = self.table_prefixes.write().expect("registry lock poisoned");
            if tables.contains(&table_prefix) {
                return Err(RegistrationError::DuplicateTablePrefix(table_prefix));
            }
            tables.insert(table_prefix);
        }
        {
            let mut perms = self.permission_names.write().expect("registry lock poisoned");
            for p in &descriptor.required_permissions {
                if perms.contains(&p.name) {
                    return Err(RegistrationError::DuplicatePermission(p.name.clone()));
                }
            }
            for p in &descriptor.required_permissions {
                perms.insert(p.name.clone());
            }
        }

        self.container.iam.register_permissions(&descriptor.name, &descriptor.required_permissions);

        entries.insert(
            descriptor.name.clone(),
            Entry {
                descriptor,
                handle,
                runtime: ExtensionRuntimeState::default(),
                health_cache_ttl: Duration::from_secs(5),
            },
        );
        Ok(())
    }

    fn record_transition(entry: &mut Entry, to: ExtensionState, error: Option<String>) {
        let from = entry.runtime.state;
        entry.runtime.transitions.push(TransitionRecord {
            from,
            to,
            error,
            at: SystemTime::now(),
        });
        entry.runtime.state = to;
    }

    /// `Discovered → Initialized`. Runs exactly once per process per
    /// extension (§4.B); a second call on an already-initialized
    /// extension is an invalid-transition error rather than a silent
    /// no-op, so a caller can't accidentally re-run migrations.
    pub async fn initialize(
        &self,
        name: &str,
        initial_config: Option<JsonValue>,
    ) -> Result<(), LifecycleError> {
        let (descriptor, handle) = {
            let entries = self.entries.read().expect("registry lock poisoned");
            let entry = entries
                .get(name)
                .ok_or_else(|| LifecycleError::InvalidTransition {
                    name: name.to_string(),
                    state: "unknown".to_string(),
                    expected: "discovered".to_string(),
                })?;
            if entry.runtime.state != ExtensionState::Discovered {
                return Err(LifecycleError::InvalidTransition {
                    name: name.to_string(),
                    state: entry.runtime.state.to_string(),
                    expected: ExtensionState::Discovered.to_string(),
                });
            }
            (entry.descriptor.clone(), entry.handle.clone())
        };

        if HOST_VERSION < descriptor.min_host_version || HOST_VERSION > descriptor.max_host_version {
            let e = LifecycleError::IncompatibleHostVersion {
                name: name.to_string(),
                min: descriptor.min_host_version.to_string(),
                max: descriptor.max_host_version.to_string(),
                host: HOST_VERSION.to_string(),
            };
            self.fail(name, e.to_string());
            return Err(e);
        }

        if let Some(cfg) = &initial_config {
            if let Err(e) = validate_against_schema(&descriptor.config_schema, cfg) {
                self.fail(name, e.to_string());
                return Err(LifecycleError::InitializeFailed(e.to_string()));
            }
        }

        let services = self.container.scoped(name);
        let result = handle.initialize(services).await;

        let mut entries = self.entries.write().expect("registry lock poisoned");
        let entry = entries.get_mut(name).expect("entry vanished under lock");

        match result {
            Ok(models) => {
                if let Err(e) = self
                    .container
                    .migrations
                    .auto_migrate(&descriptor.database_schema, &models)
                    .await
                {
                    Self::record_transition(entry, ExtensionState::Failed, Some(e.to_string()));
                    return Err(e);
                }
                entry.runtime.config_current = initial_config;
                Self::record_transition(entry, ExtensionState::Initialized, None);
                Ok(())
            }
            Err(e) => {
                Self::record_transition(entry, ExtensionState::Failed, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// `ApplyConfig` (§6.4): validates `config` against the extension's
    /// declared `config_schema` and, if it passes, replaces
    /// `config_current`. Only legal while the extension is `Initialized`
    /// or `Stopped` — configuration is frozen the instant `Start`
    /// succeeds, so a `Started` extension never observes a config change
    /// out from under an in-flight request.
    pub fn apply_config(&self, name: &str, config: JsonValue) -> Result<(), LifecycleError> {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| LifecycleError::InvalidTransition {
                name: name.to_string(),
                state: "unknown".to_string(),
                expected: "initialized or stopped".to_string(),
            })?;

        if !matches!(
            entry.runtime.state,
            ExtensionState::Initialized | ExtensionState::Stopped
        ) {
            return Err(LifecycleError::InvalidTransition {
                name: name.to_string(),
                state: entry.runtime.state.to_string(),
                expected: "initialized or stopped".to_string(),
            });
        }

        validate_against_schema(&entry.descriptor.config_schema, &config)
            .map_err(LifecycleError::InvalidConfig)?;
        entry.runtime.config_current = Some(config);
        Ok(())
    }

    /// Returns one extension's current config, for the admin API's
    /// config-inspection route.
    pub fn config_of(&self, name: &str) -> Option<JsonValue> {
        let entries = self.entries.read().expect("registry lock poisoned");
        entries.get(name)?.runtime.config_current.clone()
    }

    /// `Initialized → Started`, or `Stopped → Started` (restart is
    /// permitted, §4.B rule). Broadcasts `ExtensionStarted` on success.
    pub async fn start(&self, name: &str) -> Result<(), LifecycleError> {
        let handle = {
            let entries = self.entries.read().expect("registry lock poisoned");
            let entry = entries
                .get(name)
                .ok_or_else(|| LifecycleError::InvalidTransition {
                    name: name.to_string(),
                    state: "unknown".to_string(),
                    expected: "initialized or stopped".to_string(),
                })?;
            if !matches!(
                entry.runtime.state,
                ExtensionState::Initialized | ExtensionState::Stopped
            ) {
                return Err(LifecycleError::InvalidTransition {
                    name: name.to_string(),
                    state: entry.runtime.state.to_string(),
                    expected: "initialized or stopped".to_string(),
                });
            }
            entry.handle.clone()
        };

        let result = handle.start().await;
        let mut entries = self.entries.write().expect("registry lock poisoned");
        let entry = entries.get_mut(name).expect("entry vanished under lock");

        match result {
            Ok(()) => {
                Self::record_transition(entry, ExtensionState::Started, None);
                drop(entries);
                self.container
                    .hooks
                    .emit(
                        EventType::ExtensionStarted,
                        serde_json::json!({ "extension": name }),
                        CancellationToken::new(),
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                Self::record_transition(entry, ExtensionState::Failed, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// `Started → Stopped`. Broadcasts `ExtensionStopped` after the
    /// extension's own `stop` hook returns, within the configured grace
    /// period; a hung `stop` still lands the extension in `Stopped`
    /// rather than blocking shutdown forever (§3.2 "Stop drains...with a
    /// configurable grace deadline").
    pub async fn stop(&self, name: &str, grace: Duration) -> Result<(), LifecycleError> {
        let handle = {
            let entries = self.entries.read().expect("registry lock poisoned");
            let entry = entries
                .get(name)
                .ok_or_else(|| LifecycleError::InvalidTransition {
                    name: name.to_string(),
                    state: "unknown".to_string(),
                    expected: "started".to_string(),
                })?;
            if entry.runtime.state != ExtensionState::Started {
                return Err(LifecycleError::InvalidTransition {
                    name: name.to_string(),
                    state: entry.runtime.state.to_string(),
                    expected: ExtensionState::Started.to_string(),
                });
            }
            entry.handle.clone()
        };

        let result = tokio::time::timeout(grace, handle.stop()).await;
        let mut entries = self.entries.write().expect("registry lock poisoned");
        let entry = entries.get_mut(name).expect("entry vanished under lock");

        match result {
            Ok(Ok(())) => {
                Self::record_transition(entry, ExtensionState::Stopped, None);
                drop(entries);
                self.emit_extension_stopped(name).await;
                Ok(())
            }
            Ok(Err(e)) => {
                Self::record_transition(entry, ExtensionState::Failed, Some(e.to_string()));
                Err(e)
            }
            Err(_) => {
                let msg = format!("stop did not complete within {grace:?}");
                Self::record_transition(entry, ExtensionState::Stopped, Some(msg));
                drop(entries);
                self.emit_extension_stopped(name).await;
                Ok(())
            }
        }
    }

    async fn emit_extension_stopped(&self, name: &str) {
        self.container
            .hooks
            .emit(
                EventType::ExtensionStopped,
                serde_json::json!({ "extension": name }),
                CancellationToken::new(),
            )
            .await;
    }

    fn fail(&self, name: &str, error: String) {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        if let Some(entry) = entries.get_mut(name) {
            Self::record_transition(entry, ExtensionState::Failed, Some(error));
        }
    }

    /// Queries and memoizes health for a short TTL so a hot `/health`
    /// endpoint doesn't hammer the extension on every poll.
    pub async fn health(&self, name: &str) -> Result<HealthStatus, LifecycleError> {
        let (handle, cached, state) = {
            let entries = self.entries.read().expect("registry lock poisoned");
            let entry = entries
                .get(name)
                .ok_or_else(|| LifecycleError::InvalidTransition {
                    name: name.to_string(),
                    state: "unknown".to_string(),
                    expected: "registered".to_string(),
                })?;
            let fresh = entry.runtime.health_checked_at.is_some_and(|at| {
                SystemTime::now()
                    .duration_since(at)
                    .map(|d| d < entry.health_cache_ttl)
                    .unwrap_or(false)
            });
            if fresh {
                if let Some(cached) = &entry.runtime.health_last {
                    return Ok(cached.clone());
                }
            }
            (entry.handle.clone(), entry.runtime.health_last.clone(), entry.runtime.state)
        };

        if state != ExtensionState::Started {
            let status = HealthStatus {
                status: crate::descriptor::HealthStatusKind::Stopped,
                message: format!("extension is {state}, not started"),
                checked_at: SystemTime::now(),
                checks: vec![],
            };
            self.cache_health(name, status.clone());
            return Ok(status);
        }

        let status = handle.health().await;
        self.cache_health(name, status.clone());
        let _ = cached;
        Ok(status)
    }

    fn cache_health(&self, name: &str, status: HealthStatus) {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        if let Some(entry) = entries.get_mut(name) {
            entry.runtime.health_checked_at = Some(status.checked_at);
            entry.runtime.health_last = Some(status);
        }
    }

    pub fn list(&self) -> Vec<(ExtensionDescriptor, ExtensionState)> {
        let entries = self.entries.read().expect("registry lock poisoned");
        entries
            .values()
            .map(|e| (e.descriptor.clone(), e.runtime.state))
            .collect()
    }

    pub fn state_of(&self, name: &str) -> Option<ExtensionState> {
        let entries = self.entries.read().expect("registry lock poisoned");
        entries.get(name).map(|e| e.runtime.state)
    }

    /// Records the route paths a router mount declared for `name`, purely
    /// for `List` introspection — the router is the source of truth for
    /// actually dispatching them.
    pub fn record_routes(&self, name: &str, paths: Vec<String>) {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        if let Some(entry) = entries.get_mut(name) {
            entry.runtime.routes = paths;
        }
    }

    /// Once every registered extension has been started, the router
    /// seals (§4.C): this just exposes the bit the router checks.
    pub fn seal(&self) {
        self.sealed.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

fn validate_against_schema(schema: &JsonValue, config: &JsonValue) -> Result<(), String> {
    let compiled = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
    let errors: Vec<String> = compiled
        .iter_errors(config)
        .map(|e| e.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::descriptor::{HealthStatusKind, SemVer};

    struct StubExtension {
        fail_init: bool,
    }

    #[async_trait]
    impl ExtensionHandle for StubExtension {
        async fn initialize(&self, _services: ExtensionServices) -> Result<Vec<ModelSpec>, LifecycleError> {
            if self.fail_init {
                return Err(LifecycleError::InitializeFailed("simulated migration error".into()));
            }
            Ok(vec![])
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
                message: "ok".into(),
                checked_at: SystemTime::now(),
                checks: vec![],
            }
        }
    }

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
            documentation: crate::descriptor::Documentation::default(),
        }
    }

    async fn container() -> Arc<ServiceContainer> {
        let pool = crate::db::init_memory_pool().await.unwrap();
        ServiceContainer::new(HostConfig::default(), pool, b"test-secret")
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let registry = ExtensionRegistry::new(container().await);
        registry
            .register(descriptor("hugo"), Arc::new(StubExtension { fail_init: false }))
            .unwrap();
        let err = registry
            .register(descriptor("hugo"), Arc::new(StubExtension { fail_init: false }))
            .unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn failed_initialize_isolates_other_extensions() {
        // S6.
        let registry = ExtensionRegistry::new(container().await);
        registry
            .register(descriptor("webhooks"), Arc::new(StubExtension { fail_init: true }))
            .unwrap();
        registry
            .register(descriptor("hugo"), Arc::new(StubExtension { fail_init: false }))
            .unwrap();

        assert!(registry.initialize("webhooks", None).await.is_err());
        assert_eq!(registry.state_of("webhooks"), Some(ExtensionState::Failed));

        registry.initialize("hugo", None).await.unwrap();
        registry.start("hugo").await.unwrap();
        assert_eq!(registry.state_of("hugo"), Some(ExtensionState::Started));

        let health = registry.health("hugo").await.unwrap();
        assert_eq!(health.status, HealthStatusKind::Healthy);
    }

    #[tokio::test]
    async fn restart_after_stop_is_permitted() {
        let registry = ExtensionRegistry::new(container().await);
        registry
            .register(descriptor("hugo"), Arc::new(StubExtension { fail_init: false }))
            .unwrap();
        registry.initialize("hugo", None).await.unwrap();
        registry.start("hugo").await.unwrap();
        registry.stop("hugo", Duration::from_secs(1)).await.unwrap();
        assert_eq!(registry.state_of("hugo"), Some(ExtensionState::Stopped));
        registry.start("hugo").await.unwrap();
        assert_eq!(registry.state_of("hugo"), Some(ExtensionState::Started));
    }
}
