//! Service Container (§4.A): constructed once at startup, then handed to
//! every extension as a narrow, per-extension-scoped facade. Grounded in
//! the teacher's `main.rs`, which builds one `AppState` and clones
//! `Arc` handles into each route/extension closure — this generalizes
//! that into an explicit `scoped(name)` constructor so an extension
//! never sees another extension's services.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use sqlx::SqlitePool;

use crate::config::HostConfig;
use crate::db::migration::MigrationOrchestrator;
use crate::hooks::HookBus;
use crate::iam::Iam;
use crate::logger::ScopedLogger;
use crate::storage::{FsObjectStore, ObjectStore};

/// Host-wide singletons, shared by every extension's scoped view.
pub struct ServiceContainer {
    pub config: HostConfig,
    pub db_pool: SqlitePool,
    pub migrations: Arc<MigrationOrchestrator>,
    pub iam: Arc<Iam>,
    pub hooks: Arc<HookBus>,
    data_root: PathBuf,
}

impl ServiceContainer {
    pub fn new(config: HostConfig, db_pool: SqlitePool, jwt_secret: &[u8]) -> Arc<Self> {
        let migrations = Arc::new(MigrationOrchestrator::new(db_pool.clone()));
        let iam = Iam::new(jwt_secret);
        let hooks = HookBus::new(Duration::from_millis(config.hooks.default_deadline_ms));
        let data_root = config.server.data_dir.clone();
        Arc::new(Self {
            config,
            db_pool,
            migrations,
            iam,
            hooks,
            data_root,
        })
    }

    /// Builds the narrow set of services one extension is allowed to see,
    /// each already bound to that extension's name/table-prefix/storage
    /// root so the extension never has to (and never can) address another
    /// extension's slice of the host.
    pub fn scoped(&self, extension_name: &str) -> ExtensionServices {
        ExtensionServices {
            name: extension_name.to_string(),
            logger: ScopedLogger::new(extension_name),
            db_pool: self.db_pool.clone(),
            migrations: self.migrations.clone(),
            iam: self.iam.clone(),
            hooks: self.hooks.clone(),
            storage: Arc::new(FsObjectStore::new(
                crate::db::data_dir_for(&self.data_root, extension_name),
            )),
        }
    }
}

/// The facade an extension's `Initialize(ctx, services)` actually
/// receives; everything on it is already namespaced to `name`.
#[derive(Clone)]
pub struct ExtensionServices {
    pub name: String,
    pub logger: ScopedLogger,
    pub db_pool: SqlitePool,
    pub migrations: Arc<MigrationOrchestrator>,
    pub iam: Arc<Iam>,
    pub hooks: Arc<HookBus>,
    pub storage: Arc<dyn ObjectStore>,
}

impl ExtensionServices {
    pub fn logger(&self) -> &ScopedLogger {
        &self.logger
    }

    pub fn storage(&self) -> Arc<dyn ObjectStore> {
        self.storage.clone()
    }

    /// Looks up one key out of this extension's last-applied,
    /// schema-validated configuration (§3.1 `config_schema`); `current`
    /// is threaded in by the registry rather than stored here, since the
    /// registry is the single owner of `config_current` (§3.2).
    pub fn config_value<'a>(current: &'a Option<JsonValue>, key: &str) -> Option<&'a JsonValue> {
        current.as_ref().and_then(|v| v.get(key))
    }
}
