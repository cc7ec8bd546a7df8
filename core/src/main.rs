//! Default host binary. Wires the Service Container, Extension
//! Registry, Migration Orchestrator, Hook Bus, and Namespaced Router
//! together and serves whatever extensions are named in config.
//!
//! Native extensions are Rust trait objects and have to be compiled
//! into whatever binary runs them; this binary only ever embeds WASM
//! guests, loaded at runtime from the paths `config.extensions.wasm`
//! names. An operator who wants a native extension linked in builds
//! their own thin binary crate depending on `solobase-core` and that
//! extension crate, and calls the same `ServiceContainer` /
//! `ExtensionRegistry` / `NamespacedRouter` API this `main` does — see
//! `extensions/notes`'s own integration test for that shape.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use solobase_core::config;
use solobase_core::container::ServiceContainer;
use solobase_core::db;
use solobase_core::registry::ExtensionRegistry;
use solobase_core::router::NamespacedRouter;
use solobase_core::supervisor::Supervisor;
use solobase_core::wasm::WasmExtensionHandle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = config::load_with_discovery()?;
    std::fs::create_dir_all(&config.server.data_dir)
        .with_context(|| format!("creating data dir {}", config.server.data_dir.display()))?;

    let (pool, _db_path) = db::init_pool(config.server.data_dir.clone()).await?;

    let jwt_secret = std::env::var("SOLOBASE_JWT_SECRET").unwrap_or_else(|_| {
        tracing::warn!("SOLOBASE_JWT_SECRET not set, using an ephemeral dev secret");
        cuid2::cuid()
    });

    let wasm_extensions = config.extensions.wasm.clone();
    if !config.extensions.native.is_empty() {
        for native in &config.extensions.native {
            tracing::warn!(
                name = %native.name,
                "native extension named in config but this binary embeds none; rebuild with it linked in"
            );
        }
    }

    let container = ServiceContainer::new(config.clone(), pool, jwt_secret.as_bytes());
    let registry = ExtensionRegistry::new(container.clone());
    let router = NamespacedRouter::new(registry.clone(), container.clone());

    for wasm_ext in &wasm_extensions {
        let handle = Arc::new(WasmExtensionHandle::new(
            wasm_ext.path.clone(),
            Duration::from_secs(5),
        ));
        let descriptor = solobase_core::descriptor::ExtensionDescriptor {
            name: wasm_ext.name.clone(),
            version: solobase_core::descriptor::SemVer::new(0, 1, 0),
            min_host_version: solobase_core::descriptor::SemVer::new(0, 1, 0),
            max_host_version: solobase_core::descriptor::SemVer::new(1, 0, 0),
            description: String::new(),
            author: String::new(),
            license: String::new(),
            homepage: String::new(),
            tags: vec![],
            required_permissions: vec![],
            config_schema: serde_json::json!({}),
            database_schema: wasm_ext.name.clone(),
            documentation: solobase_core::descriptor::Documentation::default(),
        };
        registry
            .register(descriptor, handle.clone())
            .with_context(|| format!("registering wasm extension `{}`", wasm_ext.name))?;
        registry
            .initialize(&wasm_ext.name, None)
            .await
            .with_context(|| format!("initializing wasm extension `{}`", wasm_ext.name))?;
        registry
            .start(&wasm_ext.name)
            .await
            .with_context(|| format!("starting wasm extension `{}`", wasm_ext.name))?;
        router
            .mount(&wasm_ext.name, handle.router(), vec![])
            .with_context(|| format!("mounting routes for wasm extension `{}`", wasm_ext.name))?;
    }
    router.seal();

    let bind_addr = config.server.bind_addr.clone();
    let grace = Duration::from_secs(config.server.shutdown_grace_seconds);

    let mut supervisor = Supervisor::new();
    supervisor.spawn("http", move |shutdown| async move {
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding {bind_addr}"))?;
        tracing::info!(%bind_addr, "listening");
        axum::serve(listener, router.build())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("http server failed")?;

        let names: Vec<String> = registry.list().into_iter().map(|(d, _)| d.name).collect();
        for name in names {
            if let Err(e) = registry.stop(&name, grace).await {
                tracing::warn!(extension = %name, error = %e, "error stopping extension during shutdown");
            }
        }
        Ok(())
    });

    supervisor.run().await
}
