//! Host configuration: loading and parsing (grounded in the teacher's
//! `config/mod.rs` + `config/loader.rs`, still RON-backed, widened from
//! "which OCI/local extensions to fetch" to the full set of host knobs
//! SPEC_FULL.md calls for — bind address, grace periods, hook deadline).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILENAMES: &[&str] = &["solobase.ron", ".solobase/config.ron"];
const CONFIG_PATH_ENV: &str = "SOLOBASE_CONFIG_PATH";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HostConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub extensions: ExtensionsConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            extensions: ExtensionsConfig::default(),
            hooks: HooksConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    /// Grace period an extension's `on_stop` hook gets before the host
    /// force-drops its WASM store / native task (§3.2 Stop semantics).
    pub shutdown_grace_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            data_dir: PathBuf::from("./data"),
            shutdown_grace_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct ExtensionsConfig {
    /// Extensions backed by a native Rust crate, linked in-process.
    #[serde(default)]
    pub native: Vec<NativeExtensionConfig>,
    /// Extensions backed by a `.wasm` module loaded from disk.
    #[serde(default)]
    pub wasm: Vec<WasmExtensionConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NativeExtensionConfig {
    pub name: String,
    #[serde(default)]
    pub config: ron::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WasmExtensionConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub config: ron::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HooksConfig {
    pub default_deadline_ms: u64,
    pub max_reentrancy_depth: u8,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: 5_000,
            max_reentrancy_depth: 8,
        }
    }
}

pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<HostConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    ron::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Searches, in order: `SOLOBASE_CONFIG_PATH`, `./solobase.ron`,
/// `./.solobase/config.ron`; falls back to defaults if none exist.
pub fn load_with_discovery() -> Result<HostConfig> {
    if let Ok(env_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            tracing::info!(path = %path.display(), "loading config from {CONFIG_PATH_ENV}");
            return load_from_file(&path);
        }
        tracing::warn!(path = %path.display(), "{CONFIG_PATH_ENV} set but file not found");
    }

    for filename in CONFIG_FILENAMES {
        let path = PathBuf::from(filename);
        if path.exists() {
            tracing::info!(path = %path.display(), "loading config");
            return load_from_file(&path);
        }
    }

    tracing::info!("no config file found, using defaults");
    Ok(HostConfig::default())
}
