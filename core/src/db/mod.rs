//! Database plumbing: pool bootstrap (grounded in the teacher's
//! `db::init_pool`) plus the Migration Orchestrator (§4.D).

pub mod migration;
pub mod model;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};

const CORE_DB_FILENAME: &str = "solobase.db";

/// Initializes the host's own metadata database (distinct from any
/// per-extension tables, which live in the same physical database under
/// their `ext_<schema>_` prefix per §6.3).
pub async fn init_pool(db_root: impl Into<PathBuf>) -> Result<(SqlitePool, PathBuf)> {
    let db_root_path: PathBuf = db_root.into();
    std::fs::create_dir_all(&db_root_path)
        .with_context(|| format!("failed to create DB path: {}", db_root_path.display()))?;

    let db_path = db_root_path.join(CORE_DB_FILENAME);
    let db_uri = format!("sqlite://{}", db_path.to_string_lossy());

    let connect_options = SqliteConnectOptions::from_str(&db_uri)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(connect_options)
        .await?;

    Ok((pool, db_root_path))
}

/// An in-memory pool for tests and the `FORGE_IN_MEMORY_DB`-style dev mode.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

pub(crate) fn normalize_path(path: impl Into<PathBuf>) -> Result<PathBuf> {
    let path = path.into();
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().context("failed to read current working directory")?;
    Ok(cwd.join(path))
}

pub fn data_dir_for(base: &Path, extension: &str) -> PathBuf {
    base.join("ext").join(extension)
}
