//! Migration Orchestrator (spec §4.D).
//!
//! Implements the five-step algorithm verbatim: rewrite table names under
//! the extension's prefix, create-if-missing, diff existing columns and
//! add only what's missing, record a schema fingerprint so a repeat
//! `AutoMigrate` call with an unchanged model set is a true no-op
//! (Testable Property 3), and never drop a column (Testable Property 4).

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use super::model::{ColumnDef, physical_table_name};
use crate::error::LifecycleError;

/// One model's worth of migration input, already erased to its runtime
/// shape (extensions call `AutoMigrate::<M>()` via the generic wrapper in
/// `MigrationOrchestrator::auto_migrate`, which fills this in from `Model`).
pub struct ModelSpec {
    pub logical_table: &'static str,
    pub columns: &'static [ColumnDef],
}

pub struct MigrationOrchestrator {
    pool: SqlitePool,
}

impl MigrationOrchestrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_bookkeeping_table(&self) -> Result<(), LifecycleError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS __ext_migrations (
                extension TEXT NOT NULL,
                schema_fingerprint TEXT NOT NULL,
                at TEXT NOT NULL,
                PRIMARY KEY (extension)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| LifecycleError::Migration(e.to_string()))?;
        Ok(())
    }

    fn fingerprint(schema: &str, models: &[ModelSpec]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(schema.as_bytes());
        let mut tables: Vec<_> = models
            .iter()
            .map(|m| {
                let mut cols: Vec<String> = m
                    .columns
                    .iter()
                    .map(|c| format!("{}:{:?}:{}", c.name, c.kind, c.nullable))
                    .collect();
                cols.sort();
                format!("{}[{}]", m.logical_table, cols.join(","))
            })
            .collect();
        tables.sort();
        for t in tables {
            hasher.update(t.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Runs the full algorithm for one extension's declared model set.
    /// Returns the set of physical table names touched, for introspection.
    pub async fn auto_migrate(
        &self,
        schema: &str,
        models: &[ModelSpec],
    ) -> Result<Vec<String>, LifecycleError> {
        self.ensure_bookkeeping_table().await?;

        let fingerprint = Self::fingerprint(schema, models);
        let previous: Option<String> =
            sqlx::query_scalar("SELECT schema_fingerprint FROM __ext_migrations WHERE extension = ?")
                .bind(schema)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| LifecycleError::Migration(e.to_string()))?;

        let mut touched = Vec::with_capacity(models.len());
        for m in models {
            touched.push(physical_table_name(schema, m.logical_table));
        }

        if previous.as_deref() == Some(fingerprint.as_str()) {
            // Testable Property 3: same model set twice emits no DDL.
            return Ok(touched);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LifecycleError::Migration(e.to_string()))?;

        for m in models {
            let table = physical_table_name(schema, m.logical_table);
            Self::create_table_if_missing(&mut *tx, &table, m.columns).await?;
            Self::add_missing_columns(&mut *tx, &table, m.columns).await?;
        }

        sqlx::query(
            "INSERT INTO __ext_migrations (extension, schema_fingerprint, at)
             VALUES (?, ?, datetime('now'))
             ON CONFLICT(extension) DO UPDATE SET schema_fingerprint = excluded.schema_fingerprint, at = excluded.at",
        )
        .bind(schema)
        .bind(&fingerprint)
        .execute(&mut *tx)
        .await
        .map_err(|e| LifecycleError::Migration(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| LifecycleError::Migration(e.to_string()))?;

        Ok(touched)
    }

    async fn create_table_if_missing(
        tx: &mut sqlx::SqliteConnection,
        table: &str,
        columns: &[ColumnDef],
    ) -> Result<(), LifecycleError> {
        let mut col_defs = Vec::with_capacity(columns.len());
        for c in columns {
            let mut def = format!("\"{}\" {}", c.name, c.kind.sqlite_ddl());
            if c.primary_key {
                def.push_str(" PRIMARY KEY");
            }
            if !c.nullable && !c.primary_key {
                def.push_str(" NOT NULL");
            }
            if c.unique && !c.primary_key {
                def.push_str(" UNIQUE");
            }
            col_defs.push(def);
        }
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
            table,
            col_defs.join(", ")
        );
        sqlx::query(&sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| LifecycleError::Migration(e.to_string()))?;
        Ok(())
    }

    async fn existing_columns(
        tx: &mut sqlx::SqliteConnection,
        table: &str,
    ) -> Result<Vec<String>, LifecycleError> {
        let sql = format!("PRAGMA table_info(\"{}\")", table);
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| LifecycleError::Migration(e.to_string()))?;
        Ok(rows
            .iter()
            .map(|r| r.get::<String, _>("name"))
            .collect())
    }

    async fn add_missing_columns(
        tx: &mut sqlx::SqliteConnection,
        table: &str,
        columns: &[ColumnDef],
    ) -> Result<(), LifecycleError> {
        let existing = Self::existing_columns(tx, table).await?;
        for c in columns {
            if existing.iter().any(|e| e == c.name) {
                // never drop, never alter an already-present column.
                continue;
            }
            let mut def = format!(
                "ALTER TABLE \"{}\" ADD COLUMN \"{}\" {}",
                table,
                c.name,
                c.kind.sqlite_ddl()
            );
            // SQLite forbids NOT NULL ADD COLUMN without a default; an
            // add-only migration of a previously-absent required column
            // has to supply one so existing rows stay valid.
            if !c.nullable {
                def.push_str(" DEFAULT ''");
            }
            sqlx::query(&def)
                .execute(&mut *tx)
                .await
                .map_err(|e| LifecycleError::Migration(e.to_string()))?;
        }
        Ok(())
    }
}
