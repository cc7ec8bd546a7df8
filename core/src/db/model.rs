//! The `Model`/`AutoMigrate` contract extensions use in place of GORM
//! (spec §4.D). There is no direct GORM equivalent in the Rust ecosystem,
//! so this is hand-built on top of `sqlx`, grounded in the teacher's own
//! raw-`sqlx::query` style (`core/src/group/mutations.rs`).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Blob,
    /// SQL-array-typed columns fall back to JSON-encoded text on dialects
    /// (SQLite) that lack a native array type (§4.D dialect-mismatch rule).
    Json,
}

impl ColumnType {
    /// The DDL fragment used for `CREATE TABLE`/`ALTER TABLE ... ADD COLUMN`
    /// on SQLite. A Postgres-dialect orchestrator would map `Json` to
    /// `jsonb` and `Integer`/`Real` to their native equivalents instead.
    pub fn sqlite_ddl(&self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Json => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Blob => "BLOB",
        }
    }

    pub fn postgres_ddl(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Json => "JSONB",
            ColumnType::Integer => "BIGINT",
            ColumnType::Real => "DOUBLE PRECISION",
            ColumnType::Blob => "BYTEA",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: &'static str,
    pub kind: ColumnType,
    pub nullable: bool,
    pub unique: bool,
    pub primary_key: bool,
}

impl ColumnDef {
    pub const fn new(name: &'static str, kind: ColumnType) -> Self {
        Self {
            name,
            kind,
            nullable: true,
            unique: false,
            primary_key: false,
        }
    }

    pub const fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }
}

/// An extension-owned GORM-model analogue. `table_name()` is the *logical*
/// name; the orchestrator rewrites it to carry the `ext_<schema>_` prefix
/// (§4.D step 1, §6.3).
pub trait Model {
    fn table_name() -> &'static str;
    fn columns() -> &'static [ColumnDef];
}

/// Computes the physical table name for a model owned by `schema`.
pub fn physical_table_name(schema: &str, logical: &str) -> String {
    let prefix = format!("ext_{schema}_");
    if logical.starts_with(&prefix) {
        logical.to_string()
    } else {
        format!("{prefix}{logical}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item;
    impl Model for Item {
        fn table_name() -> &'static str {
            "items"
        }
        fn columns() -> &'static [ColumnDef] {
            &[
                ColumnDef::new("id", ColumnType::Text).primary_key(),
                ColumnDef::new("title", ColumnType::Text).not_null(),
            ]
        }
    }

    #[test]
    fn prefix_rewrite_is_idempotent() {
        let once = physical_table_name("alpha", Item::table_name());
        assert_eq!(once, "ext_alpha_items");
        let twice = physical_table_name("alpha", &once);
        assert_eq!(twice, once);
    }
}
