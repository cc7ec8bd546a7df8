//! The `Note` entity this extension registers with `AutoMigrate` (§4.D).

use serde::Serialize;
use solobase_core::db::model::{ColumnDef, ColumnType, Model};

pub struct Note;

impl Model for Note {
    fn table_name() -> &'static str {
        "notes"
    }

    fn columns() -> &'static [ColumnDef] {
        &[
            ColumnDef::new("id", ColumnType::Text).primary_key(),
            ColumnDef::new("title", ColumnType::Text).not_null(),
            ColumnDef::new("body", ColumnType::Text),
            ColumnDef::new("created_at", ColumnType::Text).not_null(),
        ]
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct NoteRow {
    pub id: String,
    pub title: String,
    pub body: Option<String>,
    pub created_at: String,
}
