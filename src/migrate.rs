//! Storage readiness.
//!
//! [`ensure_storage_ready`] is idempotent and cheap enough to run before
//! every sync: it creates missing tables and adds columns that a mapping
//! table gained since the table was first created. Columns are never
//! dropped or retyped.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::config::Config;
use crate::db::{self, quote_ident};
use crate::entities::{self, EntityDef};

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_storage_ready(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn ensure_storage_ready(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for def in entities::all() {
        ensure_entity_table(pool, def).await?;
    }

    // Create sync tracker table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_tracker (
            entity_type TEXT PRIMARY KEY,
            last_sync_timestamp TEXT,
            records_synced INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create documents table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            contact_id TEXT NOT NULL,
            attachment_id TEXT,
            document_name TEXT NOT NULL,
            document_type TEXT NOT NULL,
            file_path TEXT NOT NULL,
            file_size INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create skills table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS skills (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            contact_id TEXT NOT NULL,
            document_id INTEGER NOT NULL,
            skill_name TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT 'Other',
            proficiency_level TEXT NOT NULL DEFAULT 'Intermediate',
            years_experience INTEGER,
            confidence_score REAL NOT NULL DEFAULT 0.8,
            extraction_method TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(contact_id, document_id, skill_name),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_contact_id ON documents(contact_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_skills_contact_id ON skills(contact_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_contacts_modified_time ON contacts(modified_time)")
        .execute(pool)
        .await?;

    debug!("storage ready");
    Ok(())
}

async fn ensure_entity_table(pool: &SqlitePool, def: &EntityDef) -> Result<(), sqlx::Error> {
    let existing = table_columns(pool, def.table).await?;

    if existing.is_empty() {
        let mut ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY",
            quote_ident(def.table)
        );
        for (column, sql_type) in def.columns() {
            ddl.push_str(&format!(", {} {}", quote_ident(column), sql_type));
        }
        ddl.push(')');
        sqlx::query(&ddl).execute(pool).await?;
        info!(table = def.table, "created table");
        return Ok(());
    }

    let missing: Vec<_> = def
        .columns()
        .filter(|(column, _)| !existing.iter().any(|c| c == column))
        .collect();
    if missing.is_empty() {
        debug!(table = def.table, "schema is up to date");
        return Ok(());
    }

    for (column, sql_type) in missing {
        let ddl = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_ident(def.table),
            quote_ident(column),
            sql_type
        );
        sqlx::query(&ddl).execute(pool).await?;
        info!(table = def.table, column, "added missing column");
    }
    Ok(())
}

/// Column names of `table`; empty when the table does not exist.
pub async fn table_columns(pool: &SqlitePool, table: &str) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
        .fetch_all(pool)
        .await?;
    rows.iter().map(|row| row.try_get::<String, _>("name")).collect()
}
