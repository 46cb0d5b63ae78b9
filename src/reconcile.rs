//! Reconciler: applies mapped records to an entity table.
//!
//! Two write paths share the same storage:
//!
//! - [`Reconciler::apply_batch`] is the bulk path. Every record of one sync
//!   run is applied inside a single transaction. Existing rows are fully
//!   replaced (null mapped values overwrite stored values), new rows are
//!   inserted. Any failure rolls back the whole batch.
//! - [`Reconciler::patch`] is the webhook path. Only non-empty values are
//!   written, so fields absent from a notification keep their stored value.
//!   Rows are never created by a patch.

use sqlx::sqlite::{Sqlite, SqliteArguments};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use crate::db::quote_ident;
use crate::entities::EntityDef;
use crate::mapping::FieldKind;
use crate::models::{ColumnValue, MappedRecord};
use crate::timefmt::format_timestamp;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Counts from one committed batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub inserted: usize,
    pub updated: usize,
}

/// Result of a single-record patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Row exists; `columns` lists what was written (possibly nothing).
    Updated { columns: Vec<String> },
    /// No local row with that identifier.
    NotFound,
}

#[derive(Clone)]
pub struct Reconciler {
    pool: SqlitePool,
}

impl Reconciler {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply a batch as one unit. Nothing is written unless every record
    /// applies.
    pub async fn apply_batch(
        &self,
        def: &EntityDef,
        records: &[MappedRecord],
    ) -> Result<ReconcileStats, sqlx::Error> {
        let mut stats = ReconcileStats::default();
        if records.is_empty() {
            return Ok(stats);
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            if row_exists(&mut tx, def, &record.id).await? {
                replace_row(&mut tx, def, record).await?;
                stats.updated += 1;
            } else {
                insert_row(&mut tx, def, record).await?;
                stats.inserted += 1;
            }
        }
        // Dropping `tx` on an early return above rolls the batch back.
        tx.commit().await?;

        debug!(
            table = def.table,
            inserted = stats.inserted,
            updated = stats.updated,
            "batch committed"
        );
        Ok(stats)
    }

    /// Write the non-empty `values` onto an existing row.
    ///
    /// Columns that are not part of the entity's mapping table are ignored.
    pub async fn patch(
        &self,
        def: &EntityDef,
        id: &str,
        values: &[(&str, ColumnValue)],
    ) -> Result<PatchOutcome, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        if !row_exists(&mut conn, def, id).await? {
            return Ok(PatchOutcome::NotFound);
        }

        let mut present: Vec<(&str, &ColumnValue)> = Vec::new();
        for (column, value) in values {
            match def.column_kind(column) {
                None | Some(FieldKind::Identifier) => {
                    warn!(table = def.table, column, "ignoring unknown patch column");
                }
                Some(_) if value.is_empty() => {}
                Some(_) => present.push((column, value)),
            }
        }

        if present.is_empty() {
            return Ok(PatchOutcome::Updated {
                columns: Vec::new(),
            });
        }

        let assignments: Vec<String> = present
            .iter()
            .map(|(column, _)| format!("{} = ?", quote_ident(column)))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?",
            quote_ident(def.table),
            assignments.join(", ")
        );
        let mut query = sqlx::query(&sql);
        for (_, value) in &present {
            query = bind_value(query, value);
        }
        query.bind(id).execute(&mut *conn).await?;

        Ok(PatchOutcome::Updated {
            columns: present.iter().map(|(c, _)| c.to_string()).collect(),
        })
    }

    /// Row count of the entity table.
    pub async fn count(&self, def: &EntityDef) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote_ident(def.table)))
            .fetch_one(&self.pool)
            .await
    }
}

async fn row_exists(
    conn: &mut SqliteConnection,
    def: &EntityDef,
    id: &str,
) -> Result<bool, sqlx::Error> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", quote_ident(def.table));
    let found: Option<i64> = sqlx::query_scalar(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

async fn insert_row(
    conn: &mut SqliteConnection,
    def: &EntityDef,
    record: &MappedRecord,
) -> Result<(), sqlx::Error> {
    let mut columns = vec![quote_ident("id")];
    columns.extend(record.columns.iter().map(|(c, _)| quote_ident(c)));
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(def.table),
        columns.join(", "),
        placeholders
    );

    let mut query = sqlx::query(&sql).bind(record.id.as_str());
    for (_, value) in &record.columns {
        query = bind_value(query, value);
    }
    query.execute(&mut *conn).await?;
    Ok(())
}

async fn replace_row(
    conn: &mut SqliteConnection,
    def: &EntityDef,
    record: &MappedRecord,
) -> Result<(), sqlx::Error> {
    if record.columns.is_empty() {
        return Ok(());
    }
    let assignments: Vec<String> = record
        .columns
        .iter()
        .map(|(c, _)| format!("{} = ?", quote_ident(c)))
        .collect();
    let sql = format!(
        "UPDATE {} SET {} WHERE id = ?",
        quote_ident(def.table),
        assignments.join(", ")
    );

    let mut query = sqlx::query(&sql);
    for (_, value) in &record.columns {
        query = bind_value(query, value);
    }
    query.bind(record.id.as_str()).execute(&mut *conn).await?;
    Ok(())
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &'q ColumnValue) -> SqliteQuery<'q> {
    match value {
        ColumnValue::Null => query.bind(None::<String>),
        ColumnValue::Text(s) => query.bind(s.as_str()),
        ColumnValue::Integer(i) => query.bind(*i),
        ColumnValue::Real(f) => query.bind(*f),
        ColumnValue::Bool(b) => query.bind(i64::from(*b)),
        ColumnValue::Timestamp(ts) => query.bind(format_timestamp(ts)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities;
    use crate::migrate::ensure_storage_ready;
    use crate::models::EntityType;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn reconciler() -> (Reconciler, SqlitePool) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        ensure_storage_ready(&pool).await.unwrap();
        (Reconciler::new(pool.clone()), pool)
    }

    fn contact(id: &str, email: Option<&str>, title: Option<&str>) -> MappedRecord {
        let def = entities::definition(EntityType::Contacts);
        def.map(&json!({
            "id": id,
            "Email": email,
            "Title": title,
            "Modified_Time": "2024-01-15T10:00:00Z"
        }))
        .unwrap()
    }

    async fn title_of(pool: &SqlitePool, id: &str) -> Option<String> {
        sqlx::query_scalar("SELECT title FROM contacts WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn inserts_then_updates_by_identifier() {
        let (rec, pool) = reconciler().await;
        let def = entities::definition(EntityType::Contacts);

        let stats = rec
            .apply_batch(def, &[contact("1", Some("a@x.io"), Some("Intern"))])
            .await
            .unwrap();
        assert_eq!(stats, ReconcileStats { inserted: 1, updated: 0 });

        let stats = rec
            .apply_batch(def, &[contact("1", Some("a@x.io"), Some("Analyst"))])
            .await
            .unwrap();
        assert_eq!(stats, ReconcileStats { inserted: 0, updated: 1 });
        assert_eq!(rec.count(def).await.unwrap(), 1);
        assert_eq!(title_of(&pool, "1").await.as_deref(), Some("Analyst"));
    }

    #[tokio::test]
    async fn applying_twice_is_idempotent() {
        let (rec, pool) = reconciler().await;
        let def = entities::definition(EntityType::Contacts);
        let batch = [contact("1", Some("a@x.io"), Some("Intern"))];

        rec.apply_batch(def, &batch).await.unwrap();
        let before: (Option<String>, Option<String>, i64) =
            sqlx::query_as("SELECT email, modified_time, email_opt_out FROM contacts WHERE id = '1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        rec.apply_batch(def, &batch).await.unwrap();
        let after: (Option<String>, Option<String>, i64) =
            sqlx::query_as("SELECT email, modified_time, email_opt_out FROM contacts WHERE id = '1'")
                .fetch_one(&pool)
                .await
                .unwrap();

        assert_eq!(before, after);
        assert_eq!(rec.count(def).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn full_replace_overwrites_with_null() {
        let (rec, pool) = reconciler().await;
        let def = entities::definition(EntityType::Contacts);

        rec.apply_batch(def, &[contact("1", Some("a@x.io"), Some("Intern"))])
            .await
            .unwrap();
        rec.apply_batch(def, &[contact("1", Some("a@x.io"), None)])
            .await
            .unwrap();

        assert_eq!(title_of(&pool, "1").await, None);
    }

    #[tokio::test]
    async fn failing_record_rolls_back_whole_batch() {
        let (rec, pool) = reconciler().await;
        let def = entities::definition(EntityType::Contacts);
        sqlx::query(
            "CREATE TRIGGER reject_bad BEFORE INSERT ON contacts \
             WHEN NEW.id = 'bad' BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(&pool)
        .await
        .unwrap();

        let batch = [
            contact("1", Some("a@x.io"), None),
            contact("2", Some("b@x.io"), None),
            contact("bad", None, None),
        ];
        assert!(rec.apply_batch(def, &batch).await.is_err());
        assert_eq!(rec.count(def).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn patch_preserves_absent_fields() {
        let (rec, pool) = reconciler().await;
        let def = entities::definition(EntityType::Contacts);
        rec.apply_batch(def, &[contact("1", Some("a@x.io"), Some("Intern"))])
            .await
            .unwrap();

        let outcome = rec
            .patch(
                def,
                "1",
                &[
                    ("email", ColumnValue::Text("new@x.io".into())),
                    ("title", ColumnValue::Null),
                    ("phone", ColumnValue::Text("   ".into())),
                ],
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PatchOutcome::Updated {
                columns: vec!["email".to_string()]
            }
        );
        assert_eq!(title_of(&pool, "1").await.as_deref(), Some("Intern"));
        let email: String = sqlx::query_scalar("SELECT email FROM contacts WHERE id = '1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(email, "new@x.io");
    }

    #[tokio::test]
    async fn patch_never_creates_rows() {
        let (rec, _pool) = reconciler().await;
        let def = entities::definition(EntityType::Contacts);
        let outcome = rec
            .patch(def, "404", &[("email", ColumnValue::Text("x@x.io".into()))])
            .await
            .unwrap();
        assert_eq!(outcome, PatchOutcome::NotFound);
        assert_eq!(rec.count(def).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn patch_ignores_unknown_and_identifier_columns() {
        let (rec, _pool) = reconciler().await;
        let def = entities::definition(EntityType::Contacts);
        rec.apply_batch(def, &[contact("1", None, None)]).await.unwrap();
        let outcome = rec
            .patch(
                def,
                "1",
                &[
                    ("id", ColumnValue::Text("2".into())),
                    ("nickname", ColumnValue::Text("Ada".into())),
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcome, PatchOutcome::Updated { columns: vec![] });
    }
}
