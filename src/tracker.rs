//! Sync tracker store.
//!
//! One row per entity type in `sync_tracker`. The orchestrator reads it
//! before fetching and writes it only after the entity batch has been
//! committed; nothing touches it mid-batch.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use sqlx::{Row, SqlitePool};

use crate::models::{EntityType, SyncTracker};
use crate::timefmt::{format_timestamp, now_string, parse_timestamp};

#[async_trait]
pub trait TrackerStore: Send + Sync {
    /// Current tracker state; `None` means the entity was never synced.
    async fn get(&self, entity: EntityType) -> Result<Option<SyncTracker>, sqlx::Error>;

    /// Create or overwrite the tracker row for `entity`.
    async fn update(
        &self,
        entity: EntityType,
        timestamp: Option<DateTime<FixedOffset>>,
        records_synced: i64,
    ) -> Result<(), sqlx::Error>;

    /// Every tracker row, ordered by entity type.
    async fn list(&self) -> Result<Vec<SyncTracker>, sqlx::Error>;
}

#[derive(Clone)]
pub struct SqliteTrackerStore {
    pool: SqlitePool,
}

impl SqliteTrackerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrackerStore for SqliteTrackerStore {
    async fn get(&self, entity: EntityType) -> Result<Option<SyncTracker>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT entity_type, last_sync_timestamp, records_synced, created_at, updated_at \
             FROM sync_tracker WHERE entity_type = ?",
        )
        .bind(entity.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| tracker_from_row(&r, entity)).transpose()
    }

    async fn update(
        &self,
        entity: EntityType,
        timestamp: Option<DateTime<FixedOffset>>,
        records_synced: i64,
    ) -> Result<(), sqlx::Error> {
        let now = now_string();
        sqlx::query(
            r#"
            INSERT INTO sync_tracker (entity_type, last_sync_timestamp, records_synced, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(entity_type) DO UPDATE SET
                last_sync_timestamp = excluded.last_sync_timestamp,
                records_synced = excluded.records_synced,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(entity.as_str())
        .bind(timestamp.as_ref().map(format_timestamp))
        .bind(records_synced)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SyncTracker>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT entity_type, last_sync_timestamp, records_synced, created_at, updated_at \
             FROM sync_tracker ORDER BY entity_type",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut trackers = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.try_get("entity_type")?;
            // Rows for unknown entity types are left alone.
            if let Ok(entity) = name.parse::<EntityType>() {
                trackers.push(tracker_from_row(row, entity)?);
            }
        }
        Ok(trackers)
    }
}

fn tracker_from_row(
    row: &sqlx::sqlite::SqliteRow,
    entity: EntityType,
) -> Result<SyncTracker, sqlx::Error> {
    let raw_ts: Option<String> = row.try_get("last_sync_timestamp")?;
    Ok(SyncTracker {
        entity_type: entity,
        last_sync_timestamp: raw_ts.as_deref().and_then(parse_timestamp),
        records_synced: row.try_get("records_synced")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
