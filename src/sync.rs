//! Sync orchestrator.
//!
//! One run per entity type, strictly sequential:
//!
//! ```text
//! ensure storage ready → read tracker → build criteria → fetch (sorted by
//! Modified_Time asc) → map every record → reconcile in one transaction →
//! advance watermark
//! ```
//!
//! A run either returns a [`SyncReport`] or a [`SyncError`] naming the stage
//! that failed. The tracker is written only after the batch commit, and
//! only when the fetch returned records. The new watermark is the maximum
//! modification time of the committed batch, never wall-clock time, and
//! never lower than the previous watermark.
//!
//! No lock is taken against concurrent runs for the same entity type;
//! callers serialize invocations.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, FixedOffset};
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::attachments::DocumentPipeline;
use crate::config::Config;
use crate::criteria;
use crate::crm_client::{CrmClient, Credentials};
use crate::db;
use crate::entities::{self, EntityDef, MODIFIED_COLUMN, MODIFIED_FIELD};
use crate::error::SyncError;
use crate::migrate::ensure_storage_ready;
use crate::models::{ColumnValue, EntityType, MappedRecord, SyncMode, SyncReport};
use crate::progress::{NoProgress, ProgressMode, SyncProgressEvent, SyncProgressReporter};
use crate::reconcile::Reconciler;
use crate::source::{FetchRequest, RecordSource, SortOrder, SortSpec};
use crate::timefmt::format_timestamp;
use crate::tracker::{SqliteTrackerStore, TrackerStore};

/// A committed run together with the records it applied.
#[derive(Debug)]
pub struct SyncOutcome {
    pub report: SyncReport,
    pub records: Vec<MappedRecord>,
}

pub struct SyncEngine {
    pool: SqlitePool,
    source: Arc<dyn RecordSource>,
    trackers: Arc<dyn TrackerStore>,
    reconciler: Reconciler,
    progress: Arc<dyn SyncProgressReporter>,
}

impl SyncEngine {
    pub fn new(
        pool: SqlitePool,
        source: Arc<dyn RecordSource>,
        trackers: Arc<dyn TrackerStore>,
    ) -> Self {
        let reconciler = Reconciler::new(pool.clone());
        Self {
            pool,
            source,
            trackers,
            reconciler,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub async fn sync_contacts(&self, mode: SyncMode) -> Result<SyncReport, SyncError> {
        self.sync_entity(EntityType::Contacts, mode).await
    }

    pub async fn sync_accounts(&self, mode: SyncMode) -> Result<SyncReport, SyncError> {
        self.sync_entity(EntityType::Accounts, mode).await
    }

    pub async fn sync_intern_roles(&self, mode: SyncMode) -> Result<SyncReport, SyncError> {
        self.sync_entity(EntityType::InternRoles, mode).await
    }

    pub async fn sync_entity(
        &self,
        entity: EntityType,
        mode: SyncMode,
    ) -> Result<SyncReport, SyncError> {
        self.sync_entity_batch(entity, mode)
            .await
            .map(|outcome| outcome.report)
    }

    /// Same as [`SyncEngine::sync_entity`], also handing back the applied
    /// records for post-commit side effects.
    pub async fn sync_entity_batch(
        &self,
        entity: EntityType,
        mode: SyncMode,
    ) -> Result<SyncOutcome, SyncError> {
        let def = entities::definition(entity);

        // 1. Pre-check
        ensure_storage_ready(&self.pool)
            .await
            .map_err(SyncError::Schema)?;

        // 2. Window. The previous watermark is read in both modes so a full
        // re-sync never moves it backwards.
        let tracker = self
            .trackers
            .get(entity)
            .await
            .map_err(|source| SyncError::TrackerRead { entity, source })?;
        let previous = tracker.as_ref().and_then(|t| t.last_sync_timestamp);
        let criteria = match mode {
            SyncMode::Incremental => criteria::from_tracker(tracker.as_ref()),
            SyncMode::Full => None,
        };

        // 3. Fetch
        self.progress.report(SyncProgressEvent::Fetching {
            entity,
            incremental: criteria.is_some(),
        });
        let request = fetch_request(def, criteria.clone());
        let raw = self
            .source
            .fetch_all(&request)
            .await
            .map_err(|source| SyncError::Fetch { entity, source })?;
        info!(
            entity = %entity,
            fetched = raw.len(),
            criteria = criteria.as_deref().unwrap_or("none"),
            "fetched records"
        );

        let mut report = SyncReport {
            entity,
            mode,
            criteria,
            fetched: raw.len(),
            inserted: 0,
            updated: 0,
            watermark: previous.as_ref().map(format_timestamp),
            tracker_advanced: false,
        };

        if raw.is_empty() {
            info!(entity = %entity, "nothing to sync, tracker unchanged");
            return Ok(SyncOutcome {
                report,
                records: Vec::new(),
            });
        }

        // 4. Transform. One bad record fails the whole batch.
        let records = raw
            .iter()
            .map(|record| def.map(record))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| SyncError::Mapping { entity, source })?;
        drop(raw);

        // 5. Reconcile
        self.progress.report(SyncProgressEvent::Reconciling {
            entity,
            total: records.len() as u64,
        });
        let stats = self
            .reconciler
            .apply_batch(def, &records)
            .await
            .map_err(|source| SyncError::Reconcile { entity, source })?;
        self.progress.report(SyncProgressEvent::Committed {
            entity,
            inserted: stats.inserted as u64,
            updated: stats.updated as u64,
        });
        report.inserted = stats.inserted;
        report.updated = stats.updated;

        // 6. Advance watermark
        let watermark = advance_watermark(previous, batch_max_modified(&records));
        if watermark.is_none() {
            warn!(entity = %entity, "no record carried a modification time");
        }
        if let Err(source) = self
            .trackers
            .update(entity, watermark, records.len() as i64)
            .await
        {
            error!(entity = %entity, error = %source, "tracker update failed after commit");
            return Err(SyncError::Tracker { entity, source });
        }
        report.watermark = watermark.as_ref().map(format_timestamp);
        report.tracker_advanced = watermark != previous;

        info!(
            entity = %entity,
            inserted = report.inserted,
            updated = report.updated,
            watermark = report.watermark.as_deref().unwrap_or("none"),
            "sync committed"
        );
        Ok(SyncOutcome { report, records })
    }
}

fn fetch_request(def: &EntityDef, criteria: Option<String>) -> FetchRequest {
    FetchRequest {
        module: def.module.to_string(),
        fields: def.fetch_fields().into_iter().map(String::from).collect(),
        criteria,
        sort: Some(SortSpec {
            field: MODIFIED_FIELD.to_string(),
            order: SortOrder::Asc,
        }),
    }
}

/// Latest modification time in a mapped batch, if any record has one.
pub fn batch_max_modified(records: &[MappedRecord]) -> Option<DateTime<FixedOffset>> {
    records
        .iter()
        .filter_map(|r| r.get(MODIFIED_COLUMN).and_then(ColumnValue::as_timestamp))
        .max()
        .copied()
}

/// The watermark after a committed batch: never lower than `previous`.
pub fn advance_watermark(
    previous: Option<DateTime<FixedOffset>>,
    batch_max: Option<DateTime<FixedOffset>>,
) -> Option<DateTime<FixedOffset>> {
    match (previous, batch_max) {
        (Some(p), Some(b)) if b > p => Some(b),
        (Some(p), _) => Some(p),
        (None, b) => b,
    }
}

// ============ CLI entry points ============

/// Which entity types `crmsync sync <target>` covers.
pub fn parse_target(target: &str) -> Result<Vec<EntityType>> {
    if target == "all" {
        return Ok(EntityType::ALL.to_vec());
    }
    match target.parse::<EntityType>() {
        Ok(entity) => Ok(vec![entity]),
        Err(_) => bail!(
            "Unknown sync target: '{}'. Available: contacts, accounts, intern_roles, all",
            target
        ),
    }
}

pub async fn run_sync(config: &Config, target: &str, full: bool, progress: ProgressMode) -> Result<()> {
    let targets = parse_target(target)?;
    let pool = db::connect(config).await?;
    let client = Arc::new(CrmClient::new(&config.crm, Credentials::from_env()?)?);
    let engine = SyncEngine::new(
        pool.clone(),
        client.clone(),
        Arc::new(SqliteTrackerStore::new(pool.clone())),
    )
    .with_progress(progress.reporter());
    let mode = if full {
        SyncMode::Full
    } else {
        SyncMode::Incremental
    };

    let mut failed = Vec::new();
    for entity in targets {
        match engine.sync_entity_batch(entity, mode).await {
            Ok(outcome) => {
                print_report(&outcome.report);
                if entity == EntityType::Contacts && config.documents.ingest_after_sync {
                    ingest_ready_contacts(config, &pool, client.clone(), &outcome.records).await;
                }
            }
            Err(e) => {
                eprintln!("sync {} failed: {}", entity, e);
                if e.batch_committed() {
                    eprintln!("  batch was committed; the next run will re-apply it");
                }
                failed.push(entity);
            }
        }
    }

    pool.close().await;

    if !failed.is_empty() {
        let names: Vec<_> = failed.iter().map(|e| e.as_str()).collect();
        bail!("sync failed for: {}", names.join(", "));
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    let mode = match report.mode {
        SyncMode::Incremental => "incremental",
        SyncMode::Full => "full",
    };
    println!("sync {} ({})", report.entity, mode);
    match &report.criteria {
        Some(c) => println!("  criteria: {}", c),
        None => println!("  criteria: none (full fetch)"),
    }
    println!("  fetched: {} records", report.fetched);
    println!("  inserted: {}", report.inserted);
    println!("  updated: {}", report.updated);
    match (&report.watermark, report.tracker_advanced) {
        (Some(w), true) => println!("  watermark: {}", w),
        (Some(w), false) => println!("  watermark: {} (unchanged)", w),
        (None, _) => println!("  watermark: none"),
    }
    println!("ok");
}

/// Post-sync document ingestion for contacts that reached the trigger
/// stage. Failures are logged; the sync result stands.
async fn ingest_ready_contacts(
    config: &Config,
    pool: &SqlitePool,
    client: Arc<CrmClient>,
    records: &[MappedRecord],
) {
    let trigger = config.webhook.trigger_stage.as_str();
    let ready: Vec<&MappedRecord> = records
        .iter()
        .filter(|r| r.get("role_success_stage").and_then(ColumnValue::as_text) == Some(trigger))
        .collect();
    if ready.is_empty() {
        return;
    }

    let pipeline = match DocumentPipeline::start(config, pool.clone(), client) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "document ingestion unavailable");
            return;
        }
    };

    let mut downloaded = 0usize;
    for record in ready {
        let name = contact_display_name(record);
        match pipeline
            .ingestor
            .ingest_contact(&record.id, name.as_deref())
            .await
        {
            Ok(docs) => downloaded += docs.len(),
            Err(e) => warn!(contact_id = %record.id, error = %e, "document ingestion failed"),
        }
    }
    pipeline.finish().await;
    println!("  documents downloaded: {}", downloaded);
}

fn contact_display_name(record: &MappedRecord) -> Option<String> {
    if let Some(full) = record.get("full_name").and_then(ColumnValue::as_text) {
        if !full.trim().is_empty() {
            return Some(full.to_string());
        }
    }
    let parts: Vec<&str> = ["first_name", "last_name"]
        .iter()
        .filter_map(|c| record.get(c).and_then(ColumnValue::as_text))
        .filter(|s| !s.trim().is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_storage_ready(&pool).await?;
    let store = SqliteTrackerStore::new(pool.clone());
    let trackers = store.list().await?;
    let reconciler = Reconciler::new(pool.clone());

    println!("{:<14} {:<27} {:>8} {:>8}  updated at", "entity", "watermark", "last run", "rows");
    for entity in EntityType::ALL {
        let rows = reconciler.count(entities::definition(entity)).await?;
        match trackers.iter().find(|t| t.entity_type == entity) {
            Some(t) => println!(
                "{:<14} {:<27} {:>8} {:>8}  {}",
                entity.as_str(),
                t.last_sync_timestamp
                    .as_ref()
                    .map(format_timestamp)
                    .unwrap_or_else(|| "-".to_string()),
                t.records_synced,
                rows,
                t.updated_at
            ),
            None => println!(
                "{:<14} {:<27} {:>8} {:>8}  never synced",
                entity.as_str(),
                "-",
                "-",
                rows
            ),
        }
    }

    pool.close().await;
    Ok(())
}
