//! Sync progress reporting.
//!
//! Reports observable progress during `crmsync sync` so operators see which
//! entity is being fetched, whether the run is incremental, and how many
//! records were applied. Progress is emitted on **stderr** so stdout
//! remains parseable for scripts.

use std::io::Write;
use std::sync::Arc;

use crate::models::EntityType;

/// A single progress event for one entity run.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    /// Pulling pages from the CRM. `incremental` is false on a full fetch.
    Fetching { entity: EntityType, incremental: bool },
    /// Applying the fetched batch inside one transaction.
    Reconciling { entity: EntityType, total: u64 },
    /// Batch committed.
    Committed {
        entity: EntityType,
        inserted: u64,
        updated: u64,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync contacts  reconciling  1,234 records".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Fetching {
                entity,
                incremental,
            } => {
                let window = if *incremental { "incremental" } else { "full" };
                format!("sync {}  fetching ({})...\n", entity, window)
            }
            SyncProgressEvent::Reconciling { entity, total } => {
                format!(
                    "sync {}  reconciling  {} records\n",
                    entity,
                    format_number(*total)
                )
            }
            SyncProgressEvent::Committed {
                entity,
                inserted,
                updated,
            } => format!(
                "sync {}  committed  {} inserted, {} updated\n",
                entity,
                format_number(*inserted),
                format_number(*updated)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Fetching {
                entity,
                incremental,
            } => serde_json::json!({
                "event": "progress",
                "entity": entity,
                "phase": "fetching",
                "incremental": incremental
            }),
            SyncProgressEvent::Reconciling { entity, total } => serde_json::json!({
                "event": "progress",
                "entity": entity,
                "phase": "reconciling",
                "total": total
            }),
            SyncProgressEvent::Committed {
                entity,
                inserted,
                updated,
            } => serde_json::json!({
                "event": "progress",
                "entity": entity,
                "phase": "committed",
                "inserted": inserted,
                "updated": updated
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "off" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => anyhow::bail!(
                "Unknown progress mode: '{}'. Must be off, human, or json.",
                other
            ),
        }
    }

    /// Build a reporter for this mode. The orchestrator shares it.
    pub fn reporter(&self) -> Arc<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}
