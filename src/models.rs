//! Core data models used throughout the sync pipeline.
//!
//! These types describe what flows between the components: which entity
//! type is being synchronized, the mapped local row, the persisted tracker
//! state, and the rows written by document ingestion.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset};
use serde::Serialize;

use crate::timefmt::format_timestamp;

/// One of the three synchronized record categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Contacts,
    Accounts,
    InternRoles,
}

impl EntityType {
    /// Order used by `sync all`.
    pub const ALL: [EntityType; 3] = [
        EntityType::Contacts,
        EntityType::Accounts,
        EntityType::InternRoles,
    ];

    /// Identifier used as the tracker key and CLI argument.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Contacts => "contacts",
            EntityType::Accounts => "accounts",
            EntityType::InternRoles => "intern_roles",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contacts" => Ok(EntityType::Contacts),
            "accounts" => Ok(EntityType::Accounts),
            "intern_roles" | "intern-roles" => Ok(EntityType::InternRoles),
            other => anyhow::bail!(
                "Unknown entity type: '{}'. Available: contacts, accounts, intern_roles",
                other
            ),
        }
    }
}

/// Persisted sync progress for one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncTracker {
    pub entity_type: EntityType,
    /// Maximum modification time among the records of the last successful
    /// run. `None` until a run has seen a timestamped record.
    pub last_sync_timestamp: Option<DateTime<FixedOffset>>,
    /// Records processed by the last run. Observability only.
    pub records_synced: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// A single scalar destined for one local column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Bool(bool),
    Timestamp(DateTime<FixedOffset>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Null or an empty/blank string. Patch updates skip these.
    pub fn is_empty(&self) -> bool {
        match self {
            ColumnValue::Null => true,
            ColumnValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<&DateTime<FixedOffset>> {
        match self {
            ColumnValue::Timestamp(ts) => Some(ts),
            _ => None,
        }
    }

    /// Textual form used when a timestamp is bound to a TEXT column.
    pub fn timestamp_text(&self) -> Option<String> {
        self.as_timestamp().map(format_timestamp)
    }
}

/// One local row produced by the entity mapper.
///
/// Columns keep the order of the entity's mapping table; the identifier is
/// held separately because it is never overwritten.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub id: String,
    pub columns: Vec<(&'static str, ColumnValue)>,
}

impl MappedRecord {
    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.columns
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, value)| value)
    }
}

/// Whether the orchestrator consults the tracker before fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Incremental,
    Full,
}

/// Outcome of one successful orchestrator run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub entity: EntityType,
    pub mode: SyncMode,
    /// Criteria string sent to the source, if any.
    pub criteria: Option<String>,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Watermark after the run (unchanged when nothing was fetched).
    pub watermark: Option<String>,
    pub tracker_advanced: bool,
}

/// A downloaded attachment recorded in the `documents` table.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub id: i64,
    pub contact_id: String,
    pub attachment_id: Option<String>,
    pub document_name: String,
    pub document_type: String,
    pub file_path: String,
    pub file_size: i64,
}

/// A skill extracted from a contact's document.
#[derive(Debug, Clone, Serialize)]
pub struct SkillRecord {
    pub id: i64,
    pub contact_id: String,
    pub document_id: i64,
    pub skill_name: String,
    pub category: String,
    pub proficiency_level: String,
    pub years_experience: Option<i64>,
    pub confidence_score: f64,
    pub extraction_method: String,
    pub created_at: String,
}
