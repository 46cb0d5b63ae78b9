//! Error taxonomy for the synchronization engine.
//!
//! Each variant of [`SyncError`] corresponds to one stage of a sync run
//! and tells the caller what state local storage was left in:
//!
//! | Variant | Local writes | Tracker |
//! |---------|--------------|---------|
//! | [`SyncError::Schema`] | none | untouched |
//! | [`SyncError::TrackerRead`] | none | untouched |
//! | [`SyncError::Fetch`] | none | untouched |
//! | [`SyncError::Mapping`] | none | untouched |
//! | [`SyncError::Reconcile`] | rolled back | untouched |
//! | [`SyncError::Tracker`] | committed | previous value stays authoritative |
//!
//! A run that fails with `Tracker` is safe to retry: the next run refetches
//! the same records and re-applies them by identifier.

use thiserror::Error;

use crate::models::EntityType;

/// Failure reported by a record or attachment source.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response shape: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

/// A remote record that cannot be mapped at all.
///
/// Only the identifier is strictly required; every other field degrades
/// to null (or `false` for booleans) instead of failing.
#[derive(Debug, Error, PartialEq)]
pub enum MappingError {
    #[error("record has no `{field}` identifier")]
    MissingIdentifier { field: &'static str },

    #[error("record identifier `{field}` is not a string or integer: {found}")]
    InvalidIdentifier { field: &'static str, found: String },

    #[error("remote record is not an object: {0}")]
    NotAnObject(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage schema is not ready: {0}")]
    Schema(#[source] sqlx::Error),

    #[error("reading the {entity} tracker failed: {source}")]
    TrackerRead {
        entity: EntityType,
        #[source]
        source: sqlx::Error,
    },

    #[error("fetching {entity} failed: {source}")]
    Fetch {
        entity: EntityType,
        #[source]
        source: FetchError,
    },

    #[error("mapping {entity} failed: {source}")]
    Mapping {
        entity: EntityType,
        #[source]
        source: MappingError,
    },

    #[error("reconciling {entity} failed, batch rolled back: {source}")]
    Reconcile {
        entity: EntityType,
        #[source]
        source: sqlx::Error,
    },

    #[error("updating the {entity} tracker failed after commit: {source}")]
    Tracker {
        entity: EntityType,
        #[source]
        source: sqlx::Error,
    },
}

impl SyncError {
    /// Whether the entity batch was durably committed before the failure.
    pub fn batch_committed(&self) -> bool {
        matches!(self, SyncError::Tracker { .. })
    }
}
