//! Incremental criteria builder.
//!
//! Turns a tracker watermark into the record source's filter syntax:
//! `(Modified_Time:greater_than:2024-01-15T10:00:00+00:00)`. The offset
//! is always rendered in the colon form `+HH:MM`; the CRM rejects `+0000`.

use chrono::{DateTime, FixedOffset};

use crate::entities::MODIFIED_FIELD;
use crate::models::SyncTracker;
use crate::timefmt::format_timestamp;

/// Criteria string for "modified strictly after `ts`".
pub fn modified_after(ts: &DateTime<FixedOffset>) -> String {
    format!("({}:greater_than:{})", MODIFIED_FIELD, format_timestamp(ts))
}

/// Criteria for the next incremental fetch, or `None` for a full fetch.
pub fn from_tracker(tracker: Option<&SyncTracker>) -> Option<String> {
    tracker
        .and_then(|t| t.last_sync_timestamp.as_ref())
        .map(modified_after)
}
