//! Record and attachment source abstractions.
//!
//! The orchestrator only knows [`RecordSource`]; the HTTP client in
//! [`crate::crm_client`] is one implementation, test mocks are another.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

pub use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub order: SortOrder,
}

/// One complete fetch for an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Remote module name, e.g. `Contacts`.
    pub module: String,
    pub fields: Vec<String>,
    /// Filter expression; `None` fetches every record.
    pub criteria: Option<String>,
    pub sort: Option<SortSpec>,
}

/// Yields every matching remote record, paging internally until the
/// source signals that no more pages remain.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_all(&self, request: &FetchRequest) -> Result<Vec<Value>, FetchError>;

    /// One record by identifier; `None` when the remote has no such record.
    async fn fetch_record(&self, module: &str, id: &str) -> Result<Option<Value>, FetchError>;
}

/// Metadata of one attachment on a remote record.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AttachmentInfo {
    pub id: String,
    #[serde(rename = "File_Name")]
    pub file_name: String,
    #[serde(rename = "Size", default)]
    pub size: Option<Value>,
    #[serde(rename = "$type", default)]
    pub kind: Option<String>,
}

#[async_trait]
pub trait AttachmentSource: Send + Sync {
    async fn list_attachments(&self, contact_id: &str) -> Result<Vec<AttachmentInfo>, FetchError>;

    async fn download_attachment(
        &self,
        contact_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, FetchError>;
}
