//! Contact-changed notifications.
//!
//! The CRM posts a notification whenever a contact changes. Payloads come
//! as JSON or form-encoded bodies and in several shapes: a record list, a
//! single record, a bare record, or only an `ids` reference. This module
//! turns any of them into a [`ContactEvent`], patches the local contact and,
//! when the contact reaches the trigger stage, ingests its documents.
//!
//! The patch only writes non-empty values (see [`Reconciler::patch`]), so a
//! sparse notification never clears fields that a bulk sync stored.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::Sha256;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::attachments::DocumentIngestor;
use crate::entities;
use crate::models::{ColumnValue, EntityType};
use crate::reconcile::{PatchOutcome, Reconciler};
use crate::source::RecordSource;
use crate::timefmt::parse_timestamp;

type HmacSha256 = Hmac<Sha256>;

const UNKNOWN_NAME: &str = "Unknown";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("unexpected webhook data structure")]
    UnexpectedShape,

    #[error("webhook payload carries no contact id")]
    MissingContactId,

    #[error("updating local contact failed: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("document ingestion failed: {0}")]
    Ingest(#[source] anyhow::Error),
}

/// Check `signature` (hex) against the HMAC-SHA256 of `body`.
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Decode a notification body.
///
/// Raw JSON is tried first. Form bodies are accepted when the content type
/// says so: a `data` field holding JSON wins, otherwise the pairs become an
/// object. Returns `None` when nothing usable was sent.
pub fn decode_payload(body: &[u8], content_type: Option<&str>) -> Option<Value> {
    let decoded = match serde_json::from_slice::<Value>(body) {
        Ok(value) => value,
        Err(_) => {
            let is_form = content_type
                .map(|ct| ct.contains("application/x-www-form-urlencoded"))
                .unwrap_or(false);
            if !is_form {
                return None;
            }
            let pairs: Map<String, Value> = url::form_urlencoded::parse(body)
                .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
                .collect();
            match pairs.get("data").and_then(Value::as_str) {
                Some(data) => serde_json::from_str(data).unwrap_or(Value::Object(pairs)),
                None => Value::Object(pairs),
            }
        }
    };

    match &decoded {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        Value::Array(items) if items.is_empty() => None,
        _ => Some(decoded),
    }
}

/// Contact fields carried by a notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContactEvent {
    pub id: Option<String>,
    pub name: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role_success_stage: Option<String>,
    pub modified_time: Option<String>,
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First non-empty value among `keys`.
fn first_of(record: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| record.get(*k).and_then(scalar_text))
}

impl ContactEvent {
    /// Read a contact out of any supported payload shape.
    pub fn from_payload(payload: &Value) -> Result<Self, WebhookError> {
        let record = match payload.get("data") {
            Some(Value::Array(items)) => items.first(),
            Some(data @ Value::Object(_)) => Some(data),
            Some(_) => None,
            None => Some(payload),
        }
        .and_then(Value::as_object)
        .ok_or(WebhookError::UnexpectedShape)?;

        let id = match payload.get("ids") {
            Some(Value::String(ids)) if !ids.trim().is_empty() => Some(ids.trim().to_string()),
            _ => first_of(record, &["id", "ID"]),
        };

        let first_name = first_of(record, &["First_Name", "first_name", "firstName"]);
        let last_name = first_of(record, &["Last_Name", "last_name", "lastName"]);
        let name = first_of(record, &["Full_Name", "name", "fullName"]).unwrap_or_else(|| {
            let parts: Vec<&str> = [&first_name, &last_name]
                .into_iter()
                .filter_map(|p| p.as_deref())
                .collect();
            if parts.is_empty() {
                UNKNOWN_NAME.to_string()
            } else {
                parts.join(" ")
            }
        });

        Ok(Self {
            id,
            name,
            first_name,
            last_name,
            email: first_of(record, &["Email", "email"]),
            phone: first_of(record, &["Phone", "phone"]),
            role_success_stage: first_of(
                record,
                &[
                    "Role_Success_Stage",
                    "role_success_stage",
                    "Role_Success_Stage__c",
                    "stage",
                ],
            ),
            modified_time: first_of(record, &["Modified_Time", "modified_time", "updatedTime"]),
        })
    }

    /// The notification lacks what ingestion decisions need.
    pub fn is_incomplete(&self) -> bool {
        self.role_success_stage.is_none() || self.name == UNKNOWN_NAME
    }

    /// Fill fields that are missing here from `other`.
    pub fn fill_missing(&mut self, other: ContactEvent) {
        fn fill(slot: &mut Option<String>, value: Option<String>) {
            if slot.is_none() {
                *slot = value;
            }
        }
        fill(&mut self.id, other.id);
        fill(&mut self.first_name, other.first_name);
        fill(&mut self.last_name, other.last_name);
        fill(&mut self.email, other.email);
        fill(&mut self.phone, other.phone);
        fill(&mut self.role_success_stage, other.role_success_stage);
        fill(&mut self.modified_time, other.modified_time);
        if self.name == UNKNOWN_NAME && other.name != UNKNOWN_NAME {
            self.name = other.name;
        }
    }

    /// Column values for a patch update of the local contact.
    pub fn patch_values(&self) -> Vec<(&'static str, ColumnValue)> {
        let text = |v: &Option<String>| match v {
            Some(s) => ColumnValue::Text(s.clone()),
            None => ColumnValue::Null,
        };
        let mut values = vec![
            ("first_name", text(&self.first_name)),
            ("last_name", text(&self.last_name)),
            ("email", text(&self.email)),
            ("phone", text(&self.phone)),
            ("role_success_stage", text(&self.role_success_stage)),
        ];
        if self.name != UNKNOWN_NAME {
            values.push(("full_name", ColumnValue::Text(self.name.clone())));
        }
        if let Some(ts) = self.modified_time.as_deref().and_then(parse_timestamp) {
            values.push(("modified_time", ColumnValue::Timestamp(ts)));
        }
        values
    }
}

/// Body of a processed notification.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub message: String,
    pub contact_id: String,
    pub contact_name: String,
    /// `updated` or `not_found`.
    pub local_contact: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded_files: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_count: Option<usize>,
}

pub struct ContactWebhook {
    reconciler: Reconciler,
    source: Arc<dyn RecordSource>,
    ingestor: Option<Arc<DocumentIngestor>>,
    trigger_stage: String,
}

impl ContactWebhook {
    pub fn new(
        pool: SqlitePool,
        source: Arc<dyn RecordSource>,
        ingestor: Option<Arc<DocumentIngestor>>,
        trigger_stage: impl Into<String>,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(pool),
            source,
            ingestor,
            trigger_stage: trigger_stage.into(),
        }
    }

    pub async fn handle(&self, payload: &Value) -> Result<WebhookResponse, WebhookError> {
        let mut event = ContactEvent::from_payload(payload)?;
        let contact_id = event.id.clone().ok_or(WebhookError::MissingContactId)?;
        debug!(contact_id = %contact_id, ?event, "contact notification decoded");

        if event.is_incomplete() {
            self.complete_from_source(&contact_id, &mut event).await;
        }

        let stage = event.role_success_stage.clone();
        info!(contact_id = %contact_id, name = %event.name, stage = ?stage, "contact changed");

        let def = entities::definition(EntityType::Contacts);
        let local_contact = match self
            .reconciler
            .patch(def, &contact_id, &event.patch_values())
            .await?
        {
            PatchOutcome::Updated { columns } => {
                debug!(contact_id = %contact_id, ?columns, "local contact patched");
                "updated"
            }
            PatchOutcome::NotFound => {
                warn!(contact_id = %contact_id, "contact not found in local store");
                "not_found"
            }
        };

        if stage.as_deref() != Some(self.trigger_stage.as_str()) {
            return Ok(WebhookResponse {
                status: "success",
                message: format!(
                    "Contact updated but no document download triggered (stage: {})",
                    stage.as_deref().unwrap_or("none")
                ),
                contact_id,
                contact_name: event.name,
                local_contact,
                downloaded_files: None,
                files_count: None,
            });
        }

        let downloaded_files = match &self.ingestor {
            Some(ingestor) => ingestor
                .ingest_contact(&contact_id, Some(event.name.as_str()).filter(|n| *n != UNKNOWN_NAME))
                .await
                .map_err(WebhookError::Ingest)?
                .into_iter()
                .map(|doc| doc.file_path)
                .collect(),
            None => {
                warn!("document ingestion not configured");
                Vec::new()
            }
        };
        info!(contact_id = %contact_id, files = downloaded_files.len(), "trigger stage processed");

        Ok(WebhookResponse {
            status: "success",
            message: format!("Processed {} trigger for {}", self.trigger_stage, event.name),
            contact_id,
            contact_name: event.name,
            local_contact,
            files_count: Some(downloaded_files.len()),
            downloaded_files: Some(downloaded_files),
        })
    }

    async fn complete_from_source(&self, contact_id: &str, event: &mut ContactEvent) {
        let module = entities::definition(EntityType::Contacts).module;
        match self.source.fetch_record(module, contact_id).await {
            Ok(Some(record)) => match ContactEvent::from_payload(&record) {
                Ok(full) => event.fill_missing(full),
                Err(e) => warn!(contact_id, error = %e, "remote contact has unexpected shape"),
            },
            Ok(None) => warn!(contact_id, "contact not found remotely"),
            Err(e) => warn!(contact_id, error = %e, "fetching full contact failed; using notification fields"),
        }
    }
}
