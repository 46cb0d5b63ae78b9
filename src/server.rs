//! Webhook HTTP server.
//!
//! Receives contact-changed notifications from the CRM and exposes a few
//! operational endpoints for manual document and skill runs.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/webhook/zoho/contact` | Contact-changed notification |
//! | `GET`  | `/webhook/health` | Health check |
//! | `POST` | `/webhook/test-cv-download/{contact_id}` | Ingest documents of a stored contact |
//! | `POST` | `/webhook/test-skill-extraction/{contact_id}` | Re-run skill extraction on stored CVs |
//! | `GET`  | `/webhook/skills/{contact_id}` | List extracted skills |
//!
//! # Error Contract
//!
//! ```json
//! { "status": "error", "message": "Contact 42 not found" }
//! ```
//!
//! # Signatures
//!
//! When `WEBHOOK_SECRET` is set, notifications must carry an
//! `X-Webhook-Signature` header with the hex HMAC-SHA256 of the raw body.

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::attachments::{
    cv_documents, skill_extractor, stored_contact_name, DocumentIngestor, DocumentPipeline,
};
use crate::config::Config;
use crate::crm_client::{CrmClient, Credentials};
use crate::db;
use crate::migrate::ensure_storage_ready;
use crate::models::SkillRecord;
use crate::queue::ExtractionJob;
use crate::skills::{list_skills, SkillExtractor};
use crate::timefmt::now_string;
use crate::webhook::{decode_payload, verify_signature, ContactWebhook, WebhookError};

/// Header carrying the notification signature.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Shared state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub webhook: Arc<ContactWebhook>,
    pub ingestor: Option<Arc<DocumentIngestor>>,
    pub extractor: Option<Arc<SkillExtractor>>,
    /// HMAC key for notification signatures; `None` disables the check.
    pub secret: Option<Vec<u8>>,
}

/// Build the router over `state`.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/webhook/zoho/contact", post(handle_contact))
        .route("/webhook/health", get(handle_health))
        .route("/webhook/test-cv-download/{contact_id}", post(handle_cv_download))
        .route(
            "/webhook/test-skill-extraction/{contact_id}",
            post(handle_skill_extraction),
        )
        .route("/webhook/skills/{contact_id}", get(handle_list_skills))
        .layer(cors)
        .with_state(state)
}

/// Starts the webhook server on `[webhook].bind`.
///
/// Runs until Ctrl-C, then waits for queued skill extraction to finish.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    ensure_storage_ready(&pool).await?;

    let client = Arc::new(CrmClient::new(&config.crm, Credentials::from_env()?)?);
    let pipeline = DocumentPipeline::start(config, pool.clone(), client.clone())?;
    let (ingestor, queue) = pipeline.into_parts();
    let ingestor = Arc::new(ingestor);

    let secret = std::env::var("WEBHOOK_SECRET")
        .ok()
        .filter(|s| !s.is_empty())
        .map(String::into_bytes);
    if secret.is_none() {
        warn!("WEBHOOK_SECRET not set; notifications are accepted unsigned");
    }

    let state = AppState {
        webhook: Arc::new(ContactWebhook::new(
            pool.clone(),
            client,
            Some(ingestor.clone()),
            config.webhook.trigger_stage.clone(),
        )),
        extractor: skill_extractor(config, pool.clone())?,
        ingestor: Some(ingestor),
        pool,
        secret,
    };

    let listener = tokio::net::TcpListener::bind(&config.webhook.bind).await?;
    println!("Webhook server listening on http://{}", config.webhook.bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    if let Some(queue) = queue {
        println!("Waiting for skill extraction to finish...");
        queue.shutdown().await;
    }
    println!("ok");
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            status: "error",
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: message.into(),
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        error!(error = %e, "storage error");
        internal(e.to_string())
    }
}

// ============ POST /webhook/zoho/contact ============

async fn handle_contact(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    if let Some(secret) = &state.secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| unauthorized("missing webhook signature"))?;
        if !verify_signature(secret, &body, signature) {
            return Err(unauthorized("invalid webhook signature"));
        }
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let payload =
        decode_payload(&body, content_type).ok_or_else(|| bad_request("No data found"))?;

    match state.webhook.handle(&payload).await {
        Ok(response) => Ok((StatusCode::OK, Json(response)).into_response()),
        Err(e @ (WebhookError::UnexpectedShape | WebhookError::MissingContactId)) => {
            Err(bad_request(e.to_string()))
        }
        Err(e) => {
            error!(error = %e, "contact notification failed");
            Err(internal(e.to_string()))
        }
    }
}

// ============ GET /webhook/health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: now_string(),
    })
}

// ============ Manual runs ============

#[derive(Serialize)]
struct CvDownloadResponse {
    status: &'static str,
    contact_id: String,
    contact_name: String,
    downloaded_files: Vec<String>,
    files_count: usize,
}

async fn handle_cv_download(
    State(state): State<AppState>,
    Path(contact_id): Path<String>,
) -> Result<Json<CvDownloadResponse>, AppError> {
    let contact_name = stored_contact_name(&state.pool, &contact_id)
        .await?
        .ok_or_else(|| not_found(format!("Contact {} not found", contact_id)))?;
    let ingestor = state
        .ingestor
        .as_ref()
        .ok_or_else(|| bad_request("document ingestion is not configured"))?;

    let name = Some(contact_name.as_str()).filter(|n| !n.is_empty());
    let docs = ingestor
        .ingest_contact(&contact_id, name)
        .await
        .map_err(|e| internal(e.to_string()))?;
    let downloaded_files: Vec<String> = docs.into_iter().map(|d| d.file_path).collect();

    Ok(Json(CvDownloadResponse {
        status: "success",
        contact_id,
        contact_name,
        files_count: downloaded_files.len(),
        downloaded_files,
    }))
}

#[derive(Serialize)]
struct DocumentResult {
    document_id: i64,
    document_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    skills_extracted: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct SkillExtractionResponse {
    status: &'static str,
    contact_id: String,
    contact_name: String,
    documents_processed: usize,
    results: Vec<DocumentResult>,
    skills: Vec<SkillRecord>,
}

async fn handle_skill_extraction(
    State(state): State<AppState>,
    Path(contact_id): Path<String>,
) -> Result<Json<SkillExtractionResponse>, AppError> {
    let contact_name = stored_contact_name(&state.pool, &contact_id)
        .await?
        .ok_or_else(|| not_found(format!("Contact {} not found", contact_id)))?;
    let extractor = state
        .extractor
        .as_ref()
        .ok_or_else(|| bad_request("skill extraction is disabled"))?;

    let documents = cv_documents(&state.pool, &contact_id).await?;
    if documents.is_empty() {
        return Err(not_found(format!(
            "No documents found for contact {}",
            contact_id
        )));
    }

    let mut results = Vec::new();
    for doc in documents {
        if !FsPath::new(&doc.file_path).exists() {
            warn!(file = %doc.file_path, "document file missing");
            continue;
        }
        let job = ExtractionJob {
            contact_id: contact_id.clone(),
            document_id: doc.id,
            file_path: doc.file_path.clone().into(),
            document_name: doc.document_name.clone(),
        };
        let result = match extractor.extract_and_save(&job).await {
            Ok(count) => DocumentResult {
                document_id: doc.id,
                document_name: doc.document_name,
                skills_extracted: Some(count),
                error: None,
            },
            Err(e) => {
                error!(document = %doc.document_name, error = %e, "skill extraction failed");
                DocumentResult {
                    document_id: doc.id,
                    document_name: doc.document_name,
                    skills_extracted: None,
                    error: Some(e.to_string()),
                }
            }
        };
        results.push(result);
    }

    Ok(Json(SkillExtractionResponse {
        status: "success",
        contact_id: contact_id.clone(),
        contact_name,
        documents_processed: results.len(),
        results,
        skills: list_skills(&state.pool, &contact_id).await?,
    }))
}

#[derive(Serialize)]
struct SkillsResponse {
    status: &'static str,
    contact_id: String,
    total_skills: usize,
    skills: Vec<SkillRecord>,
}

async fn handle_list_skills(
    State(state): State<AppState>,
    Path(contact_id): Path<String>,
) -> Result<Json<SkillsResponse>, AppError> {
    let skills = list_skills(&state.pool, &contact_id).await?;
    Ok(Json(SkillsResponse {
        status: "success",
        contact_id,
        total_skills: skills.len(),
        skills,
    }))
}
