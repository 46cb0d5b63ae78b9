//! Document ingestion for contacts.
//!
//! Lists a contact's attachments, keeps the ones that look like a CV,
//! downloads them into the configured directory and records each one in
//! the `documents` table. PDF CVs are then handed to the extraction queue.
//!
//! A failure on one attachment is logged and skipped; documents already
//! stored for the same contact are never rolled back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crm_client::{CrmClient, Credentials};
use crate::db;
use crate::migrate::ensure_storage_ready;
use crate::models::DocumentRecord;
use crate::queue::{ExtractionJob, ExtractionQueue, QueueHandle};
use crate::skills::{create_provider, SkillExtractor};
use crate::source::{AttachmentInfo, AttachmentSource};
use crate::timefmt::now_string;

const CV_KEYWORDS: &[&str] = &[
    "cv",
    "resume",
    "curriculum",
    "vitae",
    "bio",
    "profile",
    "portfolio",
];

const UNSAFE_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Document types that a newer CV or resume replaces.
const CV_TYPES: &[&str] = &["CV", "Resume"];

/// True for PDF file names containing a CV keyword.
pub fn is_cv_file(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    lower.ends_with(".pdf") && CV_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Classify a document by its file name.
pub fn document_type(file_name: &str) -> &'static str {
    if file_name.is_empty() {
        return "Unknown";
    }
    let lower = file_name.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    if has(&["cv", "curriculum", "vitae"]) {
        "CV"
    } else if has(&["resume"]) {
        "Resume"
    } else if has(&["portfolio", "work"]) {
        "Portfolio"
    } else if has(&["certificate", "cert"]) {
        "Certificate"
    } else if has(&["cover", "letter"]) {
        "Cover Letter"
    } else if lower.ends_with(".pdf") {
        "PDF Document"
    } else {
        "Document"
    }
}

fn replace_unsafe(s: &str) -> String {
    s.chars()
        .map(|c| if UNSAFE_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

/// Local file name for a download:
/// `<contact name or contact_<id>>_<stem>_<YYYYmmdd_HHMMSS><.ext>`.
pub fn safe_filename(
    original: &str,
    contact_name: Option<&str>,
    contact_id: &str,
    now: NaiveDateTime,
) -> String {
    let cleaned = replace_unsafe(original);

    let prefix = match contact_name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => {
            let words: Vec<&str> = name.split_whitespace().collect();
            format!("{}_", replace_unsafe(&words.join("_")))
        }
        None => format!("contact_{}_", contact_id),
    };

    let path = Path::new(&cleaned);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    format!("{}{}_{}{}", prefix, stem, now.format("%Y%m%d_%H%M%S"), ext)
}

fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DocumentRecord, sqlx::Error> {
    Ok(DocumentRecord {
        id: row.try_get("id")?,
        contact_id: row.try_get("contact_id")?,
        attachment_id: row.try_get("attachment_id")?,
        document_name: row.try_get("document_name")?,
        document_type: row.try_get("document_type")?,
        file_path: row.try_get("file_path")?,
        file_size: row.try_get("file_size")?,
    })
}

const DOCUMENT_COLUMNS: &str =
    "id, contact_id, attachment_id, document_name, document_type, file_path, file_size";

/// Find the row a new download replaces: an existing CV or resume for the
/// contact, then the same attachment, then the same name and type.
async fn find_replaced_document(
    tx: &mut Transaction<'_, Sqlite>,
    contact_id: &str,
    attachment_id: &str,
    document_name: &str,
    doc_type: &str,
) -> Result<Option<DocumentRecord>, sqlx::Error> {
    if CV_TYPES.contains(&doc_type) {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE contact_id = ? AND document_type IN ('CV', 'Resume') \
             ORDER BY id LIMIT 1",
            DOCUMENT_COLUMNS
        ))
        .bind(contact_id)
        .fetch_optional(&mut **tx)
        .await?;
        if let Some(row) = row {
            return Ok(Some(document_from_row(&row)?));
        }
    }

    let row = sqlx::query(&format!(
        "SELECT {} FROM documents WHERE contact_id = ? AND attachment_id = ? ORDER BY id LIMIT 1",
        DOCUMENT_COLUMNS
    ))
    .bind(contact_id)
    .bind(attachment_id)
    .fetch_optional(&mut **tx)
    .await?;
    if let Some(row) = row {
        return Ok(Some(document_from_row(&row)?));
    }

    let row = sqlx::query(&format!(
        "SELECT {} FROM documents WHERE contact_id = ? AND document_name = ? AND document_type = ? \
         ORDER BY id LIMIT 1",
        DOCUMENT_COLUMNS
    ))
    .bind(contact_id)
    .bind(document_name)
    .bind(doc_type)
    .fetch_optional(&mut **tx)
    .await?;
    row.map(|r| document_from_row(&r)).transpose()
}

/// Record a downloaded file. Returns the stored row and, when an older
/// document was replaced, the path of its previous file.
async fn save_document(
    pool: &SqlitePool,
    contact_id: &str,
    attachment_id: &str,
    document_name: &str,
    file_path: &str,
    file_size: i64,
) -> Result<(DocumentRecord, Option<String>), sqlx::Error> {
    let doc_type = document_type(document_name);
    let now = now_string();
    let mut tx = pool.begin().await?;

    let existing =
        find_replaced_document(&mut tx, contact_id, attachment_id, document_name, doc_type).await?;

    let (id, old_path) = match existing {
        Some(old) => {
            let deleted = sqlx::query("DELETE FROM skills WHERE contact_id = ? AND document_id = ?")
                .bind(contact_id)
                .bind(old.id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if deleted > 0 {
                info!(contact_id, document_id = old.id, deleted, "cleared skills of replaced document");
            }
            sqlx::query(
                "UPDATE documents SET attachment_id = ?, document_name = ?, document_type = ?, \
                 file_path = ?, file_size = ?, updated_at = ? WHERE id = ?",
            )
            .bind(attachment_id)
            .bind(document_name)
            .bind(doc_type)
            .bind(file_path)
            .bind(file_size)
            .bind(&now)
            .bind(old.id)
            .execute(&mut *tx)
            .await?;
            let old_path = Some(old.file_path).filter(|p| p != file_path);
            (old.id, old_path)
        }
        None => {
            let result = sqlx::query(
                "INSERT INTO documents (contact_id, attachment_id, document_name, document_type, \
                 file_path, file_size, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(contact_id)
            .bind(attachment_id)
            .bind(document_name)
            .bind(doc_type)
            .bind(file_path)
            .bind(file_size)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            (result.last_insert_rowid(), None)
        }
    };

    tx.commit().await?;

    Ok((
        DocumentRecord {
            id,
            contact_id: contact_id.to_string(),
            attachment_id: Some(attachment_id.to_string()),
            document_name: document_name.to_string(),
            document_type: doc_type.to_string(),
            file_path: file_path.to_string(),
            file_size,
        },
        old_path,
    ))
}

/// Stored CV and resume PDFs for a contact.
pub async fn cv_documents(pool: &SqlitePool, contact_id: &str) -> Result<Vec<DocumentRecord>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM documents WHERE contact_id = ? AND document_type IN ('CV', 'Resume') ORDER BY id",
        DOCUMENT_COLUMNS
    ))
    .bind(contact_id)
    .fetch_all(pool)
    .await?;

    let docs = rows
        .iter()
        .map(document_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(docs
        .into_iter()
        .filter(|d| d.file_path.to_lowercase().ends_with(".pdf"))
        .collect())
}

/// Display name of a stored contact, or `None` when it does not exist.
pub async fn stored_contact_name(pool: &SqlitePool, contact_id: &str) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query("SELECT first_name, last_name FROM contacts WHERE id = ?")
        .bind(contact_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| {
        let first: Option<String> = r.try_get("first_name").ok().flatten();
        let last: Option<String> = r.try_get("last_name").ok().flatten();
        format!("{} {}", first.unwrap_or_default(), last.unwrap_or_default())
            .trim()
            .to_string()
    }))
}

pub struct DocumentIngestor {
    pool: SqlitePool,
    source: Arc<dyn AttachmentSource>,
    download_dir: PathBuf,
    queue: Option<QueueHandle>,
}

impl DocumentIngestor {
    pub fn new(
        pool: SqlitePool,
        source: Arc<dyn AttachmentSource>,
        download_dir: PathBuf,
        queue: Option<QueueHandle>,
    ) -> Self {
        Self {
            pool,
            source,
            download_dir,
            queue,
        }
    }

    /// Download and record every CV attachment of one contact.
    ///
    /// Fails only when the attachment list cannot be fetched; individual
    /// downloads that fail are skipped.
    pub async fn ingest_contact(
        &self,
        contact_id: &str,
        contact_name: Option<&str>,
    ) -> Result<Vec<DocumentRecord>> {
        let attachments = self
            .source
            .list_attachments(contact_id)
            .await
            .with_context(|| format!("listing attachments of contact {}", contact_id))?;

        let cvs: Vec<&AttachmentInfo> = attachments
            .iter()
            .filter(|a| a.kind.as_deref() == Some("Attachment") && is_cv_file(&a.file_name))
            .collect();
        info!(
            contact_id,
            attachments = attachments.len(),
            cvs = cvs.len(),
            "attachments listed"
        );

        let mut stored = Vec::new();
        for attachment in cvs {
            match self.ingest_attachment(contact_id, contact_name, attachment).await {
                Ok(doc) => stored.push(doc),
                Err(e) => warn!(
                    contact_id,
                    attachment_id = %attachment.id,
                    file = %attachment.file_name,
                    error = %e,
                    "attachment skipped"
                ),
            }
        }
        Ok(stored)
    }

    async fn ingest_attachment(
        &self,
        contact_id: &str,
        contact_name: Option<&str>,
        attachment: &AttachmentInfo,
    ) -> Result<DocumentRecord> {
        let bytes = self
            .source
            .download_attachment(contact_id, &attachment.id)
            .await?;

        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .with_context(|| format!("creating {}", self.download_dir.display()))?;
        let file_name = safe_filename(
            &attachment.file_name,
            contact_name,
            contact_id,
            chrono::Local::now().naive_local(),
        );
        let path = self.download_dir.join(file_name);
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        let file_path = path.to_string_lossy().into_owned();
        info!(contact_id, file = %file_path, bytes = bytes.len(), "attachment downloaded");

        let (doc, old_path) = save_document(
            &self.pool,
            contact_id,
            &attachment.id,
            &attachment.file_name,
            &file_path,
            bytes.len() as i64,
        )
        .await?;

        if let Some(old) = old_path {
            match tokio::fs::remove_file(&old).await {
                Ok(()) => debug!(file = %old, "removed replaced file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(file = %old, error = %e, "could not remove replaced file"),
            }
        }

        if let Some(queue) = &self.queue {
            if attachment.file_name.to_lowercase().ends_with(".pdf") {
                queue
                    .submit(ExtractionJob {
                        contact_id: contact_id.to_string(),
                        document_id: doc.id,
                        file_path: path,
                        document_name: doc.document_name.clone(),
                    })
                    .await?;
            }
        }

        Ok(doc)
    }
}

/// Build the skill extractor configured under `[skills]`, if enabled.
pub fn skill_extractor(config: &Config, pool: SqlitePool) -> Result<Option<Arc<SkillExtractor>>> {
    if !config.skills.is_enabled() {
        return Ok(None);
    }
    let provider = create_provider(&config.skills)?;
    Ok(Some(Arc::new(SkillExtractor::new(
        pool,
        provider,
        config.skills.max_input_chars,
    ))))
}

/// An ingestor wired to a running extraction queue.
pub struct DocumentPipeline {
    pub ingestor: DocumentIngestor,
    queue: Option<ExtractionQueue>,
}

impl DocumentPipeline {
    /// Start the extraction workers (when skills are enabled) and build an
    /// ingestor that feeds them. Must be called from within a Tokio runtime.
    pub fn start(config: &Config, pool: SqlitePool, source: Arc<dyn AttachmentSource>) -> Result<Self> {
        let queue = match skill_extractor(config, pool.clone())? {
            Some(extractor) => Some(ExtractionQueue::start(
                extractor,
                config.documents.workers,
                config.documents.queue_capacity,
            )),
            None => {
                debug!("skill extraction disabled; documents will only be downloaded");
                None
            }
        };
        let ingestor = DocumentIngestor::new(
            pool,
            source,
            config.documents.download_dir.clone(),
            queue.as_ref().map(ExtractionQueue::handle),
        );
        Ok(Self { ingestor, queue })
    }

    pub fn into_parts(self) -> (DocumentIngestor, Option<ExtractionQueue>) {
        (self.ingestor, self.queue)
    }

    /// Drop the ingestor and wait for queued extraction jobs to finish.
    pub async fn finish(self) {
        let (ingestor, queue) = self.into_parts();
        drop(ingestor);
        if let Some(queue) = queue {
            queue.shutdown().await;
        }
    }
}

/// `crmsync documents <contact_id>`: ingest one contact and wait for
/// its extraction jobs.
pub async fn run_documents(config: &Config, contact_id: &str, name: Option<&str>) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_storage_ready(&pool).await?;

    let stored_name = match name {
        Some(_) => None,
        None => stored_contact_name(&pool, contact_id).await?,
    };
    let name = name.or(stored_name.as_deref()).filter(|n| !n.is_empty());

    let client = Arc::new(CrmClient::new(&config.crm, Credentials::from_env()?)?);
    let pipeline = DocumentPipeline::start(config, pool, client)?;
    let result = pipeline.ingestor.ingest_contact(contact_id, name).await;
    if config.skills.is_enabled() {
        eprintln!("Waiting for skill extraction...");
    }
    pipeline.finish().await;
    let docs = result?;

    println!("Documents for contact {}:", contact_id);
    for doc in &docs {
        println!(
            "  [{}] {} ({}, {} bytes) -> {}",
            doc.id, doc.document_name, doc.document_type, doc.file_size, doc.file_path
        );
    }
    println!("  downloaded: {}", docs.len());
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::ensure_storage_ready;
    use crate::queue::ExtractionHandler;
    use crate::source::FetchError;
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Mutex;

    struct FakeAttachments {
        listing: Vec<AttachmentInfo>,
        fail_download: Option<&'static str>,
    }

    fn attachment(id: &str, name: &str, kind: &str) -> AttachmentInfo {
        AttachmentInfo {
            id: id.to_string(),
            file_name: name.to_string(),
            size: None,
            kind: Some(kind.to_string()),
        }
    }

    #[async_trait]
    impl AttachmentSource for FakeAttachments {
        async fn list_attachments(&self, _contact_id: &str) -> Result<Vec<AttachmentInfo>, FetchError> {
            Ok(self.listing.clone())
        }

        async fn download_attachment(
            &self,
            _contact_id: &str,
            attachment_id: &str,
        ) -> Result<Vec<u8>, FetchError> {
            if self.fail_download == Some(attachment_id) {
                return Err(FetchError::Status {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok(format!("%PDF-1.4 {}", attachment_id).into_bytes())
        }
    }

    #[derive(Default)]
    struct Recorder {
        jobs: Mutex<Vec<ExtractionJob>>,
    }

    #[async_trait]
    impl ExtractionHandler for Recorder {
        async fn handle(&self, job: &ExtractionJob) -> anyhow::Result<usize> {
            self.jobs.lock().unwrap().push(job.clone());
            Ok(0)
        }
    }

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        ensure_storage_ready(&pool).await.unwrap();
        pool
    }

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn cv_detection_needs_keyword_and_pdf() {
        assert!(is_cv_file("Ada_Lovelace_CV.pdf"));
        assert!(is_cv_file("my-resume.PDF"));
        assert!(is_cv_file("Curriculum Vitae.pdf"));
        assert!(is_cv_file("portfolio_2024.pdf"));
        assert!(!is_cv_file("resume.docx"));
        assert!(!is_cv_file("invoice.pdf"));
        assert!(!is_cv_file(""));
    }

    #[test]
    fn document_types_follow_name() {
        assert_eq!(document_type("Ada_CV.pdf"), "CV");
        assert_eq!(document_type("resume.pdf"), "Resume");
        assert_eq!(document_type("portfolio.pdf"), "Portfolio");
        assert_eq!(document_type("aws-certificate.pdf"), "Certificate");
        assert_eq!(document_type("cover_letter.docx"), "Cover Letter");
        assert_eq!(document_type("scan.pdf"), "PDF Document");
        assert_eq!(document_type("notes.txt"), "Document");
        assert_eq!(document_type(""), "Unknown");
    }

    #[test]
    fn safe_filename_uses_name_or_id() {
        let now = at("2024-03-05 14:07:09");
        assert_eq!(
            safe_filename("my:cv?.pdf", Some("Ada  Lovelace"), "42", now),
            "Ada_Lovelace_my_cv__20240305_140709.pdf"
        );
        assert_eq!(
            safe_filename("resume.pdf", None, "42", now),
            "contact_42_resume_20240305_140709.pdf"
        );
        assert_eq!(
            safe_filename("a/b\\cv.pdf", Some("  "), "7", now),
            "contact_7_a_b_cv_20240305_140709.pdf"
        );
        assert_eq!(
            safe_filename("README", Some("Bo"), "7", now),
            "Bo_README_20240305_140709"
        );
    }

    #[tokio::test]
    async fn downloads_only_cv_attachments_and_queues_them() {
        let pool = memory_pool().await;
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let queue = ExtractionQueue::start(recorder.clone(), 1, 4);
        let source = Arc::new(FakeAttachments {
            listing: vec![
                attachment("a1", "Ada_CV.pdf", "Attachment"),
                attachment("a2", "photo.png", "Attachment"),
                attachment("a3", "resume.pdf", "Link"),
            ],
            fail_download: None,
        });
        let ingestor = DocumentIngestor::new(
            pool.clone(),
            source,
            dir.path().join("downloads"),
            Some(queue.handle()),
        );

        let docs = ingestor.ingest_contact("c1", Some("Ada Lovelace")).await.unwrap();
        drop(ingestor);
        queue.shutdown().await;

        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert_eq!(doc.document_type, "CV");
        assert_eq!(doc.attachment_id.as_deref(), Some("a1"));
        assert!(Path::new(&doc.file_path).exists());
        assert_eq!(doc.file_size, std::fs::read(&doc.file_path).unwrap().len() as i64);

        let jobs = recorder.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].document_id, doc.id);
        assert_eq!(jobs[0].contact_id, "c1");
    }

    #[tokio::test]
    async fn failed_download_does_not_stop_others() {
        let pool = memory_pool().await;
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeAttachments {
            listing: vec![
                attachment("a1", "old_cv.pdf", "Attachment"),
                attachment("a2", "portfolio.pdf", "Attachment"),
            ],
            fail_download: Some("a1"),
        });
        let ingestor = DocumentIngestor::new(pool.clone(), source, dir.path().to_path_buf(), None);

        let docs = ingestor.ingest_contact("c1", None).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].document_name, "portfolio.pdf");
    }

    #[tokio::test]
    async fn newer_cv_replaces_row_file_and_skills() {
        let pool = memory_pool().await;
        let dir = tempfile::tempdir().unwrap();
        let old_file = dir.path().join("old.pdf");
        std::fs::write(&old_file, b"old").unwrap();
        let old_path = old_file.to_string_lossy().into_owned();

        let (first, replaced) = save_document(&pool, "c1", "a1", "Ada_CV.pdf", &old_path, 3)
            .await
            .unwrap();
        assert!(replaced.is_none());
        sqlx::query(
            "INSERT INTO skills (contact_id, document_id, skill_name, extraction_method, created_at, updated_at) \
             VALUES ('c1', ?, 'Rust', 'test', 'now', 'now')",
        )
        .bind(first.id)
        .execute(&pool)
        .await
        .unwrap();

        let (second, replaced) = save_document(&pool, "c1", "a9", "Ada_resume.pdf", "/tmp/new.pdf", 9)
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.document_type, "Resume");
        assert_eq!(replaced.as_deref(), Some(old_path.as_str()));

        let skills: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM skills WHERE document_id = ?")
            .bind(first.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(skills, 0);
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn non_cv_documents_reuse_by_attachment_id() {
        let pool = memory_pool().await;
        let (a, _) = save_document(&pool, "c1", "x1", "portfolio.pdf", "/tmp/p1.pdf", 1)
            .await
            .unwrap();
        let (b, _) = save_document(&pool, "c1", "x2", "certificate.pdf", "/tmp/c1.pdf", 1)
            .await
            .unwrap();
        let (c, replaced) = save_document(&pool, "c1", "x1", "portfolio.pdf", "/tmp/p2.pdf", 2)
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(c.id, a.id);
        assert_eq!(replaced.as_deref(), Some("/tmp/p1.pdf"));

        assert!(cv_documents(&pool, "c1").await.unwrap().is_empty());
    }
}
