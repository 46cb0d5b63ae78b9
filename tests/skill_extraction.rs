use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crm_sync::config::SkillsConfig;
use crm_sync::migrate::ensure_storage_ready;
use crm_sync::queue::{ExtractionJob, ExtractionQueue};
use crm_sync::skills::{list_skills, CompletionProvider, OpenAiProvider, SkillExtractor};

/// One-page PDF whose content stream draws `phrase` in Helvetica.
fn minimal_pdf_with_text(phrase: &str) -> Vec<u8> {
    let content = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET", phrase);
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    let o4 = out.len();
    out.extend_from_slice(
        format!(
            "4 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
            content.len(),
            content
        )
        .as_bytes(),
    );
    let o5 = out.len();
    out.extend_from_slice(
        b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
    );
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in [o1, o2, o3, o4, o5] {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

/// Returns a fixed completion and records every prompt it receives.
struct CannedProvider {
    response: String,
    prompts: Mutex<Vec<String>>,
}

impl CannedProvider {
    fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CompletionProvider for CannedProvider {
    fn model_name(&self) -> &str {
        "canned"
    }

    async fn complete(&self, _system: &str, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.response.clone())
    }
}

const SKILLS_JSON: &str = r#"Sure, here they are:
[
  {"skill_name": "Rust", "category": "Programming", "proficiency_level": "Advanced"},
  {"skill_name": "SQL", "category": "Databases"}
]"#;

async fn pool_with_document(dir: &Path, contact_id: &str) -> (SqlitePool, i64, PathBuf) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    ensure_storage_ready(&pool).await.unwrap();

    let file = dir.join("Ada_CV.pdf");
    std::fs::write(&file, minimal_pdf_with_text("Rust developer with SQL experience")).unwrap();

    let id: i64 = sqlx::query_scalar(
        "INSERT INTO documents (contact_id, document_name, document_type, file_path, created_at, updated_at)
         VALUES (?, 'Ada_CV.pdf', 'CV', ?, 'now', 'now') RETURNING id",
    )
    .bind(contact_id)
    .bind(file.to_string_lossy().into_owned())
    .fetch_one(&pool)
    .await
    .unwrap();
    (pool, id, file)
}

fn job(contact_id: &str, document_id: i64, file: &Path) -> ExtractionJob {
    ExtractionJob {
        contact_id: contact_id.to_string(),
        document_id,
        file_path: file.to_path_buf(),
        document_name: "Ada_CV.pdf".into(),
    }
}

#[tokio::test]
async fn extracts_pdf_text_and_stores_skills_once() {
    let dir = tempfile::tempdir().unwrap();
    let (pool, document_id, file) = pool_with_document(dir.path(), "c1").await;
    let provider = Arc::new(CannedProvider::new(SKILLS_JSON));
    let extractor = SkillExtractor::new(pool.clone(), provider.clone(), 4000);

    let created = extractor
        .extract_and_save(&job("c1", document_id, &file))
        .await
        .unwrap();
    assert_eq!(created, 2);

    let prompts = provider.prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("Rust developer"));

    // Re-running the same document adds nothing.
    let again = extractor
        .extract_and_save(&job("c1", document_id, &file))
        .await
        .unwrap();
    assert_eq!(again, 0);

    let skills = list_skills(&pool, "c1").await.unwrap();
    assert_eq!(skills.len(), 2);
    assert_eq!(skills[0].skill_name, "SQL");
    assert_eq!(skills[0].proficiency_level, "Intermediate");
    assert_eq!(skills[1].skill_name, "Rust");
    assert_eq!(skills[1].extraction_method, "OpenAI canned");
    assert!((skills[1].confidence_score - 0.8).abs() < f64::EPSILON);
}

#[tokio::test]
async fn unparseable_completion_stores_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (pool, document_id, file) = pool_with_document(dir.path(), "c1").await;
    let extractor = SkillExtractor::new(
        pool.clone(),
        Arc::new(CannedProvider::new("I could not read this CV.")),
        4000,
    );

    let created = extractor
        .extract_and_save(&job("c1", document_id, &file))
        .await
        .unwrap();
    assert_eq!(created, 0);
    assert!(list_skills(&pool, "c1").await.unwrap().is_empty());
}

#[tokio::test]
async fn queued_jobs_finish_before_shutdown_returns() {
    let dir = tempfile::tempdir().unwrap();
    let (pool, document_id, file) = pool_with_document(dir.path(), "c1").await;
    let extractor = Arc::new(SkillExtractor::new(
        pool.clone(),
        Arc::new(CannedProvider::new(SKILLS_JSON)),
        4000,
    ));

    let queue = ExtractionQueue::start(extractor, 2, 4);
    let handle = queue.handle();
    handle.submit(job("c1", document_id, &file)).await.unwrap();
    drop(handle);
    queue.shutdown().await;

    assert_eq!(list_skills(&pool, "c1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn openai_provider_retries_then_reads_message_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": " [{\"skill_name\": \"Go\"}] "}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    std::env::set_var("OPENAI_API_KEY", "test-key");
    let config = SkillsConfig {
        provider: "openai".into(),
        model: Some("gpt-4o-mini".into()),
        api_base: format!("{}/v1", server.uri()),
        ..SkillsConfig::default()
    };
    let provider = OpenAiProvider::new(&config)
        .unwrap()
        .with_retry_base(Duration::from_millis(1));

    assert_eq!(provider.model_name(), "gpt-4o-mini");
    let content = provider.complete("system", "prompt").await.unwrap();
    assert_eq!(content, "[{\"skill_name\": \"Go\"}]");
}
