//! Skill tagging through a text-completion provider.
//!
//! Defines the [`CompletionProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: returns errors; used when skills are not configured.
//! - **[`OpenAiProvider`]**: calls the chat completions API with retry and backoff.
//!
//! [`SkillExtractor`] ties a provider to storage: it reads a document,
//! asks the provider for a JSON array of skills, and records the new ones.
//! It is the handler behind the extraction queue.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::attachments::{cv_documents, skill_extractor};
use crate::config::{Config, SkillsConfig};
use crate::db;
use crate::extract::extract_file;
use crate::migrate::ensure_storage_ready;
use crate::models::SkillRecord;
use crate::queue::{ExtractionHandler, ExtractionJob};
use crate::timefmt::now_string;

/// Confidence recorded for model-extracted skills.
pub const DEFAULT_CONFIDENCE: f64 = 0.8;

const SYSTEM_PROMPT: &str =
    "You are an expert HR assistant that extracts skills from CVs. Always respond with valid JSON.";

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Model identifier, recorded as the extraction method.
    fn model_name(&self) -> &str;

    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

// ============ Disabled Provider ============

pub struct DisabledProvider;

#[async_trait]
impl CompletionProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
        bail!("Skill extraction is disabled. Set [skills] provider in config.")
    }
}

// ============ OpenAI Provider ============

/// Calls `POST {api_base}/chat/completions`. Requires `OPENAI_API_KEY`.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    max_retries: u32,
    retry_base: Duration,
}

impl OpenAiProvider {
    /// # Errors
    ///
    /// Returns an error if `model` is not set in config, or if
    /// `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &SkillsConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("skills.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_retries: config.max_retries,
            retry_base: Duration::from_secs(1),
        })
    }

    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        let url = format!("{}/chat/completions", self.api_base);

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = self.retry_base * (1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response.json().await?;
                        return parse_completion_response(&json);
                    }

                    // Rate limited or server error: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "OpenAI API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    // Client error (not 429): don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Completion failed after retries")))
    }
}

/// Extracts `choices[0].message.content`.
fn parse_completion_response(json: &Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|c| c.trim().to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid completion response: missing message content"))
}

/// Build the provider named by `[skills] provider`.
pub fn create_provider(config: &SkillsConfig) -> Result<Arc<dyn CompletionProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAiProvider::new(config)?)),
        other => bail!("Unknown skills provider: {}", other),
    }
}

// ============ Prompt and response parsing ============

/// One skill as returned by the model, before persistence.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExtractedSkill {
    pub skill_name: String,
    pub category: String,
    pub proficiency_level: String,
}

pub fn build_prompt(cv_text: &str, max_chars: usize) -> String {
    let truncated: String = cv_text.chars().take(max_chars).collect();
    format!(
        "Analyze the following CV text and extract all technical skills, soft skills, and competencies.\n\
         For each skill, provide:\n\
         1. skill_name: The name of the skill\n\
         2. category: Category (Technical, Programming, Language, Soft Skill, Tool/Software, Domain Knowledge, etc.)\n\
         3. proficiency_level: Estimated proficiency (Beginner, Intermediate, Advanced, Expert) based on context\n\n\
         Format the response as a JSON array of objects with these exact fields: skill_name, category, proficiency_level\n\n\
         CV Text:\n{}\n\n\
         Respond with only the JSON array, no additional text.",
        truncated
    )
}

/// Parse a model response into skills.
///
/// Accepts a bare JSON array, or the first `[` .. last `]` span when the
/// array is wrapped in prose or a code fence. Entries without a non-empty
/// `skill_name` are dropped; missing category and proficiency default to
/// `Other` and `Intermediate`.
pub fn parse_skills(response: &str) -> Vec<ExtractedSkill> {
    let parsed: Option<Value> = serde_json::from_str(response.trim()).ok().or_else(|| {
        let start = response.find('[')?;
        let end = response.rfind(']')?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&response[start..=end]).ok()
    });

    let Some(Value::Array(items)) = parsed else {
        warn!("completion response did not contain a JSON array");
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let name = obj.get("skill_name")?.as_str()?.trim();
            if name.is_empty() {
                return None;
            }
            let text = |key: &str, default: &str| {
                obj.get(key)
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(default)
                    .to_string()
            };
            Some(ExtractedSkill {
                skill_name: name.to_string(),
                category: text("category", "Other"),
                proficiency_level: text("proficiency_level", "Intermediate"),
            })
        })
        .collect()
}

// ============ Persistence ============

/// Insert skills not yet recorded for (contact, document, skill name).
/// Returns the number of new rows.
pub async fn save_skills(
    pool: &SqlitePool,
    contact_id: &str,
    document_id: i64,
    skills: &[ExtractedSkill],
    extraction_method: &str,
) -> Result<usize, sqlx::Error> {
    let now = now_string();
    let mut tx = pool.begin().await?;
    let mut created = 0usize;
    for skill in skills {
        let result = sqlx::query(
            r#"
            INSERT INTO skills (contact_id, document_id, skill_name, category, proficiency_level,
                                confidence_score, extraction_method, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(contact_id, document_id, skill_name) DO NOTHING
            "#,
        )
        .bind(contact_id)
        .bind(document_id)
        .bind(&skill.skill_name)
        .bind(&skill.category)
        .bind(&skill.proficiency_level)
        .bind(DEFAULT_CONFIDENCE)
        .bind(extraction_method)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() > 0 {
            created += 1;
        } else {
            debug!(contact_id, skill = %skill.skill_name, "skill already recorded");
        }
    }
    tx.commit().await?;
    Ok(created)
}

pub async fn list_skills(pool: &SqlitePool, contact_id: &str) -> Result<Vec<SkillRecord>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, contact_id, document_id, skill_name, category, proficiency_level, \
                years_experience, confidence_score, extraction_method, created_at \
         FROM skills WHERE contact_id = ? ORDER BY category, skill_name",
    )
    .bind(contact_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(SkillRecord {
                id: row.try_get("id")?,
                contact_id: row.try_get("contact_id")?,
                document_id: row.try_get("document_id")?,
                skill_name: row.try_get("skill_name")?,
                category: row.try_get("category")?,
                proficiency_level: row.try_get("proficiency_level")?,
                years_experience: row.try_get("years_experience")?,
                confidence_score: row.try_get("confidence_score")?,
                extraction_method: row.try_get("extraction_method")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

// ============ Extractor ============

pub struct SkillExtractor {
    pool: SqlitePool,
    provider: Arc<dyn CompletionProvider>,
    max_input_chars: usize,
}

impl SkillExtractor {
    pub fn new(pool: SqlitePool, provider: Arc<dyn CompletionProvider>, max_input_chars: usize) -> Self {
        Self {
            pool,
            provider,
            max_input_chars,
        }
    }

    /// Extract, parse and store skills for one document. Returns the number
    /// of newly stored skills.
    pub async fn extract_and_save(&self, job: &ExtractionJob) -> Result<usize> {
        let path = job.file_path.clone();
        let text = tokio::task::spawn_blocking(move || extract_file(&path)).await??;
        if text.is_empty() {
            warn!(document = %job.document_name, "no text extracted");
            return Ok(0);
        }

        let prompt = build_prompt(&text, self.max_input_chars);
        let response = self.provider.complete(SYSTEM_PROMPT, &prompt).await?;
        let skills = parse_skills(&response);
        if skills.is_empty() {
            warn!(document = %job.document_name, "no skills extracted");
            return Ok(0);
        }

        let method = format!("OpenAI {}", self.provider.model_name());
        let created = save_skills(&self.pool, &job.contact_id, job.document_id, &skills, &method).await?;
        info!(
            contact_id = %job.contact_id,
            document_id = job.document_id,
            parsed = skills.len(),
            created,
            "skills saved"
        );
        Ok(created)
    }
}

#[async_trait]
impl ExtractionHandler for SkillExtractor {
    async fn handle(&self, job: &ExtractionJob) -> Result<usize> {
        self.extract_and_save(job).await
    }
}

// ============ CLI ============

/// `crmsync skills list <contact_id>`
pub async fn run_skills_list(config: &Config, contact_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_storage_ready(&pool).await?;
    let skills = list_skills(&pool, contact_id).await?;

    if skills.is_empty() {
        println!("No skills found for contact {}.", contact_id);
        return Ok(());
    }

    let mut current_category = "";
    for skill in &skills {
        if skill.category != current_category {
            println!("{}:", skill.category);
            current_category = &skill.category;
        }
        println!(
            "  {:<32} {:<13} doc={} conf={:.2}",
            skill.skill_name, skill.proficiency_level, skill.document_id, skill.confidence_score
        );
    }
    println!("total: {}", skills.len());
    Ok(())
}

/// `crmsync skills extract <contact_id>`: re-run extraction over the
/// contact's stored CV documents, one at a time.
pub async fn run_skills_extract(config: &Config, contact_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_storage_ready(&pool).await?;
    let Some(extractor) = skill_extractor(config, pool.clone())? else {
        bail!("Skill extraction is disabled. Set [skills] provider in config.");
    };

    let documents = cv_documents(&pool, contact_id).await?;
    if documents.is_empty() {
        bail!("No CV documents stored for contact {}", contact_id);
    }

    let mut failed = 0usize;
    for doc in documents {
        if !std::path::Path::new(&doc.file_path).exists() {
            eprintln!("Warning: file missing for document {}: {}", doc.id, doc.file_path);
            failed += 1;
            continue;
        }
        let job = ExtractionJob {
            contact_id: contact_id.to_string(),
            document_id: doc.id,
            file_path: doc.file_path.clone().into(),
            document_name: doc.document_name.clone(),
        };
        match extractor.extract_and_save(&job).await {
            Ok(created) => println!("  {}: {} new skills", doc.document_name, created),
            Err(e) => {
                eprintln!("Error extracting {}: {:#}", doc.document_name, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{} document(s) failed", failed);
    }
    println!("ok");
    Ok(())
}
