use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub crm: CrmConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrmConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            token_url: default_token_url(),
            per_page: default_per_page(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_api_base() -> String {
    "https://www.zohoapis.com/crm/v2".to_string()
}
fn default_token_url() -> String {
    "https://accounts.zoho.com/oauth/v2/token".to_string()
}
fn default_per_page() -> u32 {
    200
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Stage value that triggers document ingestion.
    #[serde(default = "default_trigger_stage")]
    pub trigger_stage: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            trigger_stage: default_trigger_stage(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}
fn default_trigger_stage() -> String {
    "Ready to Pitch".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Ingest trigger-stage contacts after a successful contacts sync.
    #[serde(default)]
    pub ingest_after_sync: bool,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            ingest_after_sync: false,
        }
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./data/downloads")
}
fn default_workers() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct SkillsConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_skills_api_base")]
    pub api_base: String,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            api_base: default_skills_api_base(),
            max_input_chars: default_max_input_chars(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl SkillsConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_skills_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_input_chars() -> usize {
    4000
}
fn default_max_tokens() -> u32 {
    1500
}
fn default_temperature() -> f32 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate crm
    if !(1..=200).contains(&config.crm.per_page) {
        anyhow::bail!("crm.per_page must be in [1, 200]");
    }

    // Validate documents
    if config.documents.workers == 0 {
        anyhow::bail!("documents.workers must be >= 1");
    }
    if config.documents.queue_capacity == 0 {
        anyhow::bail!("documents.queue_capacity must be >= 1");
    }

    // Validate skills
    match config.skills.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown skills provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.skills.is_enabled() && config.skills.model.is_none() {
        anyhow::bail!(
            "skills.model must be specified when provider is '{}'",
            config.skills.provider
        );
    }
    if config.skills.max_input_chars == 0 {
        anyhow::bail!("skills.max_input_chars must be > 0");
    }

    Ok(config)
}
