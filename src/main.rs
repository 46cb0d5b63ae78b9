//! # CRM Sync CLI (`crmsync`)
//!
//! ## Usage
//!
//! ```bash
//! crmsync --config ./config/crmsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `crmsync init` | Create the database and tables |
//! | `crmsync sync <entity>` | Sync `contacts`, `accounts`, `intern_roles` or `all` |
//! | `crmsync status` | Show sync watermarks and row counts |
//! | `crmsync serve webhook` | Start the webhook server |
//! | `crmsync documents <contact_id>` | Download CV attachments for one contact |
//! | `crmsync skills list <contact_id>` | List extracted skills |
//! | `crmsync skills extract <contact_id>` | Re-run skill extraction |
//!
//! CRM credentials come from `CRM_CLIENT_ID`, `CRM_CLIENT_SECRET` and
//! `CRM_REFRESH_TOKEN`; skill tagging reads `OPENAI_API_KEY`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crm_sync::progress::ProgressMode;
use crm_sync::{attachments, config, logging, migrate, server, skills, sync};

/// Incremental CRM sync into SQLite.
#[derive(Parser)]
#[command(
    name = "crmsync",
    about = "Incremental CRM sync into SQLite, with webhook-driven document ingestion",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/crmsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and all tables. Safe to run repeatedly.
    Init,

    /// Sync one entity type, or `all` of them in order.
    ///
    /// Incremental by default: only records modified after the stored
    /// watermark are fetched.
    Sync {
        /// `contacts`, `accounts`, `intern_roles` or `all`.
        target: String,

        /// Fetch every record, ignoring the watermark.
        #[arg(long)]
        full: bool,

        /// Progress on stderr: `off`, `human` or `json`.
        /// Defaults to `human` on a terminal, `off` otherwise.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Show per-entity watermarks and local row counts.
    Status,

    /// Start a server.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },

    /// Download CV attachments for one contact.
    Documents {
        contact_id: String,

        /// Name used in downloaded file names. Defaults to the stored name.
        #[arg(long)]
        name: Option<String>,
    },

    /// Inspect or re-run skill extraction.
    Skills {
        #[command(subcommand)]
        action: SkillsAction,
    },
}

#[derive(Subcommand)]
enum ServeService {
    /// Start the webhook server on `[webhook].bind`.
    Webhook,
}

#[derive(Subcommand)]
enum SkillsAction {
    /// List skills stored for a contact.
    List { contact_id: String },
    /// Extract skills again from the contact's stored CVs.
    Extract { contact_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_tracing(&cfg.logging.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync {
            target,
            full,
            progress,
        } => {
            let mode = match progress {
                Some(p) => ProgressMode::parse(&p)?,
                None => ProgressMode::default_for_tty(),
            };
            sync::run_sync(&cfg, &target, full, mode).await?;
        }
        Commands::Status => {
            sync::run_status(&cfg).await?;
        }
        Commands::Serve { service } => match service {
            ServeService::Webhook => {
                server::run_server(&cfg).await?;
            }
        },
        Commands::Documents { contact_id, name } => {
            attachments::run_documents(&cfg, &contact_id, name.as_deref()).await?;
        }
        Commands::Skills { action } => match action {
            SkillsAction::List { contact_id } => {
                skills::run_skills_list(&cfg, &contact_id).await?;
            }
            SkillsAction::Extract { contact_id } => {
                skills::run_skills_extract(&cfg, &contact_id).await?;
            }
        },
    }

    Ok(())
}
