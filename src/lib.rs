//! # CRM Sync
//!
//! Incremental mirroring of a remote CRM into a local SQLite database.
//!
//! Three entity types are synchronized: contacts, accounts and intern
//! roles. Each run reads a per-entity watermark, fetches only records
//! modified after it, upserts them in one transaction and only then
//! advances the watermark. A crash between commit and tracker update
//! replays the same batch on the next run, which the idempotent upsert
//! absorbs.
//!
//! Around the sync core sit a webhook that patches single contacts as
//! they change, document ingestion for contacts reaching a trigger stage,
//! and skill tagging of downloaded CVs through a bounded worker queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌────────────┐
//! │ Tracker  │──▶│  Record  │──▶│  Mapper  │──▶│ Reconciler │
//! │  (read)  │   │  Source  │   │ (tables) │   │   (batch)  │
//! └──────────┘   └──────────┘   └──────────┘   └─────┬──────┘
//!                                                     │
//!                                              ┌──────▼─────┐
//!                                              │  Tracker   │
//!                                              │  (write)   │
//!                                              └────────────┘
//!
//! webhook ──▶ patch contact ──▶ documents ──▶ queue ──▶ skills
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! crmsync init
//! crmsync sync all
//! crmsync status
//! crmsync serve webhook
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`mapping`] | Declarative field mapping |
//! | [`entities`] | Mapping tables for the three entity types |
//! | [`criteria`] | Incremental fetch filters |
//! | [`tracker`] | Per-entity sync watermarks |
//! | [`reconcile`] | Batch upsert and patch update |
//! | [`sync`] | Sync orchestrator |
//! | [`crm_client`] | CRM HTTP client |
//! | [`webhook`] | Contact-changed notifications |
//! | [`server`] | Webhook HTTP server |
//! | [`attachments`] | Document ingestion |
//! | [`extract`] | Document text extraction |
//! | [`skills`] | Skill tagging |
//! | [`queue`] | Bounded extraction worker pool |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema setup |

pub mod attachments;
pub mod config;
pub mod criteria;
pub mod crm_client;
pub mod db;
pub mod entities;
pub mod error;
pub mod extract;
pub mod logging;
pub mod mapping;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod queue;
pub mod reconcile;
pub mod server;
pub mod skills;
pub mod source;
pub mod sync;
pub mod timefmt;
pub mod tracker;
pub mod webhook;
