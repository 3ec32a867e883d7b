//! # CRM Sync Library
//!
//! Bidirectional synchronization between local records and a HubSpot-style
//! CRM: credentials, identity mapping, scheduling, job execution, webhook
//! ingestion and record-level retries.

pub mod config;
pub mod credentials;
pub mod crm;
pub mod crypto;
pub mod db;
pub mod error;
pub mod events;
pub mod field_mapping;
pub mod handlers;
pub mod identity;
pub mod local;
pub mod models;
pub mod reconcile;
pub mod record_sync;
pub mod repositories;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod sync_executor;
pub mod telemetry;
pub mod webhook_ingestor;
pub mod webhook_verification;
pub use migration;
