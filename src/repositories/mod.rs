//! # Repository Layer
//!
//! Thin SeaORM wrappers over the sync tables. Every method is tenant-scoped
//! and compare-and-set updates report whether they won.

pub mod connection;
pub mod object_state;
pub mod sync_config;
pub mod sync_error;
pub mod sync_job;
pub mod webhook_event;

pub use connection::ConnectionRepository;
pub use object_state::ObjectStateRepository;
pub use sync_config::SyncConfigRepository;
pub use sync_error::SyncErrorRepository;
pub use sync_job::SyncJobRepository;
pub use webhook_event::WebhookEventRepository;
