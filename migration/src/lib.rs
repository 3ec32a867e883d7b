//! Database migrations for the CRM sync service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_11_10_000001_create_crm_connections;
mod m2025_11_10_000002_create_sync_configs;
mod m2025_11_10_000003_create_sync_jobs;
mod m2025_11_10_000004_create_object_mappings;
mod m2025_11_10_000005_create_sync_errors;
mod m2025_11_10_000006_create_webhook_events;
mod m2025_11_10_000007_create_local_records;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_11_10_000001_create_crm_connections::Migration),
            Box::new(m2025_11_10_000002_create_sync_configs::Migration),
            Box::new(m2025_11_10_000003_create_sync_jobs::Migration),
            Box::new(m2025_11_10_000004_create_object_mappings::Migration),
            Box::new(m2025_11_10_000005_create_sync_errors::Migration),
            Box::new(m2025_11_10_000006_create_webhook_events::Migration),
            Box::new(m2025_11_10_000007_create_local_records::Migration),
        ]
    }
}
