//! Database migrations for the group membership sync service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_01_10_000001_create_sync_jobs;
mod m2026_01_10_000002_create_orchestration_checkpoints;
mod m2026_01_10_000003_create_backup_trackers;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_10_000001_create_sync_jobs::Migration),
            Box::new(m2026_01_10_000002_create_orchestration_checkpoints::Migration),
            Box::new(m2026_01_10_000003_create_backup_trackers::Migration),
        ]
    }
}
