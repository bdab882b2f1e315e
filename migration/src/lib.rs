//! Database migrations for the directory sync engine.

pub use sea_orm_migration::prelude::*;

mod m2025_12_01_000001_create_directory_tables;
mod m2025_12_01_000002_create_incremental_changes;
mod m2025_12_01_000003_create_sync_tasks;
mod m2025_12_01_000004_create_sync_operations;
mod m2025_12_01_000005_create_sync_conflicts;
mod m2025_12_01_000006_create_sync_locks;
mod m2025_12_01_000007_create_diff_staging;
mod m2025_12_01_000008_add_membership_active_pair_guard;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_12_01_000001_create_directory_tables::Migration),
            Box::new(m2025_12_01_000002_create_incremental_changes::Migration),
            Box::new(m2025_12_01_000003_create_sync_tasks::Migration),
            Box::new(m2025_12_01_000004_create_sync_operations::Migration),
            Box::new(m2025_12_01_000005_create_sync_conflicts::Migration),
            Box::new(m2025_12_01_000006_create_sync_locks::Migration),
            Box::new(m2025_12_01_000007_create_diff_staging::Migration),
            Box::new(m2025_12_01_000008_add_membership_active_pair_guard::Migration),
        ]
    }
}
