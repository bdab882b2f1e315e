//! SeaORM entity models for the intermediate store and the sync bookkeeping tables.

pub mod diff_staging;
pub mod incremental_change;
pub mod membership;
pub mod organization;
pub mod sync_conflict;
pub mod sync_lock;
pub mod sync_operation;
pub mod sync_task;
pub mod user;
