//! # Directory Sync Library
//!
//! Keeps an external organization/user directory consistent with upstream
//! sources through full reconciliation and incremental syncs, exposed through
//! a small management API.

pub mod adapters;
pub mod config;
pub mod cursor;
pub mod db;
pub mod directory;
pub mod error;
pub mod handlers;
pub mod models;
pub mod normalization;
pub mod repositories;
pub mod scope;
pub mod server;
pub mod sync;
pub mod telemetry;
pub use migration;
