//! # Group Membership Sync Library
//!
//! Scheduling, orchestration and aggregation of recurring group membership
//! syncs, plus the HTTP surface and persistence they run on.

pub mod aggregation;
pub mod backup;
pub mod config;
pub mod db;
pub mod delta;
pub mod directory;
pub mod error;
pub mod handlers;
pub mod models;
pub mod notifications;
pub mod orchestration;
pub mod repositories;
pub mod retry;
pub mod scheduler;
pub mod scheduling;
pub mod server;
pub mod storage;
pub mod telemetry;
pub use migration;
