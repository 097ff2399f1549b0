//! # Scheduling
//!
//! Start-time planning for the sync job backlog: runtime estimation, the pure
//! lane distributor and the service tying them to the job store.

pub mod distributor;
pub mod runtime;
pub mod service;

pub use distributor::{DistributionParams, distribute};
pub use runtime::{FixedRuntimeEstimator, HistoricalRuntimeEstimator, RuntimeEstimator};
pub use service::JobSchedulingService;
