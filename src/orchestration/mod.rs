//! # Sync Orchestration
//!
//! The per-part state machine that reads source group membership and hands
//! it to the aggregation stage, plus the launcher that starts it for due
//! jobs.

pub mod aggregator_client;
pub mod collector;
pub mod launcher;
pub mod query;
pub mod state;
pub mod workflow;

pub use aggregator_client::{
    AggregatorClient, AggregatorError, FUNCTION_KEY_HEADER, HttpAggregatorClient,
    LocalAggregatorClient, MembershipAggregatorRequest,
};
pub use collector::{CollectionOutcome, collect_all, collect_group};
pub use launcher::{LaunchOutcome, OrchestrationLauncher, RecoveryOutcome};
pub use query::{ParsedGroups, parse_group_ids, parse_query_parts};
pub use state::{Command, LogLevel, OrchestrationState, Phase, Transition};
pub use workflow::{
    OrchestrationContext, OrchestrationError, OrchestrationOutcome, OrchestrationRequest,
    SyncOrchestrationWorkflow,
};
