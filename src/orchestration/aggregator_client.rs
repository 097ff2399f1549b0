//! Hand-off of a persisted membership part to the aggregation stage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::aggregation::{AggregationError, MembershipAggregator};
use crate::config::AggregatorConfig;
use crate::retry::{RetryPolicy, Retryable, retry_transient};

/// Header carrying the shared aggregation key.
pub const FUNCTION_KEY_HEADER: &str = "x-functions-key";

/// One membership part ready for aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MembershipAggregatorRequest {
    /// Payload store handle of the serialized membership
    pub file_path: String,
    pub part_number: u32,
    pub parts_count: u32,
    pub partition_key: String,
    pub row_key: String,
    #[serde(default)]
    pub is_destination_part: bool,
}

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("aggregator request timed out")]
    Timeout,
    #[error("aggregator transport error: {0}")]
    Transport(String),
    #[error("aggregator answered {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("aggregator rejected the part: {0}")]
    Rejected(String),
}

impl Retryable for AggregatorError {
    fn is_transient(&self) -> bool {
        match self {
            AggregatorError::Timeout | AggregatorError::Transport(_) => true,
            AggregatorError::UnexpectedStatus { status, .. } => *status >= 500 || *status == 429,
            AggregatorError::Rejected(_) => false,
        }
    }
}

#[async_trait]
pub trait AggregatorClient: Send + Sync {
    async fn submit(
        &self,
        request: &MembershipAggregatorRequest,
        run_id: Uuid,
    ) -> Result<(), AggregatorError>;
}

/// Posts parts to a remote aggregation endpoint. Only `204 No Content`
/// counts as acceptance.
pub struct HttpAggregatorClient {
    client: reqwest::Client,
    url: String,
    function_key: Option<String>,
    policy: RetryPolicy,
}

impl HttpAggregatorClient {
    pub fn new(url: impl Into<String>, config: &AggregatorConfig) -> Result<Self, AggregatorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|err| AggregatorError::Transport(err.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            function_key: config.function_key.clone(),
            policy: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: Duration::from_millis(config.retry_base_delay_ms),
                max_delay: Duration::from_secs(300),
                jitter_factor: 0.0,
            },
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn post_once(&self, request: &MembershipAggregatorRequest) -> Result<(), AggregatorError> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(key) = &self.function_key {
            builder = builder.header(FUNCTION_KEY_HEADER, key);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                AggregatorError::Timeout
            } else {
                AggregatorError::Transport(err.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(AggregatorError::UnexpectedStatus {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl AggregatorClient for HttpAggregatorClient {
    async fn submit(
        &self,
        request: &MembershipAggregatorRequest,
        run_id: Uuid,
    ) -> Result<(), AggregatorError> {
        retry_transient(&self.policy, run_id, "membership_aggregator", || {
            self.post_once(request)
        })
        .await?;
        info!(
            run_id = %run_id,
            part = request.part_number,
            parts = request.parts_count,
            "Membership part handed to aggregator"
        );
        Ok(())
    }
}

/// Delivers parts to an aggregator running in this process.
pub struct LocalAggregatorClient {
    aggregator: Arc<MembershipAggregator>,
}

impl LocalAggregatorClient {
    pub fn new(aggregator: Arc<MembershipAggregator>) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl AggregatorClient for LocalAggregatorClient {
    async fn submit(
        &self,
        request: &MembershipAggregatorRequest,
        run_id: Uuid,
    ) -> Result<(), AggregatorError> {
        match self.aggregator.receive_part(request).await {
            Ok(receipt) => {
                debug!(run_id = %run_id, part = request.part_number, receipt = ?receipt, "Part accepted in process");
                Ok(())
            }
            Err(
                err @ (AggregationError::InvalidPart { .. }
                | AggregationError::Payload(_)
                | AggregationError::SyncFailed { .. }),
            ) => Err(AggregatorError::Rejected(err.to_string())),
            Err(err) => Err(AggregatorError::Transport(err.to_string())),
        }
    }
}
