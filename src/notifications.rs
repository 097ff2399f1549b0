//! Email notifications to job requestors.
//!
//! Messages are rendered from named templates and handed to a
//! [`NotificationSender`]. The default sender writes each rendered message to
//! an outbox in blob storage for a mail relay to pick up.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::NotificationConfig;
use crate::storage::{BlobStore, StorageError};

pub const SYNC_DISABLED_NO_VALID_GROUP_IDS: &str = "SyncDisabledNoValidGroupIds";
pub const SYNC_THRESHOLD_INCREASE: &str = "SyncThresholdIncreaseEmailBody";
pub const SYNC_THRESHOLD_DECREASE: &str = "SyncThresholdDecreaseEmailBody";

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("unknown email template '{0}'")]
    UnknownTemplate(String),
    #[error("template '{template}' is missing parameter '{param}'")]
    MissingParameter { template: String, param: String },
    #[error("failed to queue email: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to encode email: {0}")]
    Encode(#[from] serde_json::Error),
}

struct Template {
    id: &'static str,
    subject: &'static str,
    body: &'static str,
}

const TEMPLATES: &[Template] = &[
    Template {
        id: SYNC_DISABLED_NO_VALID_GROUP_IDS,
        subject: "Membership sync disabled for group {destinationGroupId}",
        body: "The sync into group {destinationGroupId} has been disabled because its \
               source query '{query}' does not contain any valid group ids. Update the \
               job's query and re-enable it to resume syncing.",
    },
    Template {
        id: SYNC_THRESHOLD_INCREASE,
        subject: "Membership sync for group {destinationGroupId} was paused",
        body: "The sync into group {destinationGroupId} would add {count} users, which is \
               {percentage}% of its current membership and above the {threshold}% allowed \
               for additions. No changes were made. Consecutive violations: {violations}.",
    },
    Template {
        id: SYNC_THRESHOLD_DECREASE,
        subject: "Membership sync for group {destinationGroupId} was paused",
        body: "The sync into group {destinationGroupId} would remove {count} users, which \
               is {percentage}% of its current membership and above the {threshold}% \
               allowed for removals. No changes were made. Consecutive violations: \
               {violations}.",
    },
];

/// A rendered message ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub template_id: String,
    pub sender: String,
    pub recipient: String,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Substitutes `{name}` placeholders; every placeholder must have a value.
fn render(
    template_id: &str,
    text: &str,
    params: &BTreeMap<String, String>,
) -> Result<String, NotificationError> {
    let mut rendered = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            rendered.push_str(&rest[start..]);
            return Ok(rendered);
        };
        let name = &after[..end];
        let value = params
            .get(name)
            .ok_or_else(|| NotificationError::MissingParameter {
                template: template_id.to_string(),
                param: name.to_string(),
            })?;
        rendered.push_str(value);
        rest = &after[end + 1..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

pub fn render_email(
    template_id: &str,
    sender: &str,
    recipient: &str,
    cc: &[String],
    params: &BTreeMap<String, String>,
    run_id: Uuid,
) -> Result<EmailMessage, NotificationError> {
    let template = TEMPLATES
        .iter()
        .find(|template| template.id == template_id)
        .ok_or_else(|| NotificationError::UnknownTemplate(template_id.to_string()))?;

    Ok(EmailMessage {
        template_id: template_id.to_string(),
        sender: sender.to_string(),
        recipient: recipient.to_string(),
        cc: cc.to_vec(),
        subject: render(template_id, template.subject, params)?,
        body: render(template_id, template.body, params)?,
        run_id,
        created_at: Utc::now(),
    })
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(
        &self,
        template_id: &str,
        recipient: &str,
        cc: &[String],
        params: &BTreeMap<String, String>,
        run_id: Uuid,
    ) -> Result<(), NotificationError>;
}

/// Renders messages into `outbox/{run_id}/{message_id}.json`.
pub struct OutboxNotificationSender {
    blobs: Arc<dyn BlobStore>,
    config: NotificationConfig,
}

impl OutboxNotificationSender {
    pub fn new(blobs: Arc<dyn BlobStore>, config: NotificationConfig) -> Self {
        Self { blobs, config }
    }
}

#[async_trait]
impl NotificationSender for OutboxNotificationSender {
    async fn send(
        &self,
        template_id: &str,
        recipient: &str,
        cc: &[String],
        params: &BTreeMap<String, String>,
        run_id: Uuid,
    ) -> Result<(), NotificationError> {
        let mut all_cc = cc.to_vec();
        all_cc.extend(self.config.support_cc_addresses.iter().cloned());

        let message = render_email(
            template_id,
            &self.config.sender_address,
            recipient,
            &all_cc,
            params,
            run_id,
        )?;
        let path = format!("outbox/{}/{}.json", run_id, Uuid::new_v4());
        self.blobs.write(&path, serde_json::to_vec(&message)?).await?;

        counter!("notifications_queued_total", "template" => template_id.to_string())
            .increment(1);
        info!(
            run_id = %run_id,
            template = template_id,
            recipient,
            path = %path,
            "Queued notification email"
        );
        Ok(())
    }
}
