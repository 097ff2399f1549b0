//! Directory identities and the membership payload exchanged between the
//! collection and apply stages.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// A directory user. Equality and ordering are by object id only.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
pub struct AzureAdUser {
    pub object_id: Uuid,
}

impl AzureAdUser {
    pub fn new(object_id: Uuid) -> Self {
        Self { object_id }
    }
}

/// A directory group reference.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
pub struct AzureAdGroup {
    pub object_id: Uuid,
}

impl AzureAdGroup {
    pub fn new(object_id: Uuid) -> Self {
        Self { object_id }
    }
}

/// Serializable membership snapshot produced by one orchestration part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GroupMembership {
    pub destination: AzureAdGroup,
    pub source_members: Vec<AzureAdUser>,
    pub run_id: Uuid,
    pub sync_job_partition_key: String,
    pub sync_job_row_key: String,
    pub membership_obtainer_dry_run_enabled: bool,
    /// 1-based part index
    pub part_number: u32,
    pub parts_count: u32,
    /// Set on the message that closes the run's session
    #[serde(default)]
    pub is_last_message: bool,
    /// The part carries the destination group's current members
    #[serde(default)]
    pub is_destination_part: bool,
}
