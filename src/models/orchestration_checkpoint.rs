//! OrchestrationCheckpoint entity model
//!
//! Persisted state of one orchestration instance. The serialized state machine
//! and its pending command log live in the `state` JSON column.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "orchestration_checkpoints")]
pub struct Model {
    /// `{run_id}:{current_part}`
    #[sea_orm(primary_key, auto_increment = false)]
    pub instance_id: String,

    pub run_id: Uuid,

    pub partition_key: String,

    pub row_key: String,

    /// Destination group, known once the job has been loaded
    pub target_office_group_id: Option<Uuid>,

    pub current_part: i32,

    /// Name of the phase the instance last persisted
    pub phase: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub state: JsonValue,

    pub started_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    pub completed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
