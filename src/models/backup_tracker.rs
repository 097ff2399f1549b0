//! BackupTracker entity model

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

/// One recorded backup snapshot of a source table
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "backup_trackers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub source_table_name: String,

    /// `zzBackup{Source}{yyyyMMddHHmmss}`
    #[sea_orm(primary_key, auto_increment = false)]
    pub backup_table_name: String,

    pub row_count: i64,

    /// Blob path of the snapshot
    pub location: String,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
