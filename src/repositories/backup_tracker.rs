//! Backup tracker rows: one per snapshot taken of a source table.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set,
};

use super::sync_job::to_db_time;
use crate::models::backup_tracker::{ActiveModel, Column, Entity, Model};

#[derive(Clone)]
pub struct BackupTrackerRepository {
    db: Arc<DatabaseConnection>,
}

impl BackupTrackerRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn record(
        &self,
        source_table_name: &str,
        backup_table_name: &str,
        row_count: i64,
        location: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Model, DbErr> {
        ActiveModel {
            source_table_name: Set(source_table_name.to_string()),
            backup_table_name: Set(backup_table_name.to_string()),
            row_count: Set(row_count),
            location: Set(location.to_string()),
            created_at: Set(to_db_time(created_at)),
        }
        .insert(self.db.as_ref())
        .await
    }

    /// Most recent snapshot of `source_table_name`, if any.
    pub async fn latest(&self, source_table_name: &str) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::SourceTableName.eq(source_table_name))
            .order_by_desc(Column::CreatedAt)
            .one(self.db.as_ref())
            .await
    }

    pub async fn list_older_than(
        &self,
        source_table_name: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::SourceTableName.eq(source_table_name))
            .filter(Column::CreatedAt.lt(to_db_time(cutoff)))
            .order_by_asc(Column::CreatedAt)
            .all(self.db.as_ref())
            .await
    }

    pub async fn delete(&self, source_table_name: &str, backup_table_name: &str) -> Result<(), DbErr> {
        Entity::delete_by_id((source_table_name.to_string(), backup_table_name.to_string()))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }
}
