//! Migration to create the backup_trackers table.
//!
//! Records one row per backup snapshot so consecutive backups of the same
//! source table can be compared by row count and aged snapshots pruned.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(BackupTrackers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(BackupTrackers::SourceTableName)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BackupTrackers::BackupTableName)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BackupTrackers::RowCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(BackupTrackers::Location).text().not_null())
                    .col(
                        ColumnDef::new(BackupTrackers::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_backup_trackers")
                            .col(BackupTrackers::SourceTableName)
                            .col(BackupTrackers::BackupTableName),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(BackupTrackers::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum BackupTrackers {
    Table,
    SourceTableName,
    BackupTableName,
    RowCount,
    Location,
    CreatedAt,
}
