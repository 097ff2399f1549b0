//! Migration to create the sync_jobs table.
//!
//! Each row is one recurring membership sync, identified by the composite
//! `(partition_key, row_key)` key. The `version` column backs conditional
//! writes so concurrent runs can detect that they lost ownership of a row.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncJobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncJobs::PartitionKey).text().not_null())
                    .col(ColumnDef::new(SyncJobs::RowKey).text().not_null())
                    .col(
                        ColumnDef::new(SyncJobs::TargetOfficeGroupId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(SyncJobs::Query).text().not_null())
                    .col(
                        ColumnDef::new(SyncJobs::Period)
                            .integer()
                            .not_null()
                            .default(24),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::StartDate)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::LastRunTime)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::DryRunTimeStamp)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::IsDryRunEnabled)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::Status)
                            .text()
                            .not_null()
                            .default("Idle"),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::ThresholdPercentageForAdditions)
                            .integer()
                            .not_null()
                            .default(100),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::ThresholdPercentageForRemovals)
                            .integer()
                            .not_null()
                            .default(10),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::ThresholdViolations)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SyncJobs::Requestor).text().not_null())
                    .col(ColumnDef::new(SyncJobs::RunId).uuid().null())
                    .col(
                        ColumnDef::new(SyncJobs::Version)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_sync_jobs")
                            .col(SyncJobs::PartitionKey)
                            .col(SyncJobs::RowKey),
                    )
                    .to_owned(),
            )
            .await?;

        // Due-job scans filter on these three columns
        manager
            .create_index(
                Index::create()
                    .name("idx_sync_jobs_enabled_status_start_date")
                    .table(SyncJobs::Table)
                    .col(SyncJobs::Enabled)
                    .col(SyncJobs::Status)
                    .col(SyncJobs::StartDate)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_jobs_enabled_status_start_date")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(SyncJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncJobs {
    Table,
    PartitionKey,
    RowKey,
    TargetOfficeGroupId,
    Query,
    Period,
    StartDate,
    LastRunTime,
    DryRunTimeStamp,
    Enabled,
    IsDryRunEnabled,
    Status,
    ThresholdPercentageForAdditions,
    ThresholdPercentageForRemovals,
    ThresholdViolations,
    Requestor,
    RunId,
    Version,
    CreatedAt,
    UpdatedAt,
}
