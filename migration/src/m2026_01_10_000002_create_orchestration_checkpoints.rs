//! Migration to create the orchestration_checkpoints table.
//!
//! One row per orchestration instance (`run_id` + part number). The `state`
//! column holds the serialized state machine together with its command log.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OrchestrationCheckpoints::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OrchestrationCheckpoints::InstanceId)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(OrchestrationCheckpoints::RunId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OrchestrationCheckpoints::PartitionKey)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OrchestrationCheckpoints::RowKey)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OrchestrationCheckpoints::TargetOfficeGroupId)
                            .uuid()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(OrchestrationCheckpoints::CurrentPart)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OrchestrationCheckpoints::Phase)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OrchestrationCheckpoints::State)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OrchestrationCheckpoints::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(OrchestrationCheckpoints::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(OrchestrationCheckpoints::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Runtime history lookups scan completed instances per destination group
        manager
            .create_index(
                Index::create()
                    .name("idx_orchestration_checkpoints_target_completed")
                    .table(OrchestrationCheckpoints::Table)
                    .col(OrchestrationCheckpoints::TargetOfficeGroupId)
                    .col(OrchestrationCheckpoints::CompletedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_orchestration_checkpoints_target_completed")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(
                Table::drop()
                    .table(OrchestrationCheckpoints::Table)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum OrchestrationCheckpoints {
    Table,
    InstanceId,
    RunId,
    PartitionKey,
    RowKey,
    TargetOfficeGroupId,
    CurrentPart,
    Phase,
    State,
    StartedAt,
    UpdatedAt,
    CompletedAt,
}
