use super::{Generations, Sessions};
use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Generations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Generations::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Generations::RequestId).string().not_null())
                    .col(ColumnDef::new(Generations::SessionId).string().null())
                    .col(ColumnDef::new(Generations::Provider).string().not_null())
                    .col(ColumnDef::new(Generations::Model).string().not_null())
                    .col(ColumnDef::new(Generations::Prompt).text().not_null())
                    .col(
                        ColumnDef::new(Generations::PromptTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Generations::ResponseText).text().null())
                    .col(
                        ColumnDef::new(Generations::ResponseTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Generations::ResponseRaw).json().null())
                    .col(ColumnDef::new(Generations::Status).integer().not_null())
                    .col(ColumnDef::new(Generations::LatencyMs).integer().not_null())
                    .col(ColumnDef::new(Generations::ErrorMessage).string().null())
                    .col(
                        ColumnDef::new(Generations::ReasoningTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Generations::AudioTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Generations::ImageTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Generations::CachedTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Generations::AcceptedPredictionTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Generations::RejectedPredictionTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Generations::NumSourcesUsed)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Generations::ResponseId).string().null())
                    .col(
                        ColumnDef::new(Generations::PreviousResponseId)
                            .string()
                            .null(),
                    )
                    .col(ColumnDef::new(Generations::Temperature).float().null())
                    .col(ColumnDef::new(Generations::TopP).float().null())
                    .col(ColumnDef::new(Generations::MaxOutputTokens).integer().null())
                    .col(
                        ColumnDef::new(Generations::ParallelToolCalls)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(Generations::ToolChoice).string().null())
                    .col(ColumnDef::new(Generations::FinishReason).string().null())
                    .col(ColumnDef::new(Generations::ReasoningContent).text().null())
                    .col(
                        ColumnDef::new(Generations::IncompleteDetails)
                            .string()
                            .null(),
                    )
                    .col(ColumnDef::new(Generations::Annotations).json().null())
                    .col(
                        ColumnDef::new(Generations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        if manager.get_database_backend() == sea_orm::DatabaseBackend::Postgres {
            manager
                .create_foreign_key(
                    ForeignKey::create()
                        .name("fk_generations_session_id")
                        .from(Generations::Table, Generations::SessionId)
                        .to(Sessions::Table, Sessions::Id)
                        .on_delete(ForeignKeyAction::SetNull)
                        .to_owned(),
                )
                .await?;
        }

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_generations_request_id")
                    .table(Generations::Table)
                    .col(Generations::RequestId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_generations_created_at")
                    .table(Generations::Table)
                    .col(Generations::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Generations::Table).to_owned())
            .await
    }
}
