use super::Sessions;
use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Sessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Sessions::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Sessions::CookieText).text().not_null())
                    .col(ColumnDef::new(Sessions::CookieHash).string().not_null())
                    .col(ColumnDef::new(Sessions::Provider).string().not_null())
                    .col(
                        ColumnDef::new(Sessions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Sessions::LastUsedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Sessions::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Sessions::UsageCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Sessions::SuccessCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Sessions::FailureCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Sessions::Status)
                            .string_len(16)
                            .not_null()
                            .default("healthy"),
                    )
                    .col(
                        ColumnDef::new(Sessions::LastHealthCheckAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Sessions::Metadata).json().not_null())
                    .to_owned(),
            )
            .await?;

        // One cookie per provider
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sessions_provider_cookie_hash")
                    .table(Sessions::Table)
                    .col(Sessions::Provider)
                    .col(Sessions::CookieHash)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Acquire scans filter on (status, provider) and order by last_used_at
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sessions_status_provider")
                    .table(Sessions::Table)
                    .col(Sessions::Status)
                    .col(Sessions::Provider)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sessions_last_used_at")
                    .table(Sessions::Table)
                    .col(Sessions::LastUsedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Sessions::Table).to_owned())
            .await
    }
}
