use sea_orm_migration::prelude::*;

pub use sea_orm_migration::MigratorTrait;

mod m20250301_100000_create_sessions_table;
mod m20250301_100100_create_generations_table;
mod m20250301_100200_create_token_usage_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_100000_create_sessions_table::Migration),
            Box::new(m20250301_100100_create_generations_table::Migration),
            Box::new(m20250301_100200_create_token_usage_table::Migration),
        ]
    }
}

/// Common table and column identifiers
#[derive(Iden)]
pub enum Sessions {
    Table,
    Id,
    CookieText,
    CookieHash,
    Provider,
    CreatedAt,
    LastUsedAt,
    ExpiresAt,
    UsageCount,
    SuccessCount,
    FailureCount,
    Status,
    LastHealthCheckAt,
    Metadata,
}

#[derive(Iden)]
pub enum Generations {
    Table,
    Id,
    RequestId,
    SessionId,
    Provider,
    Model,
    Prompt,
    PromptTokens,
    ResponseText,
    ResponseTokens,
    ResponseRaw,
    Status,
    LatencyMs,
    ErrorMessage,
    ReasoningTokens,
    AudioTokens,
    ImageTokens,
    CachedTokens,
    AcceptedPredictionTokens,
    RejectedPredictionTokens,
    NumSourcesUsed,
    ResponseId,
    PreviousResponseId,
    Temperature,
    TopP,
    MaxOutputTokens,
    ParallelToolCalls,
    ToolChoice,
    FinishReason,
    ReasoningContent,
    IncompleteDetails,
    Annotations,
    CreatedAt,
}

#[derive(Iden)]
pub enum TokenUsage {
    Table,
    Id,
    GenerationId,
    UserId,
    SessionId,
    CreatedAt,
    Provider,
    Model,
    PromptTextTokens,
    PromptAudioTokens,
    PromptImageTokens,
    PromptCachedTokens,
    PromptTotalTokens,
    CompletionReasoningTokens,
    CompletionAudioTokens,
    CompletionTextTokens,
    CompletionAcceptedPredictionTokens,
    CompletionRejectedPredictionTokens,
    CompletionTotalTokens,
    TotalTokens,
    PromptCostMicroUsd,
    CompletionCostMicroUsd,
    TotalCostMicroUsd,
}
