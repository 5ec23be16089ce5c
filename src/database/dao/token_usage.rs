use crate::database::dao::map_db_err;
use crate::database::entities::token_usage;
use crate::database::DatabaseResult;
use sea_orm::{ActiveModelTrait, DatabaseConnection, IntoActiveModel};

/// Token usage DAO. Append-only; one row per successful generation.
pub struct TokenUsageDao {
    db: DatabaseConnection,
}

impl TokenUsageDao {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn insert(&self, row: &token_usage::Model) -> DatabaseResult<String> {
        row.clone()
            .into_active_model()
            .insert(&self.db)
            .await
            .map_err(map_db_err)?;
        Ok(row.id.clone())
    }

    pub async fn get_by_generation_id(
        &self,
        generation_id: &str,
    ) -> DatabaseResult<Option<token_usage::Model>> {
        use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

        token_usage::Entity::find()
            .filter(token_usage::Column::GenerationId.eq(generation_id))
            .one(&self.db)
            .await
            .map_err(map_db_err)
    }
}
