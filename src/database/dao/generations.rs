use crate::database::dao::map_db_err;
use crate::database::entities::generations;
use crate::database::DatabaseResult;
use sea_orm::{ActiveModelTrait, DatabaseConnection, IntoActiveModel};

/// Generations DAO. Rows are written once and never updated.
pub struct GenerationsDao {
    db: DatabaseConnection,
}

impl GenerationsDao {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn insert(&self, row: &generations::Model) -> DatabaseResult<String> {
        row.clone()
            .into_active_model()
            .insert(&self.db)
            .await
            .map_err(map_db_err)?;
        Ok(row.id.clone())
    }

    pub async fn get_by_request_id(
        &self,
        request_id: &str,
    ) -> DatabaseResult<Option<generations::Model>> {
        use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

        generations::Entity::find()
            .filter(generations::Column::RequestId.eq(request_id))
            .one(&self.db)
            .await
            .map_err(map_db_err)
    }
}
