use crate::config::Config;
use crate::database::DatabaseManager;
use crate::error::AppError;
use clap::Subcommand;
use tracing::info;

#[derive(Subcommand)]
pub enum Commands {
    /// Run database migrations and exit
    Migrate,
}

pub async fn handle_command(command: Commands, config: &Config) -> Result<(), AppError> {
    match command {
        Commands::Migrate => {
            let database = DatabaseManager::new_from_config(&config.database).await?;
            database.migrate().await?;
            info!("Migrations complete");
            Ok(())
        }
    }
}
