use std::time::Duration;

use clap::Subcommand;
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;
use tracing::info;

use super::migrations::Migrator;

pub async fn establish_connection(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(database_url.to_string());
    options
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);

    // Each pooled connection to `sqlite::memory:` would open its own empty database
    if database_url.contains(":memory:") {
        options.min_connections(1).max_connections(1);
    } else {
        options.max_connections(8);
    }

    Database::connect(options).await
}

pub fn get_database_url(database_path: Option<&str>) -> String {
    match database_path {
        Some(":memory:") => "sqlite::memory:".to_string(),
        Some(path) if path.starts_with("sqlite:") => path.to_string(),
        Some(path) => format!("sqlite:{}?mode=rwc", path),
        None => "sqlite:derivation-ledger.db?mode=rwc".to_string(),
    }
}

/// Connect and bring the schema up to date
pub async fn setup_database(database_path: &str) -> Result<DatabaseConnection, DbErr> {
    let database_url = get_database_url(Some(database_path));
    let db = establish_connection(&database_url).await?;
    Migrator::up(&db, None).await?;
    info!("Database migrations completed");
    Ok(db)
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateDirection {
    Up,
    Down,
    Fresh,
}

pub async fn migrate_database(database_path: &str, direction: MigrateDirection) -> Result<(), DbErr> {
    let database_url = get_database_url(Some(database_path));
    let db = establish_connection(&database_url).await?;

    match direction {
        MigrateDirection::Up => {
            info!("Running migrations up");
            Migrator::up(&db, None).await?;
        }
        MigrateDirection::Down => {
            info!("Running migrations down");
            Migrator::down(&db, None).await?;
        }
        MigrateDirection::Fresh => {
            info!("Running fresh migrations (down then up)");
            Migrator::down(&db, None).await?;
            Migrator::up(&db, None).await?;
        }
    }

    info!("Database migration completed");
    Ok(())
}
