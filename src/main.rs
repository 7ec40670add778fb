use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use derivation_ledger::app_context::LedgerContext;
use derivation_ledger::config::LedgerConfig;
use derivation_ledger::database::{migrate_database, MigrateDirection};

#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    #[clap(short, long, global = true)]
    log_level: Option<String>,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[cfg(feature = "server")]
    Serve {
        #[clap(short, long, default_value = "3000")]
        port: u16,
        /// Overrides LEDGER_DATABASE
        #[clap(short, long)]
        database: Option<String>,
        #[clap(long)]
        cors_origin: Option<String>,
    },
    Db {
        #[clap(subcommand)]
        command: DbCommands,
    },
    /// Resolve derivations left pending longer than the threshold
    Reconcile {
        #[clap(short, long)]
        database: Option<String>,
        /// Defaults to LEDGER_STALE_AFTER_SECS
        #[clap(long)]
        older_than_secs: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum DbCommands {
    Init {
        #[clap(short, long, default_value = "derivation-ledger.db")]
        database: String,
    },
    Migrate {
        #[clap(subcommand)]
        direction: MigrateDirection,
        #[clap(short, long, default_value = "derivation-ledger.db")]
        database: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    setup_logging(&args.log_level);

    match args.command {
        #[cfg(feature = "server")]
        Commands::Serve {
            port,
            database,
            cors_origin,
        } => {
            let mut config = LedgerConfig::from_env();
            if let Some(database) = database {
                config.database_path = database;
            }
            info!("Starting server on port {}", port);
            let context = LedgerContext::from_config(config).await?;
            derivation_ledger::server::start_server(port, context, cors_origin.as_deref()).await?;
        }
        Commands::Db { command } => match command {
            DbCommands::Init { database } => {
                info!("Initializing database: {}", database);
                migrate_database(&database, MigrateDirection::Up).await?;
            }
            DbCommands::Migrate { direction, database } => {
                info!("Running database migration: {:?}", direction);
                migrate_database(&database, direction).await?;
            }
        },
        Commands::Reconcile {
            database,
            older_than_secs,
        } => {
            let mut config = LedgerConfig::from_env();
            if let Some(database) = database {
                config.database_path = database;
            }
            let older_than = older_than_secs
                .map(std::time::Duration::from_secs)
                .unwrap_or(config.stale_after);

            let context = LedgerContext::from_config(config).await?;
            let report = context.reconciler().run(older_than).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn setup_logging(log_level: &Option<String>) {
    let log_level = match log_level
        .as_ref()
        .unwrap_or(&"info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!("sqlx=warn,hyper=info,{}", log_level)))
        .without_time()
        .init();
}
