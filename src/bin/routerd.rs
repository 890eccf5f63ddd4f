//! Router binary

use clap::{Parser, Subcommand};
use helmsman::router::remote::http_nodes;
use helmsman::{Config, Router};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "helmsman-router")]
#[command(about = "cluster router and replication manager for repository hosting")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the router
    Serve {
        /// Config file (virtual storages, backends, tuning)
        #[arg(long)]
        config: PathBuf,

        /// Router instance name (overrides the config file)
        #[arg(long)]
        name: Option<String>,

        /// Bind address for the admin API (overrides the config file)
        #[arg(long)]
        bind: Option<String>,

        /// Placement store directory (overrides the config file)
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Validate a config file and exit
    CheckConfig {
        /// Config file to validate
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            name,
            bind,
            db,
        } => {
            let mut config = Config::from_file(&config)?;
            if let Some(name) = name {
                config.router_name = name;
            }
            if let Some(bind) = bind {
                config.bind_addr = bind.parse()?;
            }
            if let Some(db) = db {
                config.db_path = db;
            }
            config.validate()?;

            let nodes = http_nodes(&config);
            let router = Router::new(config, nodes)?;
            router.serve().await?;
        }

        Commands::CheckConfig { config } => {
            let config = Config::from_file(&config)?;
            config.validate()?;
            println!("configuration ok: {} virtual storages", config.virtual_storages.len());
        }
    }

    Ok(())
}
