use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use quasi_board::{api, config::BoardConfig, logging, node::BoardNode};
use quasi_ledger::Ledger;
use quasi_signatures::ActorKeys;

#[derive(Parser)]
#[command(name = "quasi-board")]
#[command(about = "QUASI federated task board: ActivityPub actor with a hash-chained ledger", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbosity level (can be repeated)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the board server
    Start {
        /// Data directory for ledger, keys and followers
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Address to bind the HTTP server to
        #[arg(long)]
        bind: Option<String>,
    },

    /// Write a default configuration file
    Init {
        /// Output directory for the configuration
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Generate (or show) the actor keypair
    Keygen {
        /// Data directory holding the keys
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
    },

    /// Verify the ledger chain and exit
    Verify {
        /// Data directory holding the ledger
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present; real environment wins
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // A named config file must parse; a missing default is fine
    let mut config = if let Some(ref path) = cli.config {
        BoardConfig::from_file(path)?
    } else if Path::new("./quasi-board.toml").exists() {
        BoardConfig::from_file(Path::new("./quasi-board.toml"))?
    } else {
        BoardConfig::default()
    };
    config.apply_env();

    logging::init_logging(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Start { data_dir, bind } => {
            if let Some(data_dir) = data_dir {
                config.board.data_dir = data_dir;
            }
            if let Some(bind) = bind {
                config.board.bind_addr = bind;
            }

            info!(
                version = env!("CARGO_PKG_VERSION"),
                base_url = %config.board.base_url,
                data_dir = ?config.board.data_dir,
                bind = %config.board.bind_addr,
                "Starting quasi-board"
            );

            let node = Arc::new(BoardNode::new(config.clone()).await?);

            // Refuse to serve a corrupted chain
            let report = node.ledger.verify_chain().await;
            if !report.valid {
                error!(
                    broken_at = ?report.broken_at,
                    reason = ?report.reason,
                    "Ledger chain verification failed at startup"
                );
                std::process::exit(2);
            }
            info!(entries = node.ledger.len().await, "Ledger chain verified");

            // Task list: upstream if reachable, genesis list otherwise
            if let Err(e) = node.projector.refresh().await {
                info!(error = %e, "Initial task fetch failed");
                node.projector.ensure_seed_tasks().await;
            }
            let refresh_handle = node.projector.clone().spawn_refresh_loop();

            let api_handle = api::start_api_server(node.clone(), &config.board.bind_addr).await?;

            info!(actor = %node.actor_url(), "Board ready");

            tokio::signal::ctrl_c().await?;
            info!("Shutting down gracefully");

            api_handle.abort();
            refresh_handle.abort();
            Ok(())
        }

        Commands::Init { output } => {
            std::fs::create_dir_all(&output)?;
            let config_path = output.join("quasi-board.toml");
            config.save_to_file(&config_path)?;
            info!(path = ?config_path, "Configuration saved");
            println!("Configuration written to {:?}", config_path);
            Ok(())
        }

        Commands::Keygen { data_dir } => {
            let keys = ActorKeys::load_or_generate(&data_dir)
                .map_err(|e| anyhow::anyhow!("Keygen failed: {}", e))?;
            println!("{}", keys.public_key_pem());
            Ok(())
        }

        Commands::Verify { data_dir } => {
            let ledger = Ledger::open(&data_dir)
                .map_err(|e| anyhow::anyhow!("Failed to open ledger: {}", e))?;
            let report = ledger.verify_chain().await;
            let entries = ledger.len().await;

            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "valid": report.valid,
                    "broken_at": report.broken_at,
                    "reason": report.reason,
                    "entries": entries,
                }))
                .context("Failed to render report")?
            );

            if !report.valid {
                std::process::exit(2);
            }
            Ok(())
        }
    }
}
