//! `hl`: Hyperliquid terminal client.
//!
//! Short-lived commands read market data through a warm local daemon when
//! one is running and fall back to direct exchange calls when it is not.
//! `hl server start` spawns this same binary detached as the daemon.

use std::fs;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hl_cli::paths::HlPaths;
use hl_cli::transport::Network;
use hl_cli::{commands, daemon};

#[derive(Parser)]
#[command(
    name = "hl",
    version,
    about = "Hyperliquid terminal client with a local market-data daemon",
    propagate_version = true,
)]
struct Cli {
    /// Target the testnet exchange instead of mainnet.
    #[arg(long, global = true)]
    testnet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the market-data daemon
    #[command(subcommand)]
    Server(ServerCommand),
    /// Read and write user configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Mid price for a coin (one-shot, or live with --watch)
    Price {
        coin: String,
        /// Stream updates instead of printing once
        #[arg(long)]
        watch: bool,
    },
    /// Live L2 order book for a coin
    Book { coin: String },
    /// Perp market metadata
    Meta {
        #[arg(long)]
        coin: Option<String>,
    },
    /// Metadata plus derived market state for one asset
    Asset { coin: String },
    /// Funding rates by symbol
    Funding {
        #[arg(long)]
        coin: Option<String>,
    },
    /// Live open orders for an address
    Orders {
        #[arg(long)]
        address: Option<String>,
    },
    /// Live positions (clearinghouse state) for an address
    Positions {
        #[arg(long)]
        address: Option<String>,
    },
    /// Live merged perp + spot balances for an address
    Balance {
        #[arg(long)]
        address: Option<String>,
    },
    /// Place and manage orders
    #[command(subcommand)]
    Trade(TradeCommand),
}

#[derive(Subcommand)]
enum ServerCommand {
    /// Start the daemon in the background
    Start,
    /// Stop a running daemon
    Stop,
    /// Show daemon status
    Status,
    /// Run the daemon in the foreground (used internally by `start`)
    #[command(hide = true)]
    Run,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Set a config key, e.g. `config set slippage 0.5`
    Set { key: String, value: String },
    /// Print one config value
    Get { key: String },
    /// Print the full config
    List,
}

#[derive(Subcommand)]
enum TradeCommand {
    /// Place an order: long/short are perp, buy/sell are spot. Without
    /// --price this is a market order sent as IOC at mid +/- slippage.
    Place {
        direction: String,
        coin: String,
        size: f64,
        /// Limit price (omit for a market order)
        #[arg(long)]
        price: Option<f64>,
        /// Slippage percent override for market orders
        #[arg(long)]
        slippage: Option<f64>,
    },
    /// Cancel an order by id
    Cancel { coin: String, oid: u64 },
    /// Set leverage for a coin
    Leverage {
        coin: String,
        leverage: u32,
        /// Cross margin instead of isolated
        #[arg(long)]
        cross: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let paths = HlPaths::resolve()?;
    let network = Network::from_testnet_flag(cli.testnet);

    if let Commands::Server(ServerCommand::Run) = cli.command {
        init_daemon_tracing(&paths)?;
        return daemon::run_foreground(&paths, cli.testnet).await;
    }
    init_cli_tracing();

    match cli.command {
        Commands::Server(ServerCommand::Start) => {
            commands::server_cmd::start(&paths, cli.testnet).await
        }
        Commands::Server(ServerCommand::Stop) => commands::server_cmd::stop(&paths).await,
        Commands::Server(ServerCommand::Status) => commands::server_cmd::status(&paths).await,
        Commands::Server(ServerCommand::Run) => unreachable!("handled above"),
        Commands::Config(ConfigCommand::Set { key, value }) => {
            commands::config_cmd::set(&paths, &key, &value)
        }
        Commands::Config(ConfigCommand::Get { key }) => commands::config_cmd::get(&paths, &key),
        Commands::Config(ConfigCommand::List) => commands::config_cmd::list(&paths),
        Commands::Price { coin, watch } => {
            commands::market::price(&paths, network, &coin, watch).await
        }
        Commands::Book { coin } => commands::market::book(network, &coin).await,
        Commands::Meta { coin } => {
            commands::market::meta(&paths, network, coin.as_deref()).await
        }
        Commands::Asset { coin } => commands::market::asset(&paths, network, &coin).await,
        Commands::Funding { coin } => {
            commands::market::funding(&paths, network, coin.as_deref()).await
        }
        Commands::Orders { address } => {
            commands::account::orders(network, address.as_deref()).await
        }
        Commands::Positions { address } => {
            commands::account::positions(network, address.as_deref()).await
        }
        Commands::Balance { address } => {
            commands::account::balance(network, address.as_deref()).await
        }
        Commands::Trade(TradeCommand::Place {
            direction,
            coin,
            size,
            price,
            slippage,
        }) => {
            commands::trade::place(&paths, network, &direction, &coin, size, price, slippage)
                .await
        }
        Commands::Trade(TradeCommand::Cancel { coin, oid }) => {
            commands::trade::cancel(&paths, network, &coin, oid).await
        }
        Commands::Trade(TradeCommand::Leverage {
            coin,
            leverage,
            cross,
        }) => commands::trade::leverage(&paths, network, &coin, leverage, cross).await,
    }
}

fn init_cli_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Daemon mode logs to `~/.hl/server.log`; the detached parent also points
/// the child's stdio there so panics end up in the same place.
fn init_daemon_tracing(paths: &HlPaths) -> Result<()> {
    paths.ensure_dir()?;
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log)
        .with_context(|| format!("open {}", paths.log.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(file))
        .init();
    Ok(())
}
