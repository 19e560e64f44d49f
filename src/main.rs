//! Colorbet engine binary
//!
//! Runs the round clock with an optional TOML config, seeds demo users and
//! logs the event stream until Ctrl-C.

use clap::Parser;
use colorbet::config::StorageBackend;
use colorbet::{open_store, ConfigLoader, GameEngine, GameEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "colorbet")]
#[command(about = "Colorbet round lifecycle engine", long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(long)]
    config: Option<String>,

    /// Use the RocksDB store at this directory
    #[arg(long)]
    db_path: Option<String>,

    /// Round length in seconds
    #[arg(long)]
    round_secs: Option<u32>,

    /// Number of demo users to register
    #[arg(long, default_value = "0")]
    demo_users: usize,

    /// Starting balance of each demo user, in minor units
    #[arg(long, default_value = "100000")]
    demo_balance: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "colorbet=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    if let Some(path) = args.db_path {
        config.storage.backend = StorageBackend::Rocksdb;
        config.storage.data_directory = path;
    }
    if let Some(secs) = args.round_secs {
        config.round.round_duration_secs = secs;
    }

    let store = open_store(&config.storage)?;
    let engine = GameEngine::new(config, store).await?;

    for i in 1..=args.demo_users {
        let user_id = format!("demo-{}", i);
        match engine.get_user(&user_id).await {
            Ok(user) => info!("{} already present with balance {}", user_id, user.balance),
            Err(_) => {
                engine.register_user(&user_id, args.demo_balance).await?;
            }
        }
    }

    let mut events = engine.subscribe();
    let handle = engine.spawn()?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(GameEvent::TimerUpdate { .. }) => {}
                Ok(GameEvent::NewOutcome { outcome }) => {
                    info!("Round {} outcome: {} {} {}", outcome.round_id, outcome.number, outcome.color, outcome.size);
                }
                Ok(GameEvent::RoundSettled { round_id, bets_settled, total_payout }) => {
                    info!("Round {} closed: {} bets, {} paid out", round_id, bets_settled, total_payout);
                }
                Ok(GameEvent::BalanceUpdate { .. }) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Event log lagged; {} events skipped", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    if let Some(state) = handle.shutdown().await {
        info!("Stopped during round {} ({:?})", state.round_id, state.phase);
    }
    info!("Final metrics: {}", serde_json::to_string(&engine.metrics())?);
    Ok(())
}
