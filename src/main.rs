/// BullX Auto - Main entry point
/// Monitors bracket orders in the trading terminal and re-arms consumed slots

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bullx_auto::api::start_api_server;
use bullx_auto::brackets;
use bullx_auto::executor;
use bullx_auto::persistence::Store;
use bullx_auto::scheduler::{MonitorRegistry, SessionFactory};
use bullx_auto::settings::Config;
use bullx_auto::terminal::{DryRunTerminal, UiTerminal};

#[derive(Parser)]
#[command(name = "bullx-auto", about = "Bracket-order lifecycle bot", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitor loops for every configured profile
    Run {
        /// Use the scriptable dry-run terminal instead of a live session
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        dry_run: bool,
    },
    /// Deploy a full bracket strategy on a token
    Place {
        /// Token contract address
        #[arg(long)]
        address: String,
        /// Total investment, split across the four slots
        #[arg(long)]
        amount: f64,
        /// Market cap to script the dry-run terminal with
        #[arg(long)]
        market_cap: f64,
        /// Record placements without a live session
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        dry_run: bool,
    },
    /// Show the price table a market cap would deploy
    Preview {
        #[arg(long)]
        market_cap: f64,
        #[arg(long, default_value_t = 1.0)]
        amount: f64,
    },
    /// Self-check the bracket tables
    Validate,
    /// Report every persisted order, grouped by coin
    Status,
    /// Show recent cycle audit rows for a profile
    Tasks {
        #[arg(long)]
        profile: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Run only the HTTP API
    Serve,
}

/// Session factory for dry runs: every cycle gets a fresh empty terminal.
struct DryRunSessionFactory;

impl SessionFactory for DryRunSessionFactory {
    fn open(&self, _profile: &str) -> Result<Arc<dyn UiTerminal>> {
        Ok(Arc::new(DryRunTerminal::new()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Misconfigured price tables must never reach a terminal
    let problems = brackets::validate();
    if !problems.is_empty() {
        for p in &problems {
            eprintln!("bracket configuration error: {p}");
        }
        bail!("{} bracket configuration error(s)", problems.len());
    }

    let cli = Cli::parse();
    match cli.command {
        Command::Run { dry_run } => run(dry_run).await,
        Command::Place {
            address,
            amount,
            market_cap,
            dry_run,
        } => place(&address, amount, market_cap, dry_run).await,
        Command::Preview { market_cap, amount } => {
            preview(market_cap, amount);
            Ok(())
        }
        Command::Validate => {
            // validate() already passed above
            println!("bracket tables OK ({} brackets)", brackets::BRACKETS.len());
            Ok(())
        }
        Command::Status => status(),
        Command::Tasks { profile, limit } => tasks(&profile, limit),
        Command::Serve => serve().await,
    }
}

async fn run(dry_run: bool) -> Result<()> {
    if !dry_run {
        bail!(
            "no live terminal driver is configured; run with --dry-run \
             or plug a driver into the session factory"
        );
    }
    let config = Config::from_env()?;
    let store = Arc::new(Store::open(&config.db_path)?);

    let registry = MonitorRegistry::new(
        Arc::clone(&store),
        Arc::new(DryRunSessionFactory),
        config.scheduler_config(),
    );
    for profile in &config.profiles {
        if let Some(key) = config.api_keys.get(profile) {
            store.upsert_profile(profile, key)?;
        }
        registry.start_profile(profile)?;
    }
    info!(profiles = config.profiles.len(), "monitors running");

    if config.api_enabled {
        start_api_server(config.api_config(), Arc::clone(&store))
            .await
            .map_err(|e| anyhow::anyhow!("failed to start HTTP API: {e}"))?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    warn!("shutdown signal received");
    registry.stop_all();
    Ok(())
}

async fn place(address: &str, amount: f64, market_cap: f64, dry_run: bool) -> Result<()> {
    if !dry_run {
        bail!("no live terminal driver is configured; run with --dry-run");
    }
    let config = Config::from_env()?;
    let store = Store::open(&config.db_path)?;
    let profile = config
        .profiles
        .first()
        .context("no profiles configured")?
        .clone();

    let terminal = DryRunTerminal::new();
    terminal.add_known_address(address);
    terminal.set_capitalization(market_cap);

    let report = executor::execute_bracket_strategy(&terminal, &store, &profile, address, amount)
        .await?;
    println!(
        "bracket {} deployed at cap {}: {} placed, {} failed",
        report.bracket,
        report.market_cap,
        report.placed.len(),
        report.failed.len()
    );
    for order in &report.placed {
        println!(
            "  slot {}: entry {} tp {} sl {} amount {}",
            order.bracket_id,
            order.entry_price,
            order.take_profit,
            order.stop_loss,
            order.amount.unwrap_or(0.0)
        );
    }
    for (slot, reason) in &report.failed {
        println!("  slot {slot}: FAILED ({reason})");
    }
    terminal.close_session().await.ok();
    Ok(())
}

fn preview(market_cap: f64, amount: f64) {
    let preview = executor::bracket_preview(market_cap, amount);
    let def = preview.definition;
    println!(
        "bracket {}: {} (stop loss {})",
        def.bracket, def.description, def.stop_loss_market_cap
    );
    for slot in &preview.slots {
        println!(
            "  slot {}: entry {} tp {} (x{:.2}) amount {:.4} ({:.1}%)",
            slot.slot,
            slot.entry_price,
            slot.take_profit,
            slot.tp_multiplier,
            slot.amount,
            slot.allocation * 100.0
        );
    }
}

fn status() -> Result<()> {
    let config = Config::from_env()?;
    let store = Store::open(&config.db_path)?;
    let coins = store.all_coins()?;
    if coins.is_empty() {
        println!("no coins tracked");
        return Ok(());
    }
    for coin in coins {
        println!(
            "{} ({}) cap {:?} bracket {:?}",
            coin.name.as_deref().unwrap_or("?"),
            coin.address,
            coin.market_cap,
            coin.bracket
        );
        for order in store.orders_by_coin(coin.id)? {
            println!(
                "  [{}] slot {} entry {} trigger {:?} ({})",
                order.status.as_str(),
                order.bracket_id,
                order.entry_price,
                order.trigger_condition,
                order.profile_name
            );
        }
    }
    Ok(())
}

fn tasks(profile: &str, limit: usize) -> Result<()> {
    let config = Config::from_env()?;
    let store = Store::open(&config.db_path)?;
    let history = store.task_history(profile, limit)?;
    if history.is_empty() {
        println!("no cycles recorded for {profile}");
        return Ok(());
    }
    for task in history {
        let flag = if task.missed {
            "MISSED"
        } else if task.timed_out {
            "TIMEOUT"
        } else if task.success {
            "ok"
        } else {
            "FAILED"
        };
        println!(
            "{} [{}] rows={} duration={:?}s error={:?}",
            task.scheduled_ms, flag, task.rows_processed, task.duration_seconds, task.error_message
        );
    }
    Ok(())
}

async fn serve() -> Result<()> {
    let config = Config::from_env()?;
    let store = Arc::new(Store::open(&config.db_path)?);
    let mut api_config = config.api_config();
    api_config.enabled = true;
    let handle = start_api_server(api_config, store)
        .await
        .map_err(|e| anyhow::anyhow!("failed to start HTTP API: {e}"))?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    handle.abort();
    Ok(())
}
