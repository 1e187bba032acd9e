use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use coinsim::api::{BinanceClient, FxClient};
use coinsim::persistence::open_store;
use coinsim::{Result, Settings, Severity, SimEvent, Simulator, TradingSession};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;

#[derive(Parser)]
#[command(name = "coinsim")]
#[command(about = "Crypto trading simulator", version)]
struct Cli {
    /// TOML settings file; `COINSIM_*` env vars override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the live simulator until ctrl-c
    Run {
        /// Stop after this many seconds
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Fast-forward the synthetic market offline and print a summary
    Simulate {
        #[arg(long, default_value_t = 500)]
        ticks: usize,
        #[arg(long)]
        seed: Option<u64>,
        /// Print a single JSON document instead of a table
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    match cli.command.unwrap_or(CliCommand::Run {
        duration_secs: None,
    }) {
        CliCommand::Run { duration_secs } => run(settings, duration_secs).await,
        CliCommand::Simulate { ticks, seed, json } => simulate(settings, ticks, seed, json),
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("coinsim=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(settings: Settings, duration_secs: Option<u64>) -> Result<()> {
    tracing::info!("Coinsim starting with {} assets", settings.assets.len());

    let mut simulator = build_simulator(&settings).await?;
    simulator.restore().await;

    let (handle, task) = simulator.spawn();
    let logger = tokio::spawn(log_events(handle.subscribe()));

    match duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    tracing::info!("Run duration of {}s elapsed", secs);
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received ctrl-c");
                }
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for ctrl-c")?;
            tracing::info!("Received ctrl-c");
        }
    }

    if let Ok(summary) = handle.summary().await {
        tracing::info!(
            "Final wealth {:.2} (cash {:.2}, {} open positions, {} trades, {:.1}% wins)",
            summary.wealth,
            summary.cash,
            summary.positions.len(),
            summary.stats.total_trades,
            summary.stats.win_rate()
        );
    }

    handle.shutdown();
    task.await.context("Simulator task panicked")?;
    logger.abort();
    Ok(())
}

async fn build_simulator(settings: &Settings) -> anyhow::Result<Simulator> {
    let store = open_store(&settings.persistence).await;
    let session = TradingSession::from_settings(settings);
    let mut simulator = Simulator::new(session, store, settings.tick_interval());

    let feed = &settings.feed;
    if feed.enabled {
        let client = BinanceClient::new(feed).context("Failed to build Binance client")?;
        tracing::info!("Live prices enabled for {} symbols", feed.symbols.len());
        simulator =
            simulator.with_price_source(Arc::new(client), feed.symbols.clone(), feed.history_limit);
    }
    if let Some(asset) = &feed.fx_asset {
        let client = FxClient::new(feed).context("Failed to build FX client")?;
        tracing::info!(
            "{} follows the {}/{} rate",
            asset,
            feed.fx_base,
            feed.fx_quote
        );
        simulator = simulator.with_fx_source(
            Arc::new(client),
            asset,
            Duration::from_secs(feed.fx_poll_secs.max(1)),
        );
    }
    Ok(simulator)
}

async fn log_events(mut events: broadcast::Receiver<SimEvent>) {
    loop {
        match events.recv().await {
            Ok(SimEvent::Notification(n)) => match n.severity {
                Severity::Error | Severity::Warning => tracing::warn!("{}", n.message),
                Severity::Info | Severity::Success => tracing::info!("{}", n.message),
            },
            Ok(SimEvent::PriceUpdate { asset, price }) => {
                tracing::debug!("{} = {:.4}", asset, price);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Event logger skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[derive(Debug, Serialize)]
struct AssetSummary {
    start: f64,
    last: f64,
    low: f64,
    high: f64,
    change_pct: f64,
    candles: usize,
}

/// Tick the synthetic market `ticks` times with simulated clock time
fn simulate(mut settings: Settings, ticks: usize, seed: Option<u64>, json: bool) -> Result<()> {
    if seed.is_some() {
        settings.market.seed = seed;
    }
    let mut session = TradingSession::from_settings(&settings);
    let start_prices = session.market().prices();
    let mut ranges: BTreeMap<String, (f64, f64)> = start_prices
        .iter()
        .map(|(asset, price)| (asset.clone(), (*price, *price)))
        .collect();

    let step = ChronoDuration::milliseconds(settings.market.tick_interval_ms as i64);
    let mut now = Utc::now();
    for _ in 0..ticks {
        now += step;
        session.tick(now);
        for (asset, (low, high)) in ranges.iter_mut() {
            if let Some(candle) = session.market().latest_candle(asset) {
                *low = low.min(candle.low);
                *high = high.max(candle.high);
            }
        }
    }

    let summary: BTreeMap<String, AssetSummary> = ranges
        .into_iter()
        .map(|(asset, (low, high))| {
            let start = start_prices.get(&asset).copied().unwrap_or_default();
            let last = session.market().current_price(&asset).unwrap_or(start);
            let candles = session
                .market()
                .candles(&asset)
                .map(|c| c.len())
                .unwrap_or_default();
            let change_pct = if start > 0.0 {
                (last - start) / start * 100.0
            } else {
                0.0
            };
            let row = AssetSummary {
                start,
                last,
                low,
                high,
                change_pct,
                candles,
            };
            (asset, row)
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "\nSimulated {} ticks (seed {})\n",
        ticks,
        settings
            .market
            .seed
            .map(|s| s.to_string())
            .unwrap_or_else(|| "random".to_string())
    );
    println!(
        "{:<16} {:>12} {:>12} {:>12} {:>12} {:>9}",
        "Asset", "Start", "Last", "Low", "High", "Change%"
    );
    println!("{}", "─".repeat(78));
    for (asset, row) in &summary {
        println!(
            "{:<16} {:>12.4} {:>12.4} {:>12.4} {:>12.4} {:>+9.2}",
            asset, row.start, row.last, row.low, row.high, row.change_pct
        );
    }
    println!();
    Ok(())
}
