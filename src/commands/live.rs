//! Live (paper) trading command
//!
//! Wires the single-writer engine actor to a paper broker and a tick feed,
//! with graceful Ctrl-C shutdown. The feed replays recorded bars as ticks:
//! with `--dry-run` no broker traffic happens at all, otherwise the paper
//! broker fills every order at the last tick price.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use papertrader::broker::PaperBroker;
use papertrader::data;
use papertrader::live::{EngineEvent, LiveEngine};
use papertrader::strategy::create_strategy;
use papertrader::Config;

pub fn run(config_path: String, dry_run: bool, tick_interval_ms: u64) -> Result<()> {
    dotenv::dotenv().ok();

    let mut config = Config::from_file(&config_path)
        .context(format!("Failed to load config from {}", config_path))?;
    config.trading.dry_run = config.trading.dry_run || dry_run;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config, tick_interval_ms))
}

async fn run_async(config: Config, tick_interval_ms: u64) -> Result<()> {
    info!("=========================================");
    info!(" papertrader live - {} mode", if config.trading.dry_run { "DRY RUN" } else { "PAPER" });
    info!(" strategy: {}", config.strategy_name);
    info!(" symbols:  {}", config.trading.symbols.join(", "));
    info!(" capital:  {:.2}", config.engine.initial_capital);
    info!("=========================================");

    let symbols = config.trading.symbols();
    let timeframe = config.trading.timeframe.clone();
    let bars = data::load_multi_symbol(&config.engine.data_dir, &symbols, &timeframe)?;

    let (fill_tx, mut fill_rx) = mpsc::unbounded_channel();
    let broker = Arc::new(PaperBroker::new(fill_tx));

    let strategy = create_strategy(&config)?;
    let mut engine = LiveEngine::new(config, strategy, broker.clone())?;

    let (event_tx, event_rx) = mpsc::channel::<EngineEvent>(1024);

    // Broker fill notices only ever enqueue; the actor owns all state
    let fill_feed = event_tx.clone();
    tokio::spawn(async move {
        while let Some(notice) = fill_rx.recv().await {
            if fill_feed.send(EngineEvent::BrokerFill(notice)).await.is_err() {
                break;
            }
        }
    });

    // Tick feed: recorded bars replayed in timestamp order
    let tick_feed = event_tx.clone();
    let feed_broker = broker.clone();
    tokio::spawn(async move {
        let mut ticks: Vec<_> = bars
            .into_iter()
            .flat_map(|(symbol, bars)| {
                bars.into_iter()
                    .map(move |bar| (bar.timestamp, symbol.clone(), bar.close))
            })
            .collect();
        ticks.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        for (timestamp, symbol, price) in ticks {
            feed_broker.set_price(&symbol, price);
            let event = EngineEvent::Tick {
                symbol,
                price,
                timestamp,
            };
            if tick_feed.send(event).await.is_err() {
                return;
            }
            sleep(Duration::from_millis(tick_interval_ms)).await;
        }
        info!("tick feed exhausted");
        let _ = tick_feed.send(EngineEvent::Shutdown).await;
    });

    // Ctrl-C turns into a shutdown event on the same mailbox
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Ctrl-C received, shutting down");
                let _ = event_tx.send(EngineEvent::Shutdown).await;
            }
            Err(err) => error!(%err, "failed to install signal handler"),
        }
    });

    engine.run(event_rx).await?;
    info!("live session ended");
    Ok(())
}
