//! papertrader - main entry point
//!
//! Subcommands:
//! - backtest: run a deterministic backtest over recorded bars
//! - live: run the paper-trading engine over a tick feed
//! - ingest: load CSV bar files into the SQLite bar cache

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "papertrader")]
#[command(about = "Event-driven trading engine with deterministic backtesting and paper trading", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a backtest
    Backtest {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/default.json")]
        config: String,

        /// Initial capital (overrides config)
        #[arg(long)]
        capital: Option<f64>,

        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,

        /// End date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,

        /// Read bars from this SQLite cache instead of CSV files
        #[arg(long)]
        cache: Option<String>,
    },

    /// Run paper trading over a tick feed
    Live {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/default.json")]
        config: String,

        /// Historical replay only; no broker traffic
        #[arg(long)]
        dry_run: bool,

        /// Milliseconds between replayed ticks
        #[arg(long, default_value = "250")]
        tick_interval_ms: u64,
    },

    /// Ingest CSV bar files into the SQLite cache
    Ingest {
        /// Cache database path
        #[arg(long, default_value = "bars.db")]
        cache: String,

        /// Directory holding {symbol}_{timeframe}.csv files
        #[arg(short, long, default_value = "data")]
        data_dir: String,

        /// Symbols to ingest (comma-separated)
        #[arg(short, long)]
        symbols: String,

        /// Timeframe tag, e.g. 1d
        #[arg(short, long, default_value = "1d")]
        timeframe: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Backtest { .. } => "backtest",
        Commands::Live { .. } => "live",
        Commands::Ingest { .. } => "ingest",
    };
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Backtest {
            config,
            capital,
            start,
            end,
            cache,
        } => commands::backtest::run(config, capital, start, end, cache),

        Commands::Live {
            config,
            dry_run,
            tick_interval_ms,
        } => commands::live::run(config, dry_run, tick_interval_ms),

        Commands::Ingest {
            cache,
            data_dir,
            symbols,
            timeframe,
        } => commands::ingest::run(cache, data_dir, symbols, timeframe),
    }
}
