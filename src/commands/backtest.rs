//! Backtest command
//!
//! Loads bars (CSV files or the SQLite cache), runs the engine, logs a
//! summary, and writes the trade list and equity curve to the results
//! directory.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use papertrader::data::{self, BarSource, BarStore};
use papertrader::strategy::create_strategy;
use papertrader::{BacktestResult, Backtester, Config};

pub fn run(
    config_path: String,
    capital: Option<f64>,
    start: Option<String>,
    end: Option<String>,
    cache: Option<String>,
) -> Result<()> {
    let mut config = Config::from_file(&config_path)
        .context(format!("Failed to load config from {}", config_path))?;
    if let Some(capital) = capital {
        config.engine.initial_capital = capital;
    }

    let symbols = config.trading.symbols();
    let timeframe = config.trading.timeframe.clone();
    let start = parse_date(start.as_deref())?;
    let end = parse_date(end.as_deref())?;

    let data = match &cache {
        Some(path) => {
            let store = BarStore::open(path)?;
            let mut data = HashMap::new();
            for symbol in &symbols {
                let bars = store.bars(symbol, &timeframe, start, end)?;
                if bars.is_empty() {
                    tracing::warn!(%symbol, "no cached bars in range");
                    continue;
                }
                info!("Loaded {} bars for {} from cache", bars.len(), symbol);
                data.insert(symbol.clone(), bars);
            }
            data
        }
        None => {
            let mut data = data::load_multi_symbol(&config.engine.data_dir, &symbols, &timeframe)?;
            if start.is_some() || end.is_some() {
                for bars in data.values_mut() {
                    bars.retain(|b| {
                        start.is_none_or(|s| b.timestamp >= s) && end.is_none_or(|e| b.timestamp <= e)
                    });
                }
            }
            data
        }
    };

    if data.is_empty() {
        anyhow::bail!("no bar data available for any configured symbol");
    }

    let strategy = create_strategy(&config)?;
    let results_dir = config.engine.results_dir.clone();
    let mut backtester = Backtester::new(config, strategy)?;
    let result = backtester.run(data)?;

    print_summary(&result);
    write_results(&results_dir, &result)?;
    Ok(())
}

fn parse_date(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    let Some(s) = s else { return Ok(None) };
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .context(format!("invalid date (expected YYYY-MM-DD): {}", s))?;
    Ok(Some(DateTime::from_naive_utc_and_offset(
        date.and_hms_opt(0, 0, 0).unwrap(),
        Utc,
    )))
}

fn print_summary(result: &BacktestResult) {
    let wins = result.trades.iter().filter(|t| t.realized_pnl > 0.0).count();
    let win_rate = if result.trades.is_empty() {
        0.0
    } else {
        wins as f64 / result.trades.len() as f64 * 100.0
    };

    info!("==================== BACKTEST RESULTS ====================");
    info!("Initial capital:  {:>14.2}", result.initial_capital);
    info!("Final value:      {:>14.2}", result.final_value);
    info!("Total return:     {:>13.2}%", result.total_return_pct);
    info!("Bars processed:   {:>14}", result.bars_processed);
    info!("Orders submitted: {:>14}", result.orders_submitted);
    info!("Orders rejected:  {:>14}", result.orders_rejected);
    info!("Completed trades: {:>14}", result.trades.len());
    info!("Win rate:         {:>13.2}%", win_rate);
    info!("==========================================================");
}

fn write_results(results_dir: &str, result: &BacktestResult) -> Result<()> {
    std::fs::create_dir_all(results_dir).ok();

    let trades_path = Path::new(results_dir).join("trades.csv");
    let mut writer = csv::Writer::from_path(&trades_path)?;
    writer.write_record([
        "symbol",
        "entry_time",
        "exit_time",
        "entry_price",
        "exit_price",
        "quantity",
        "realized_pnl",
        "return_pct",
        "holding_days",
    ])?;
    for trade in &result.trades {
        writer.write_record([
            trade.symbol.as_str(),
            trade.entry_time.to_rfc3339().as_str(),
            trade.exit_time.to_rfc3339().as_str(),
            format!("{:.4}", trade.entry_price).as_str(),
            format!("{:.4}", trade.exit_price).as_str(),
            trade.quantity.to_string().as_str(),
            format!("{:.2}", trade.realized_pnl).as_str(),
            format!("{:.6}", trade.return_pct).as_str(),
            trade.holding_period.num_days().to_string().as_str(),
        ])?;
    }
    writer.flush()?;
    info!("Trades written to {}", trades_path.display());

    let equity_path = Path::new(results_dir).join("equity.csv");
    let mut writer = csv::Writer::from_path(&equity_path)?;
    writer.write_record(["timestamp", "equity"])?;
    for (ts, value) in &result.equity_curve {
        writer.write_record([ts.to_rfc3339().as_str(), format!("{:.2}", value).as_str()])?;
    }
    writer.flush()?;
    info!("Equity curve written to {}", equity_path.display());
    Ok(())
}
