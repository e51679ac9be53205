//! Configuration management
//!
//! JSON configuration files parsed once at boundary entry into typed
//! sections. Every section has defaults so partial configs load cleanly.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::oms::execution::MatchingConfig;
use crate::oms::validator::RiskLimits;
use crate::risk::StopConfig;
use crate::sizing::PositionSizer;
use crate::types::Symbol;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub risk: RiskLimits,
    #[serde(default)]
    pub stops: StopConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sizer: PositionSizer,
    #[serde(default = "default_strategy_name")]
    pub strategy_name: String,
    /// Strategy-specific parameters, decoded by the strategy factory
    #[serde(default = "empty_object")]
    pub strategy: serde_json::Value,
}

fn default_strategy_name() -> String {
    "ma_cross".to_string()
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

impl Default for Config {
    fn default() -> Self {
        Config {
            trading: TradingConfig::default(),
            risk: RiskLimits::default(),
            stops: StopConfig::default(),
            matching: MatchingConfig::default(),
            engine: EngineConfig::default(),
            sizer: PositionSizer::default(),
            strategy_name: default_strategy_name(),
            strategy: empty_object(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        Ok(config)
    }
}

/// What kind of market data drives the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Trades,
    Quotes,
    Bars,
}

/// Trading session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    /// Simulated fills against live prices; no venue traffic
    #[serde(default = "default_true")]
    pub paper_mode: bool,
    /// Historical bars drive the simulation path; no broker traffic
    #[serde(default)]
    pub dry_run: bool,
    /// Master switch; when false, signals are logged but never executed
    #[serde(default = "default_true")]
    pub enable_trading: bool,
    #[serde(default = "default_data_type")]
    pub data_type: DataType,
}

fn default_symbols() -> Vec<String> {
    vec!["AAPL".to_string(), "MSFT".to_string(), "SPY".to_string()]
}

fn default_timeframe() -> String {
    "1d".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_type() -> DataType {
    DataType::Bars
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            symbols: default_symbols(),
            timeframe: default_timeframe(),
            paper_mode: true,
            dry_run: false,
            enable_trading: true,
            data_type: default_data_type(),
        }
    }
}

impl TradingConfig {
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.iter().map(|s| Symbol::new(s.clone())).collect()
    }
}

/// Engine-level configuration shared by backtest and live runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,
    /// Ticks between status log lines
    #[serde(default = "default_status_log_interval")]
    pub status_log_interval: u64,
    #[serde(default = "default_true")]
    pub log_orders: bool,
    /// Where CSV bar files live
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Where trade lists and equity curves are written
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
    /// Append-only order audit log; absent disables auditing
    #[serde(default)]
    pub audit_log: Option<String>,
    /// ATR window for volatility sizing
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    /// Live-engine dedup: identical signals within this window are dropped
    #[serde(default = "default_signal_cooldown")]
    pub signal_cooldown_secs: u64,
    #[serde(default = "default_health_snapshot_path")]
    pub health_snapshot_path: String,
}

fn default_initial_capital() -> f64 {
    100_000.0
}

fn default_status_log_interval() -> u64 {
    100
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_results_dir() -> String {
    "results".to_string()
}

fn default_atr_period() -> usize {
    14
}

fn default_signal_cooldown() -> u64 {
    300
}

fn default_health_snapshot_path() -> String {
    "health.json".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            initial_capital: default_initial_capital(),
            status_log_interval: default_status_log_interval(),
            log_orders: true,
            data_dir: default_data_dir(),
            results_dir: default_results_dir(),
            audit_log: None,
            atr_period: default_atr_period(),
            signal_cooldown_secs: default_signal_cooldown(),
            health_snapshot_path: default_health_snapshot_path(),
        }
    }
}
