//! CLI subcommand implementations

pub mod backtest;
pub mod ingest;
pub mod live;
