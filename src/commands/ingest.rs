//! Ingest command: load CSV bar files into the SQLite cache

use anyhow::{Context, Result};
use tracing::info;

use papertrader::data::BarStore;
use papertrader::Symbol;

pub fn run(cache_path: String, data_dir: String, symbols: String, timeframe: String) -> Result<()> {
    let mut store = BarStore::open(&cache_path)?;

    let mut total = 0usize;
    for symbol_str in symbols.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let symbol = Symbol::new(symbol_str);
        let path = std::path::Path::new(&data_dir).join(format!("{}_{}.csv", symbol_str, timeframe));
        if !path.exists() {
            tracing::warn!("Data file not found: {}", path.display());
            continue;
        }

        let count = store
            .import_csv(&path, &symbol, &timeframe)
            .context(format!("failed to ingest {}", path.display()))?;
        info!("Ingested {} bars for {} into {}", count, symbol, cache_path);
        total += count;
    }

    if total == 0 {
        anyhow::bail!("nothing ingested; check --data-dir and --symbols");
    }
    info!("Ingest complete: {} bars", total);
    Ok(())
}
