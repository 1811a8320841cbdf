use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use env_logger::Builder;
use log::LevelFilter;
use pairbt::backtest::BacktestEngine;
use pairbt::config::BacktestConfig;
use pairbt::ports::csv_source::{CsvPriceSource, PriceSource};
use pairbt::report::ReportAssembler;
use std::env;
use std::io::Write;
use std::str::FromStr;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with local timezone
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .unwrap_or_else(|_| "3600".to_string())
        .parse::<i32>()
        .context("invalid TIMEZONE_OFFSET")?;
    let offset = FixedOffset::east_opt(offset_seconds).context("invalid offset")?;
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
                .unwrap_or(LevelFilter::Info),
        )
        .init();

    let cfg = BacktestConfig::from_env_or_yaml().context("invalid backtest config")?;
    log::info!(
        "[CONFIG] pair={}/{} window={} entry_z={} exit_z={} capital={}",
        cfg.instrument_a,
        cfg.instrument_b,
        cfg.window,
        cfg.entry_threshold,
        cfg.exit_threshold,
        cfg.initial_capital
    );

    let engine = BacktestEngine::new(cfg.clone());
    let pair = pairbt::backtest::Pair {
        instrument_a: cfg.instrument_a.clone(),
        instrument_b: cfg.instrument_b.clone(),
    };
    let source = CsvPriceSource::new(&cfg.price_file_a, &cfg.price_file_b);
    let (series_a, series_b) = source
        .fetch(&pair)
        .await
        .context("failed to load price series")?;

    log::info!("[BACKTEST] Running over {} trading days.", series_a.len());
    let report = engine.run(&series_a, &series_b)?;
    log::info!(
        "[BACKTEST] {} entries, {} trade records.",
        report.long_entry_dates.len() + report.short_entry_dates.len(),
        report.trades.len()
    );

    let assembler = ReportAssembler::new(&report);
    assembler
        .write_trades_csv(&cfg.trade_log_file)
        .context("failed to write trade log")?;
    if let Some(path) = &cfg.chart_data_file {
        assembler
            .write_chart_jsonl(path)
            .context("failed to write chart data")?;
    }

    log::info!(
        "[REPORT] Total strategy returns: $ {:.2}",
        assembler.total_return()
    );
    Ok(())
}
