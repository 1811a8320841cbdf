use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::backtest::BacktestReport;

// One JSONL line per trading day for the chart sink.
#[derive(Debug, Serialize)]
struct ChartRow {
    date: NaiveDate,
    price_a: f64,
    price_b: f64,
    z_score: Option<f64>,
    cumulative_return: f64,
}

// Trailing JSONL line with the dated signal markers.
#[derive(Debug, Serialize)]
struct ChartMarkers<'a> {
    long_entries: &'a [NaiveDate],
    short_entries: &'a [NaiveDate],
    exits: &'a [NaiveDate],
}

/// Turns a finished run into sink-ready artifacts: a CSV trade log
/// (one row per TradeRecord) and a JSONL chart dump.
pub struct ReportAssembler<'a> {
    report: &'a BacktestReport,
}

impl<'a> ReportAssembler<'a> {
    pub fn new(report: &'a BacktestReport) -> Self {
        Self { report }
    }

    /// Last element of the cumulative-return series; free capital if
    /// the series is somehow empty.
    pub fn total_return(&self) -> f64 {
        self.report
            .cumulative_returns
            .last()
            .copied()
            .unwrap_or(self.report.final_capital)
    }

    pub fn write_trades_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();
        let mut writer = csv::Writer::from_path(path_ref)
            .with_context(|| format!("failed to create trade log {}", path_ref.display()))?;
        for record in &self.report.trades {
            writer
                .serialize(record)
                .with_context(|| format!("failed to write trade log {}", path_ref.display()))?;
        }
        writer.flush()?;
        log::info!(
            "[REPORT] wrote {} trade records to {}",
            self.report.trades.len(),
            path_ref.display()
        );
        Ok(())
    }

    pub fn write_chart_jsonl<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();
        let file = File::create(path_ref)
            .with_context(|| format!("failed to create chart dump {}", path_ref.display()))?;
        let mut writer = BufWriter::new(file);

        for (idx, date) in self.report.dates.iter().enumerate() {
            let row = ChartRow {
                date: *date,
                price_a: self.report.price_a[idx],
                price_b: self.report.price_b[idx],
                z_score: self.report.samples[idx].z_score,
                cumulative_return: self.report.cumulative_returns[idx],
            };
            let line = serde_json::to_string(&row)?;
            writeln!(writer, "{line}")?;
        }
        let markers = ChartMarkers {
            long_entries: &self.report.long_entry_dates,
            short_entries: &self.report.short_entry_dates,
            exits: &self.report.exit_dates,
        };
        let line = serde_json::to_string(&markers)?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        log::info!(
            "[REPORT] wrote {} chart rows to {}",
            self.report.dates.len(),
            path_ref.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::{BacktestEngine, BacktestReport, PricePoint};
    use crate::config::BacktestConfig;
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;
    use std::fs;

    fn run_toy_backtest() -> BacktestReport {
        let closes_a = [10.0, 10.0, 10.0, 6.0, 10.0];
        let closes_b = [10.0, 10.0, 10.0, 10.0, 10.0];
        let build = |closes: &[f64]| {
            closes
                .iter()
                .enumerate()
                .map(|(i, close)| PricePoint {
                    date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
                        + chrono::Days::new(i as u64),
                    close: Decimal::from_f64(*close).unwrap(),
                })
                .collect::<Vec<_>>()
        };

        let mut cfg = BacktestConfig::default();
        cfg.window = 3;
        cfg.entry_threshold = 1.0;
        cfg.exit_threshold = 0.6;
        cfg.initial_capital = 1000.0;
        BacktestEngine::new(cfg)
            .run(&build(&closes_a), &build(&closes_b))
            .unwrap()
    }

    #[test]
    fn trade_csv_has_reference_action_labels() {
        let report = run_toy_backtest();
        let file = tempfile::NamedTempFile::new().unwrap();
        ReportAssembler::new(&report)
            .write_trades_csv(file.path())
            .unwrap();

        let contents = fs::read_to_string(file.path()).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next().unwrap(),
            "date,instrument,action,entry_price,exit_price,size,profit_multiplier"
        );
        assert!(contents.contains("Buy"));
        assert!(contents.contains("Short"));
        assert!(contents.contains("Sell"));
        assert!(contents.contains("Cover Short"));
        // Entry rows leave exit price and profit empty.
        assert!(contents.contains("2024-01-04,NVDA,Buy,10.0,,50.0,"));
    }

    #[test]
    fn chart_jsonl_ends_with_marker_line() {
        let report = run_toy_backtest();
        let file = tempfile::NamedTempFile::new().unwrap();
        ReportAssembler::new(&report)
            .write_chart_jsonl(file.path())
            .unwrap();

        let contents = fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), report.dates.len() + 1);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["date"], "2024-01-01");
        assert!(first["z_score"].is_null());

        let markers: serde_json::Value = serde_json::from_str(lines.last().unwrap()).unwrap();
        assert_eq!(markers["long_entries"][0], "2024-01-04");
        assert_eq!(markers["exits"][0], "2024-01-05");
    }

    #[test]
    fn total_return_is_last_cumulative_value() {
        let report = run_toy_backtest();
        let assembler = ReportAssembler::new(&report);
        assert_eq!(
            assembler.total_return(),
            *report.cumulative_returns.last().unwrap()
        );
    }
}
