use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::backtest::{Pair, PricePoint, PriceSeries};

/// Supplies two date-aligned closing price series for a pair. The
/// core never talks to files or providers directly; it only sees the
/// aligned series this trait hands back.
#[async_trait]
pub trait PriceSource {
    async fn fetch(&self, pair: &Pair) -> Result<(PriceSeries, PriceSeries)>;
}

// Row shape of the per-instrument CSV files.
#[derive(Debug, Clone, Deserialize)]
struct CloseRow {
    date: NaiveDate,
    close: Decimal,
}

/// File-backed source: one `date,close` CSV per instrument. Dates
/// present in only one file are dropped (inner join), so the core
/// receives pre-aligned rows.
#[derive(Debug)]
pub struct CsvPriceSource {
    path_a: PathBuf,
    path_b: PathBuf,
}

impl CsvPriceSource {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(path_a: P, path_b: Q) -> Self {
        Self {
            path_a: path_a.as_ref().to_path_buf(),
            path_b: path_b.as_ref().to_path_buf(),
        }
    }

    fn read_closes(path: &Path) -> Result<BTreeMap<NaiveDate, Decimal>> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open price file {}", path.display()))?;
        let mut closes = BTreeMap::new();
        for (idx, row) in reader.deserialize::<CloseRow>().enumerate() {
            let row = row.with_context(|| {
                format!("failed to parse row {} of {}", idx + 1, path.display())
            })?;
            if closes.insert(row.date, row.close).is_some() {
                return Err(anyhow!(
                    "duplicate date {} in {}",
                    row.date,
                    path.display()
                ));
            }
        }
        if closes.is_empty() {
            return Err(anyhow!("price file {} is empty", path.display()));
        }
        Ok(closes)
    }
}

#[async_trait]
impl PriceSource for CsvPriceSource {
    async fn fetch(&self, pair: &Pair) -> Result<(PriceSeries, PriceSeries)> {
        let closes_a = Self::read_closes(&self.path_a)
            .with_context(|| format!("loading {}", pair.instrument_a))?;
        let closes_b = Self::read_closes(&self.path_b)
            .with_context(|| format!("loading {}", pair.instrument_b))?;

        let mut series_a = Vec::new();
        let mut series_b = Vec::new();
        for (date, close_a) in &closes_a {
            if let Some(close_b) = closes_b.get(date) {
                series_a.push(PricePoint {
                    date: *date,
                    close: *close_a,
                });
                series_b.push(PricePoint {
                    date: *date,
                    close: *close_b,
                });
            }
        }
        if series_a.is_empty() {
            return Err(anyhow!(
                "no overlapping dates between {} and {}",
                self.path_a.display(),
                self.path_b.display()
            ));
        }

        let dropped = (closes_a.len() - series_a.len()) + (closes_b.len() - series_b.len());
        if dropped > 0 {
            log::warn!(
                "[DATA] {} dropped {} unmatched rows while aligning",
                pair.key(),
                dropped
            );
        }
        log::info!(
            "[DATA] {} loaded {} aligned trading days",
            pair.key(),
            series_a.len()
        );
        Ok((series_a, series_b))
    }
}
