use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use std::error::Error;
use std::fmt;

use crate::config::BacktestConfig;

/// A generic two-instrument pair. The ledger and engine are
/// parametrized over instrument identity; no symbols are hard-coded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub instrument_a: String,
    pub instrument_b: String,
}

impl Pair {
    pub fn key(&self) -> String {
        format!("{}/{}", self.instrument_a, self.instrument_b)
    }
}

/// One daily close. Prices cross the source boundary as `Decimal` and
/// are converted to f64 once before the statistics core.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub close: rust_decimal::Decimal,
}

pub type PriceSeries = Vec<PricePoint>;

#[derive(Debug)]
pub enum BacktestError {
    /// Price series lengths or dates do not line up. Fatal before the
    /// simulation starts.
    InputAlignment(String),
    /// Non-positive price encountered. Invalid market data, fatal.
    Division { instrument: String, date: NaiveDate },
}

impl fmt::Display for BacktestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BacktestError::InputAlignment(msg) => {
                write!(f, "price series misaligned: {}", msg)
            }
            BacktestError::Division { instrument, date } => {
                write!(f, "non-positive price for {} on {}", instrument, date)
            }
        }
    }
}

impl Error for BacktestError {}

/// Ratio spread statistics for one date. `z_score` is `None` while
/// the rolling window is not yet full and whenever the rolling std is
/// zero; downstream that reads as a no-signal date.
#[derive(Debug, Clone, Copy)]
pub struct SpreadSample {
    pub date: NaiveDate,
    pub ratio: f64,
    pub rolling_mean: Option<f64>,
    pub rolling_std: Option<f64>,
    pub z_score: Option<f64>,
}

/// Output of the spread pre-pass: per-date statistics plus the
/// validated f64 closes, so callers never re-scan the price series.
#[derive(Debug, Clone)]
pub struct SpreadAnalysis {
    pub samples: Vec<SpreadSample>,
    pub closes_a: Vec<f64>,
    pub closes_b: Vec<f64>,
}

/// Computes the ratio spread and its rolling z-score over a trailing
/// window.
#[derive(Debug, Clone, Copy)]
pub struct SpreadAnalyzer {
    window: usize,
}

impl SpreadAnalyzer {
    pub fn new(window: usize) -> Self {
        Self { window }
    }

    pub fn analyze(
        &self,
        pair: &Pair,
        series_a: &[PricePoint],
        series_b: &[PricePoint],
    ) -> Result<SpreadAnalysis, BacktestError> {
        validate_alignment(series_a, series_b)?;

        let closes_a = checked_closes(&pair.instrument_a, series_a)?;
        let closes_b = checked_closes(&pair.instrument_b, series_b)?;

        let mut ratios = Vec::with_capacity(series_a.len());
        let mut samples = Vec::with_capacity(series_a.len());
        for (idx, point) in series_a.iter().enumerate() {
            let ratio = closes_a[idx] / closes_b[idx];
            ratios.push(ratio);

            let stats = if idx + 1 >= self.window {
                mean_std(&ratios[idx + 1 - self.window..=idx])
            } else {
                None
            };
            let (rolling_mean, rolling_std) = match stats {
                Some((mean, std)) => (Some(mean), Some(std)),
                None => (None, None),
            };
            let z_score = match (rolling_mean, rolling_std) {
                (Some(mean), Some(std)) if std > 0.0 => Some((ratio - mean) / std),
                _ => None,
            };
            samples.push(SpreadSample {
                date: point.date,
                ratio,
                rolling_mean,
                rolling_std,
                z_score,
            });
        }
        Ok(SpreadAnalysis {
            samples,
            closes_a,
            closes_b,
        })
    }
}

/// Three same-length boolean series derived from the z-score series.
/// The flags are independent in computation; the engine makes them
/// exclusive in effect.
#[derive(Debug, Clone)]
pub struct SignalSeries {
    pub long: Vec<bool>,
    pub short: Vec<bool>,
    pub exit: Vec<bool>,
}

/// Pure threshold mapping over a z-score series. Entry comparisons
/// are inclusive, the exit comparison is strict.
#[derive(Debug, Clone, Copy)]
pub struct SignalGenerator {
    entry_threshold: f64,
    exit_threshold: f64,
}

impl SignalGenerator {
    pub fn new(entry_threshold: f64, exit_threshold: f64) -> Self {
        Self {
            entry_threshold,
            exit_threshold,
        }
    }

    pub fn generate(&self, samples: &[SpreadSample]) -> SignalSeries {
        let mut long = Vec::with_capacity(samples.len());
        let mut short = Vec::with_capacity(samples.len());
        let mut exit = Vec::with_capacity(samples.len());
        for sample in samples {
            match sample.z_score {
                Some(z) => {
                    long.push(z <= -self.entry_threshold);
                    short.push(z >= self.entry_threshold);
                    exit.push(z.abs() < self.exit_threshold);
                }
                None => {
                    long.push(false);
                    short.push(false);
                    exit.push(false);
                }
            }
        }
        SignalSeries { long, short, exit }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Long,
    Short,
}

/// Which side of the spread an entry signal opens. A long spread buys
/// instrument B and shorts instrument A; a short spread is the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionDirection {
    LongSpread,
    ShortSpread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TradeAction {
    Buy,
    Short,
    Sell,
    #[serde(rename = "Cover Short")]
    CoverShort,
}

/// An open leg. Owned by the ledger from open to close; closing
/// removes it and emits a TradeRecord instead.
#[derive(Debug, Clone)]
pub struct Position {
    pub instrument: String,
    pub entry_price: f64,
    pub size: f64,
    pub direction: Direction,
}

/// Append-only log entry. `exit_price` and `profit_multiplier` are
/// set only by closing actions.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub date: NaiveDate,
    pub instrument: String,
    pub action: TradeAction,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub size: f64,
    pub profit_multiplier: Option<f64>,
}

/// Authoritative mutable state of one backtest run: available capital
/// plus the four open-position lists (two instruments x two
/// directions). Capital is fully committed on entry and reconstituted
/// entirely at close, scaled by the profit multiplier.
#[derive(Debug)]
pub struct PositionLedger {
    pair: Pair,
    available_capital: f64,
    min_trade_capital: f64,
    long_a: Vec<Position>,
    long_b: Vec<Position>,
    short_a: Vec<Position>,
    short_b: Vec<Position>,
}

impl PositionLedger {
    pub fn new(pair: Pair, initial_capital: f64, min_trade_capital: f64) -> Self {
        Self {
            pair,
            available_capital: initial_capital,
            min_trade_capital,
            long_a: Vec::new(),
            long_b: Vec::new(),
            short_a: Vec::new(),
            short_b: Vec::new(),
        }
    }

    pub fn available_capital(&self) -> f64 {
        self.available_capital
    }

    pub fn has_open_positions(&self) -> bool {
        !(self.long_a.is_empty()
            && self.long_b.is_empty()
            && self.short_a.is_empty()
            && self.short_b.is_empty())
    }

    /// Total entry notional currently committed to open positions.
    pub fn committed_notional(&self) -> f64 {
        self.long_a
            .iter()
            .chain(&self.long_b)
            .chain(&self.short_a)
            .chain(&self.short_b)
            .map(|p| p.size * p.entry_price)
            .sum()
    }

    /// Opens both legs of a pair position, splitting available capital
    /// equally. Returns `None` without touching any state when capital
    /// is below the minimum; an insufficient-capital entry signal is
    /// not an error, just an ignored signal.
    pub fn open_pair_position(
        &mut self,
        direction: PositionDirection,
        price_a: f64,
        price_b: f64,
        date: NaiveDate,
    ) -> Option<[TradeRecord; 2]> {
        if self.available_capital <= 0.0 || self.available_capital < self.min_trade_capital {
            return None;
        }
        let per_leg = self.available_capital / 2.0;
        let size_a = per_leg / price_a;
        let size_b = per_leg / price_b;

        let records = match direction {
            PositionDirection::LongSpread => {
                // Buy instrument B, short instrument A.
                self.long_b.push(Position {
                    instrument: self.pair.instrument_b.clone(),
                    entry_price: price_b,
                    size: size_b,
                    direction: Direction::Long,
                });
                self.short_a.push(Position {
                    instrument: self.pair.instrument_a.clone(),
                    entry_price: price_a,
                    size: size_a,
                    direction: Direction::Short,
                });
                [
                    entry_record(date, &self.pair.instrument_b, TradeAction::Buy, price_b, size_b),
                    entry_record(date, &self.pair.instrument_a, TradeAction::Short, price_a, size_a),
                ]
            }
            PositionDirection::ShortSpread => {
                // Buy instrument A, short instrument B.
                self.long_a.push(Position {
                    instrument: self.pair.instrument_a.clone(),
                    entry_price: price_a,
                    size: size_a,
                    direction: Direction::Long,
                });
                self.short_b.push(Position {
                    instrument: self.pair.instrument_b.clone(),
                    entry_price: price_b,
                    size: size_b,
                    direction: Direction::Short,
                });
                [
                    entry_record(date, &self.pair.instrument_a, TradeAction::Buy, price_a, size_a),
                    entry_record(date, &self.pair.instrument_b, TradeAction::Short, price_b, size_b),
                ]
            }
        };
        self.available_capital = 0.0;
        Some(records)
    }

    /// Closes every open position across all four lists and returns
    /// their closing records. Each close adds
    /// `size * entry_price * profit_multiplier` back to available
    /// capital. A second call with nothing open is a no-op returning
    /// an empty vec.
    pub fn close_all_positions(
        &mut self,
        price_a: f64,
        price_b: f64,
        date: NaiveDate,
    ) -> Vec<TradeRecord> {
        let mut records = Vec::new();

        for position in self.long_a.drain(..) {
            records.push(close_record(date, position, price_a));
        }
        for position in self.long_b.drain(..) {
            records.push(close_record(date, position, price_b));
        }
        for position in self.short_a.drain(..) {
            records.push(close_record(date, position, price_a));
        }
        for position in self.short_b.drain(..) {
            records.push(close_record(date, position, price_b));
        }
        for record in &records {
            if let Some(multiplier) = record.profit_multiplier {
                self.available_capital += record.size * record.entry_price * multiplier;
            }
        }
        records
    }

    /// Unrealized value of open positions at current prices. The
    /// reference policy marks long legs only; `include_shorts` is the
    /// corrected variant that also marks open shorts at
    /// `size * (2 * entry - current)`, which is exactly what closing
    /// them at the current price would realize.
    pub fn mark_to_market(&self, price_a: f64, price_b: f64, include_shorts: bool) -> f64 {
        let mut value: f64 = self.long_a.iter().map(|p| p.size * price_a).sum();
        value += self.long_b.iter().map(|p| p.size * price_b).sum::<f64>();
        if include_shorts {
            value += self
                .short_a
                .iter()
                .map(|p| p.size * (2.0 * p.entry_price - price_a))
                .sum::<f64>();
            value += self
                .short_b
                .iter()
                .map(|p| p.size * (2.0 * p.entry_price - price_b))
                .sum::<f64>();
        }
        value
    }
}

fn entry_record(
    date: NaiveDate,
    instrument: &str,
    action: TradeAction,
    entry_price: f64,
    size: f64,
) -> TradeRecord {
    TradeRecord {
        date,
        instrument: instrument.to_string(),
        action,
        entry_price,
        exit_price: None,
        size,
        profit_multiplier: None,
    }
}

fn close_record(date: NaiveDate, position: Position, exit_price: f64) -> TradeRecord {
    let (action, multiplier) = match position.direction {
        Direction::Long => (
            TradeAction::Sell,
            1.0 + (exit_price - position.entry_price) / position.entry_price,
        ),
        Direction::Short => (
            TradeAction::CoverShort,
            1.0 + (position.entry_price - exit_price) / position.entry_price,
        ),
    };
    TradeRecord {
        date,
        instrument: position.instrument,
        action,
        entry_price: position.entry_price,
        exit_price: Some(exit_price),
        size: position.size,
        profit_multiplier: Some(multiplier),
    }
}

/// Everything one run produces: the trade log, the per-date series the
/// chart sink wants, and the dated entry/exit markers.
#[derive(Debug)]
pub struct BacktestReport {
    pub pair: Pair,
    pub dates: Vec<NaiveDate>,
    pub price_a: Vec<f64>,
    pub price_b: Vec<f64>,
    pub samples: Vec<SpreadSample>,
    pub trades: Vec<TradeRecord>,
    pub cumulative_returns: Vec<f64>,
    pub long_entry_dates: Vec<NaiveDate>,
    pub short_entry_dates: Vec<NaiveDate>,
    pub exit_dates: Vec<NaiveDate>,
    pub final_capital: f64,
}

/// Drives one simulation over the full date range. Per date, in fixed
/// order: entry check (long takes priority), exit check, accounting.
/// Entries before exits means a same-day open-then-close is possible.
#[derive(Debug)]
pub struct BacktestEngine {
    cfg: BacktestConfig,
}

impl BacktestEngine {
    pub fn new(cfg: BacktestConfig) -> Self {
        Self { cfg }
    }

    pub fn run(
        &self,
        series_a: &[PricePoint],
        series_b: &[PricePoint],
    ) -> Result<BacktestReport, BacktestError> {
        let pair = Pair {
            instrument_a: self.cfg.instrument_a.clone(),
            instrument_b: self.cfg.instrument_b.clone(),
        };

        let analyzer = SpreadAnalyzer::new(self.cfg.window);
        let analysis = analyzer.analyze(&pair, series_a, series_b)?;
        let signals = SignalGenerator::new(self.cfg.entry_threshold, self.cfg.exit_threshold)
            .generate(&analysis.samples);

        let SpreadAnalysis {
            samples,
            closes_a: price_a,
            closes_b: price_b,
        } = analysis;
        let dates: Vec<NaiveDate> = series_a.iter().map(|p| p.date).collect();

        let mut ledger = PositionLedger::new(
            pair.clone(),
            self.cfg.initial_capital,
            self.cfg.min_trade_capital,
        );
        let mut trades: Vec<TradeRecord> = Vec::new();
        let mut cumulative_returns = Vec::with_capacity(dates.len());
        let mut long_entry_dates = Vec::new();
        let mut short_entry_dates = Vec::new();
        let mut exit_dates = Vec::new();
        let mut realized_total = 0.0;

        for t in 0..dates.len() {
            if signals.long[t] {
                if let Some(records) =
                    ledger.open_pair_position(PositionDirection::LongSpread, price_a[t], price_b[t], dates[t])
                {
                    log::debug!(
                        "[ENTRY] {} {} long spread: buy {} short {}",
                        pair.key(),
                        dates[t],
                        pair.instrument_b,
                        pair.instrument_a
                    );
                    long_entry_dates.push(dates[t]);
                    trades.extend(records);
                }
            } else if signals.short[t] {
                if let Some(records) =
                    ledger.open_pair_position(PositionDirection::ShortSpread, price_a[t], price_b[t], dates[t])
                {
                    log::debug!(
                        "[ENTRY] {} {} short spread: buy {} short {}",
                        pair.key(),
                        dates[t],
                        pair.instrument_a,
                        pair.instrument_b
                    );
                    short_entry_dates.push(dates[t]);
                    trades.extend(records);
                }
            }

            if signals.exit[t] {
                let closed = ledger.close_all_positions(price_a[t], price_b[t], dates[t]);
                if !closed.is_empty() {
                    log::debug!(
                        "[EXIT] {} {} closed {} positions, capital={:.2}",
                        pair.key(),
                        dates[t],
                        closed.len(),
                        ledger.available_capital()
                    );
                }
                for record in &closed {
                    if let Some(multiplier) = record.profit_multiplier {
                        realized_total += multiplier;
                    }
                }
                trades.extend(closed);
                // The reference strategy records every exit-signal date
                // as a chart marker, open positions or not.
                exit_dates.push(dates[t]);
            }

            let unrealized = ledger.mark_to_market(
                price_a[t],
                price_b[t],
                self.cfg.include_short_mark_to_market,
            );
            cumulative_returns.push(realized_total + unrealized + ledger.available_capital());
        }

        let final_capital = ledger.available_capital();
        Ok(BacktestReport {
            pair,
            dates,
            price_a,
            price_b,
            samples,
            trades,
            cumulative_returns,
            long_entry_dates,
            short_entry_dates,
            exit_dates,
            final_capital,
        })
    }
}

fn validate_alignment(
    series_a: &[PricePoint],
    series_b: &[PricePoint],
) -> Result<(), BacktestError> {
    if series_a.len() != series_b.len() {
        return Err(BacktestError::InputAlignment(format!(
            "lengths differ: {} vs {}",
            series_a.len(),
            series_b.len()
        )));
    }
    let mut prev: Option<NaiveDate> = None;
    for (a, b) in series_a.iter().zip(series_b.iter()) {
        if a.date != b.date {
            return Err(BacktestError::InputAlignment(format!(
                "dates differ: {} vs {}",
                a.date, b.date
            )));
        }
        if let Some(prev) = prev {
            if a.date <= prev {
                return Err(BacktestError::InputAlignment(format!(
                    "dates not strictly increasing at {}",
                    a.date
                )));
            }
        }
        prev = Some(a.date);
    }
    Ok(())
}

fn checked_closes(instrument: &str, series: &[PricePoint]) -> Result<Vec<f64>, BacktestError> {
    series
        .iter()
        .map(|point| {
            let close = point.close.to_f64().filter(|c| *c > 0.0);
            close.ok_or_else(|| BacktestError::Division {
                instrument: instrument.to_string(),
                date: point.date,
            })
        })
        .collect()
}

/// Sample mean and standard deviation (ddof = 1, what pandas
/// `rolling().std()` computes).
fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0);
    Some((mean, var.max(0.0).sqrt()))
}
