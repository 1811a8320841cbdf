use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs::File;
use std::path::Path;

const DEFAULT_WINDOW: usize = 50;
const DEFAULT_ENTRY_THRESHOLD: f64 = 1.3;
const DEFAULT_EXIT_THRESHOLD: f64 = 0.5;
const DEFAULT_INITIAL_CAPITAL: f64 = 5000.0;
const DEFAULT_MIN_TRADE_CAPITAL: f64 = 1000.0;
const DEFAULT_INSTRUMENT_A: &str = "AMD";
const DEFAULT_INSTRUMENT_B: &str = "NVDA";
const DEFAULT_TRADE_LOG_FILE: &str = "trades.csv";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct BacktestYaml {
    window: Option<usize>,
    entry_threshold: Option<f64>,
    exit_threshold: Option<f64>,
    initial_capital: Option<f64>,
    min_trade_capital: Option<f64>,
    instrument_a: Option<String>,
    instrument_b: Option<String>,
    price_file_a: Option<String>,
    price_file_b: Option<String>,
    trade_log_file: Option<String>,
    chart_data_file: Option<String>,
    include_short_mark_to_market: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub window: usize,
    pub entry_threshold: f64,
    pub exit_threshold: f64,
    pub initial_capital: f64,
    pub min_trade_capital: f64,
    pub instrument_a: String,
    pub instrument_b: String,
    pub price_file_a: String,
    pub price_file_b: String,
    pub trade_log_file: String,
    pub chart_data_file: Option<String>,
    // Corrected unrealized-value policy; the reference strategy marks
    // long legs only, so this stays off unless asked for.
    pub include_short_mark_to_market: bool,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            entry_threshold: DEFAULT_ENTRY_THRESHOLD,
            exit_threshold: DEFAULT_EXIT_THRESHOLD,
            initial_capital: DEFAULT_INITIAL_CAPITAL,
            min_trade_capital: DEFAULT_MIN_TRADE_CAPITAL,
            instrument_a: DEFAULT_INSTRUMENT_A.to_string(),
            instrument_b: DEFAULT_INSTRUMENT_B.to_string(),
            price_file_a: default_price_file(DEFAULT_INSTRUMENT_A),
            price_file_b: default_price_file(DEFAULT_INSTRUMENT_B),
            trade_log_file: DEFAULT_TRADE_LOG_FILE.to_string(),
            chart_data_file: None,
            include_short_mark_to_market: false,
        }
    }
}

impl BacktestConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("PAIRBT_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        Self::from_env()
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open backtest config {}", path_ref.display()))?;
        let yaml: BacktestYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse backtest config {}", path_ref.display()))?;

        let instrument_a = yaml
            .instrument_a
            .unwrap_or_else(|| DEFAULT_INSTRUMENT_A.to_string());
        let instrument_b = yaml
            .instrument_b
            .unwrap_or_else(|| DEFAULT_INSTRUMENT_B.to_string());
        let price_file_a = yaml
            .price_file_a
            .unwrap_or_else(|| default_price_file(&instrument_a));
        let price_file_b = yaml
            .price_file_b
            .unwrap_or_else(|| default_price_file(&instrument_b));

        let mut cfg = BacktestConfig {
            window: yaml.window.unwrap_or(DEFAULT_WINDOW),
            entry_threshold: yaml.entry_threshold.unwrap_or(DEFAULT_ENTRY_THRESHOLD),
            exit_threshold: yaml.exit_threshold.unwrap_or(DEFAULT_EXIT_THRESHOLD),
            initial_capital: yaml.initial_capital.unwrap_or(DEFAULT_INITIAL_CAPITAL),
            min_trade_capital: yaml.min_trade_capital.unwrap_or(DEFAULT_MIN_TRADE_CAPITAL),
            instrument_a,
            instrument_b,
            price_file_a,
            price_file_b,
            trade_log_file: yaml
                .trade_log_file
                .unwrap_or_else(|| DEFAULT_TRADE_LOG_FILE.to_string()),
            chart_data_file: yaml.chart_data_file,
            include_short_mark_to_market: yaml.include_short_mark_to_market.unwrap_or(false),
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = BacktestConfig::default();
        if let Ok(value) = env::var("INSTRUMENT_A") {
            if !value.trim().is_empty() {
                cfg.price_file_a = default_price_file(&value);
                cfg.instrument_a = value;
            }
        }
        if let Ok(value) = env::var("INSTRUMENT_B") {
            if !value.trim().is_empty() {
                cfg.price_file_b = default_price_file(&value);
                cfg.instrument_b = value;
            }
        }
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("WINDOW") {
            if let Ok(parsed) = value.parse() {
                self.window = parsed;
            }
        }
        if let Ok(value) = env::var("ENTRY_THRESHOLD") {
            if let Ok(parsed) = value.parse() {
                self.entry_threshold = parsed;
            }
        }
        if let Ok(value) = env::var("EXIT_THRESHOLD") {
            if let Ok(parsed) = value.parse() {
                self.exit_threshold = parsed;
            }
        }
        if let Ok(value) = env::var("INITIAL_CAPITAL") {
            if let Ok(parsed) = value.parse() {
                self.initial_capital = parsed;
            }
        }
        if let Ok(value) = env::var("MIN_TRADE_CAPITAL") {
            if let Ok(parsed) = value.parse() {
                self.min_trade_capital = parsed;
            }
        }
        if let Ok(value) = env::var("PRICE_FILE_A") {
            if !value.trim().is_empty() {
                self.price_file_a = value;
            }
        }
        if let Ok(value) = env::var("PRICE_FILE_B") {
            if !value.trim().is_empty() {
                self.price_file_b = value;
            }
        }
        if let Ok(value) = env::var("TRADE_LOG_FILE") {
            if !value.trim().is_empty() {
                self.trade_log_file = value;
            }
        }
        if let Ok(value) = env::var("CHART_DATA_FILE") {
            if !value.trim().is_empty() {
                self.chart_data_file = Some(value);
            }
        }
        if let Ok(value) = env::var("INCLUDE_SHORT_MARK_TO_MARKET") {
            self.include_short_mark_to_market = value.to_lowercase() == "true";
        }
    }

    fn validate(&self) -> Result<()> {
        if self.window < 2 {
            return Err(anyhow!("window must be at least 2, got {}", self.window));
        }
        if self.entry_threshold <= 0.0 || self.exit_threshold <= 0.0 {
            return Err(anyhow!(
                "thresholds must be positive (entry={}, exit={})",
                self.entry_threshold,
                self.exit_threshold
            ));
        }
        if self.exit_threshold >= self.entry_threshold {
            return Err(anyhow!(
                "exit threshold {} must be below entry threshold {}",
                self.exit_threshold,
                self.entry_threshold
            ));
        }
        if self.initial_capital <= 0.0 {
            return Err(anyhow!(
                "initial capital must be positive, got {}",
                self.initial_capital
            ));
        }
        if self.min_trade_capital < 0.0 {
            return Err(anyhow!(
                "min trade capital must not be negative, got {}",
                self.min_trade_capital
            ));
        }
        if self.instrument_a.trim().is_empty() || self.instrument_b.trim().is_empty() {
            return Err(anyhow!("instrument symbols must not be empty"));
        }
        if self.instrument_a == self.instrument_b {
            return Err(anyhow!(
                "pair legs must differ, got {} twice",
                self.instrument_a
            ));
        }
        Ok(())
    }
}

fn default_price_file(symbol: &str) -> String {
    format!("{}.csv", symbol.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // Tests that read process env vars must not run concurrently.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn yaml_values_override_defaults() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "window: 20\nentry_threshold: 2.0\ninstrument_a: MSFT\ninstrument_b: AAPL\nchart_data_file: chart.jsonl"
        )
        .unwrap();

        let cfg = BacktestConfig::from_yaml_path(file.path()).unwrap();
        assert_eq!(cfg.window, 20);
        assert_eq!(cfg.entry_threshold, 2.0);
        assert_eq!(cfg.exit_threshold, DEFAULT_EXIT_THRESHOLD);
        assert_eq!(cfg.instrument_a, "MSFT");
        assert_eq!(cfg.price_file_a, "msft.csv");
        assert_eq!(cfg.chart_data_file.as_deref(), Some("chart.jsonl"));
    }

    #[test]
    fn env_values_take_precedence_over_yaml() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "window: 20\ninstrument_a: MSFT\ninstrument_b: AAPL"
        )
        .unwrap();

        env::set_var("WINDOW", "35");
        env::set_var("PRICE_FILE_A", "override.csv");
        let cfg = BacktestConfig::from_yaml_path(file.path());
        env::remove_var("WINDOW");
        env::remove_var("PRICE_FILE_A");

        let cfg = cfg.unwrap();
        assert_eq!(cfg.window, 35);
        assert_eq!(cfg.price_file_a, "override.csv");
        // YAML still wins where no env override is set.
        assert_eq!(cfg.instrument_a, "MSFT");
        assert_eq!(cfg.price_file_b, "aapl.csv");
    }

    #[test]
    fn rejects_window_below_two() {
        let mut cfg = BacktestConfig::default();
        cfg.window = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_exit_threshold_at_or_above_entry() {
        let mut cfg = BacktestConfig::default();
        cfg.entry_threshold = 1.0;
        cfg.exit_threshold = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_identical_pair_legs() {
        let mut cfg = BacktestConfig::default();
        cfg.instrument_b = cfg.instrument_a.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn defaults_match_reference_strategy() {
        let cfg = BacktestConfig::default();
        assert_eq!(cfg.window, 50);
        assert_eq!(cfg.entry_threshold, 1.3);
        assert_eq!(cfg.exit_threshold, 0.5);
        assert_eq!(cfg.initial_capital, 5000.0);
        assert_eq!(cfg.min_trade_capital, 1000.0);
        assert!(!cfg.include_short_mark_to_market);
    }
}
