// src/lib.rs
pub mod ports {
    pub mod csv_source;
}
pub mod backtest;
pub mod config;
pub mod report;
