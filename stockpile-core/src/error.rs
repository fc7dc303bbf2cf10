//! Structured error types shared by the listing loader, the provider client,
//! the cache and the downloader.
//!
//! These are designed to be displayable in CLI output as-is.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised anywhere in the core crate.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("listing file not readable: {path}: {source}")]
    ListingUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{exchange} listing is missing required column '{column}'")]
    MissingColumn { exchange: String, column: String },

    #[error("{exchange} listing has unnamed column '{column}' holding data (row {row}: '{value}')")]
    UnnamedColumnWithData {
        exchange: String,
        column: String,
        row: usize,
        value: String,
    },

    #[error("invalid market cap for {symbol}: '{raw}'")]
    InvalidMarketCap { symbol: String, raw: String },

    #[error("unknown exchange '{0}' (expected nasdaq, amex or nyse)")]
    UnknownExchange(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("API key file not readable: {path}: {reason}")]
    ApiKey { path: PathBuf, reason: String },

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("cache error: {0}")]
    CacheError(String),

    #[error("no cached data for symbol '{symbol}'; run `download` first")]
    NoCachedData { symbol: String },

    #[error("malformed series for {symbol}: {reason}")]
    MalformedSeries { symbol: String, reason: String },
}
