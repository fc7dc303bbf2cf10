//! Stockpile Core: exchange listings, the symbol registry, and a
//! quota-paced bulk downloader for per-symbol price history.
//!
//! - Listing loader that reconciles per-exchange CSV schemas
//! - Registry with explicit duplicate tie-breaking and preferred-stock filter
//! - Alpha Vantage client behind the `QuoteSource` trait
//! - Downloader with a shared rate limiter, error-payload detection and a
//!   circuit breaker
//! - Series cache with atomic writes and metadata sidecars

pub mod config;
pub mod data;
pub mod error;
pub mod listing;
pub mod registry;

pub use config::{ApiKey, Config};
pub use error::DataError;
pub use listing::{Exchange, ListingRow};
pub use registry::{Registry, TieBreak};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: types handed to the download workers are Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<data::SeriesCache>();
        require_sync::<data::SeriesCache>();
        require_send::<data::RateLimiter>();
        require_sync::<data::RateLimiter>();
        require_send::<data::CircuitBreaker>();
        require_sync::<data::CircuitBreaker>();
        require_send::<data::AlphaVantageClient>();
        require_sync::<data::AlphaVantageClient>();
        require_send::<data::Outcome>();
        require_send::<Registry>();
        require_sync::<Registry>();
        require_send::<Config>();
        require_sync::<Config>();
    }
}
