//! Remote time series: provider client, pacing, the on-disk cache and the
//! bulk downloader.

pub mod alphavantage;
pub mod cache;
pub mod circuit_breaker;
pub mod download;
pub mod provider;
pub mod rate_limit;
pub mod series;

pub use alphavantage::{AlphaVantageClient, SeriesFunction};
pub use cache::{CacheMeta, CacheProblem, CacheStatus, LoadedSeries, SeriesCache};
pub use circuit_breaker::CircuitBreaker;
pub use download::{DownloadProgress, DownloadSummary, Downloader, LogProgress, Outcome};
pub use provider::{Payload, QuoteSource, RawResponse};
pub use rate_limit::RateLimiter;
pub use series::{SeriesBar, TimeSeries};
