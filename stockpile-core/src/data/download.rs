//! Bulk downloader: walks the registry, fetches what is not cached, paces
//! requests to the daily quota and reports progress.

use super::alphavantage::SeriesFunction;
use super::cache::SeriesCache;
use super::circuit_breaker::{CircuitBreaker, QUOTA_WINDOW};
use super::provider::{Payload, QuoteSource};
use super::rate_limit::RateLimiter;
use crate::config::Config;
use crate::error::DataError;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What happened to one symbol.
#[derive(Debug)]
pub enum Outcome {
    /// Already on disk; no request made.
    Cached,
    /// Fetched and stored.
    Downloaded { bytes: usize },
    /// Provider answered with an error payload; nothing stored. The symbol
    /// is retried on the next run.
    Rejected { message: String },
    /// Transport or storage error.
    Failed(DataError),
    /// Not attempted because the circuit breaker is open.
    Skipped,
}

impl Outcome {
    /// Whether this outcome consumed a request.
    pub fn requested(&self) -> bool {
        !matches!(self, Outcome::Cached | Outcome::Skipped)
    }
}

/// Progress callback for multi-symbol downloads.
pub trait DownloadProgress: Send + Sync {
    /// Called before a symbol is processed.
    fn on_start(&self, symbol: &str, index: usize, total: usize);

    /// Called when a symbol is done.
    fn on_complete(&self, symbol: &str, index: usize, total: usize, outcome: &Outcome);

    /// Called when the entire batch is done.
    fn on_batch_complete(&self, summary: &DownloadSummary);
}

/// Progress reporter that logs through `tracing`.
#[derive(Debug, Default)]
pub struct LogProgress;

impl DownloadProgress for LogProgress {
    fn on_start(&self, symbol: &str, index: usize, total: usize) {
        tracing::debug!(symbol, "[{}/{}] fetching", index + 1, total);
    }

    fn on_complete(&self, symbol: &str, index: usize, total: usize, outcome: &Outcome) {
        let progress = format!("{}/{}", index + 1, total);
        match outcome {
            Outcome::Cached => tracing::debug!(symbol, %progress, "already cached"),
            Outcome::Downloaded { bytes } => {
                tracing::info!(symbol, %progress, bytes, "downloaded")
            }
            Outcome::Rejected { message } => {
                tracing::warn!(symbol, %progress, %message, "rejected by provider")
            }
            Outcome::Failed(e) => tracing::error!(symbol, %progress, error = %e, "failed"),
            Outcome::Skipped => tracing::debug!(symbol, %progress, "skipped"),
        }
    }

    fn on_batch_complete(&self, summary: &DownloadSummary) {
        tracing::info!(
            total = summary.total,
            cached = summary.cached,
            downloaded = summary.downloaded,
            rejected = summary.rejected.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            requests = summary.requests,
            "download complete"
        );
    }
}

/// Summary of a batch download.
#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub total: usize,
    pub cached: usize,
    pub downloaded: usize,
    pub requests: usize,
    pub rejected: Vec<(String, String)>,
    pub failed: Vec<(String, DataError)>,
    pub skipped: Vec<String>,
}

impl DownloadSummary {
    fn record(&mut self, symbol: &str, outcome: Outcome) {
        if outcome.requested() {
            self.requests += 1;
        }
        match outcome {
            Outcome::Cached => self.cached += 1,
            Outcome::Downloaded { .. } => self.downloaded += 1,
            Outcome::Rejected { message } => self.rejected.push((symbol.to_string(), message)),
            Outcome::Failed(e) => self.failed.push((symbol.to_string(), e)),
            Outcome::Skipped => self.skipped.push(symbol.to_string()),
        }
    }

    /// No transport or storage errors. Rejections are expected and retried
    /// on a later run.
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    /// Symbols still missing from the cache after this batch.
    pub fn pending(&self) -> usize {
        self.rejected.len() + self.failed.len() + self.skipped.len()
    }

    pub fn is_complete(&self) -> bool {
        self.pending() == 0
    }
}

/// Rate-limited bulk downloader.
pub struct Downloader<'a> {
    source: &'a dyn QuoteSource,
    cache: &'a SeriesCache,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    function: SeriesFunction,
    error_cooldown: Duration,
    concurrency: usize,
    requests: RequestCounter,
}

impl<'a> Downloader<'a> {
    /// Downloader paced by `config.download`.
    pub fn new(source: &'a dyn QuoteSource, cache: &'a SeriesCache, config: &Config) -> Self {
        Self {
            source,
            cache,
            limiter: RateLimiter::per_window(config.download.daily_quota, QUOTA_WINDOW),
            breaker: CircuitBreaker::for_quota_window(config.download.breaker_threshold),
            function: config.provider.function,
            error_cooldown: config.error_cooldown(),
            concurrency: config.download.concurrency.max(1),
            requests: RequestCounter::default(),
        }
    }

    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Time until the circuit breaker lets requests through again (zero
    /// unless it tripped during this run).
    pub fn breaker_cooldown(&self) -> Duration {
        self.breaker.remaining_cooldown()
    }

    /// Requests issued by this downloader so far.
    pub fn requests_made(&self) -> usize {
        self.requests.get()
    }

    /// Symbols among `symbols` that are not cached yet, in order.
    pub fn pending<'s>(&self, symbols: &[&'s str]) -> Vec<&'s str> {
        symbols
            .iter()
            .copied()
            .filter(|s| !self.cache.contains(s))
            .collect()
    }

    /// Download every symbol not already cached.
    pub fn download_all(
        &self,
        symbols: &[&str],
        progress: &dyn DownloadProgress,
    ) -> DownloadSummary {
        let total = symbols.len();
        tracing::info!(
            total,
            source = self.source.name(),
            function = %self.function,
            concurrency = self.concurrency,
            interval_ms = self.limiter.min_interval().as_millis() as u64,
            "starting download"
        );

        let outcomes: Vec<Outcome> = if self.concurrency <= 1 {
            symbols
                .iter()
                .enumerate()
                .map(|(i, symbol)| self.process(symbol, i, total, progress))
                .collect()
        } else {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(self.concurrency)
                .build()
            {
                Ok(pool) => pool.install(|| {
                    symbols
                        .par_iter()
                        .enumerate()
                        .map(|(i, symbol)| self.process(symbol, i, total, progress))
                        .collect()
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "thread pool unavailable; downloading sequentially");
                    symbols
                        .iter()
                        .enumerate()
                        .map(|(i, symbol)| self.process(symbol, i, total, progress))
                        .collect()
                }
            }
        };

        let mut summary = DownloadSummary {
            total,
            ..DownloadSummary::default()
        };
        for (symbol, outcome) in symbols.iter().zip(outcomes) {
            summary.record(symbol, outcome);
        }

        progress.on_batch_complete(&summary);
        summary
    }

    fn process(
        &self,
        symbol: &str,
        index: usize,
        total: usize,
        progress: &dyn DownloadProgress,
    ) -> Outcome {
        progress.on_start(symbol, index, total);
        let outcome = self.download_one(symbol);
        progress.on_complete(symbol, index, total, &outcome);
        outcome
    }

    /// Fetch and store a single symbol unless it is already cached.
    pub fn download_one(&self, symbol: &str) -> Outcome {
        if self.cache.contains(symbol) {
            return Outcome::Cached;
        }
        if !self.breaker.is_allowed() {
            return Outcome::Skipped;
        }

        self.limiter.acquire();
        self.requests.increment();
        let response = match self.source.fetch(symbol) {
            Ok(response) => response,
            Err(e) => return Outcome::Failed(e),
        };

        match response.classify() {
            Payload::Rejected { message } => {
                self.breaker.record_failure();
                tracing::warn!(
                    symbol,
                    %message,
                    cooldown_secs = self.error_cooldown.as_secs(),
                    "provider returned an error payload; pausing, rerun later to fetch it"
                );
                self.limiter.defer(self.error_cooldown);
                // A file from an older, non-atomic run may still be around.
                if let Err(e) = self.cache.remove(symbol) {
                    return Outcome::Failed(e);
                }
                Outcome::Rejected { message }
            }
            Payload::Csv => match self.cache.store(symbol, &response.body, self.function) {
                Ok(_) => {
                    self.breaker.record_success();
                    Outcome::Downloaded {
                        bytes: response.body.len(),
                    }
                }
                Err(e) => Outcome::Failed(e),
            },
        }
    }
}

/// Thread-safe request counter.
#[derive(Debug, Default)]
pub struct RequestCounter(AtomicUsize);

impl RequestCounter {
    pub fn increment(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::provider::RawResponse;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const BODY: &str = "timestamp,open,high,low,close,volume\n2024-01-02,1,2,0.5,1.5,10\n";

    struct Scripted {
        responses: Mutex<HashMap<String, RawResponse>>,
        calls: RequestCounter,
    }

    impl Scripted {
        fn new(entries: &[(&str, RawResponse)]) -> Self {
            Self {
                responses: Mutex::new(
                    entries
                        .iter()
                        .map(|(s, r)| (s.to_string(), r.clone()))
                        .collect(),
                ),
                calls: RequestCounter::default(),
            }
        }
    }

    impl QuoteSource for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn fetch(&self, symbol: &str) -> Result<RawResponse, DataError> {
            self.calls.increment();
            self.responses
                .lock()
                .unwrap()
                .get(symbol)
                .cloned()
                .ok_or_else(|| DataError::NetworkUnreachable(format!("{symbol}: no route")))
        }
    }

    fn fast_config() -> Config {
        let mut config = Config::with_root("/unused");
        config.download.daily_quota = u32::MAX;
        config.download.error_cooldown_secs = 0;
        config
    }

    #[test]
    fn cached_symbols_make_no_request() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::open(dir.path()).unwrap();
        cache.store("AAPL", BODY.as_bytes(), SeriesFunction::Daily).unwrap();
        let source = Scripted::new(&[]);

        let dl = Downloader::new(&source, &cache, &fast_config());
        assert!(matches!(dl.download_one("AAPL"), Outcome::Cached));
        assert_eq!(source.calls.get(), 0);
        assert_eq!(dl.requests_made(), 0);
    }

    #[test]
    fn rejection_leaves_nothing_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::open(dir.path()).unwrap();
        let source = Scripted::new(&[("AAPL", RawResponse::csv("{\"Note\": \"slow down\"}"))]);

        let dl = Downloader::new(&source, &cache, &fast_config());
        match dl.download_one("AAPL") {
            Outcome::Rejected { message } => assert_eq!(message, "slow down"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!cache.contains("AAPL"));
        assert_eq!(dl.pending(&["AAPL"]), vec!["AAPL"]);
    }

    #[test]
    fn network_error_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::open(dir.path()).unwrap();
        let source = Scripted::new(&[]);

        let dl = Downloader::new(&source, &cache, &fast_config());
        let summary = dl.download_all(&["NOPE"], &LogProgress);
        assert!(!summary.all_succeeded());
        assert_eq!(summary.requests, 1);
        assert_eq!(summary.pending(), 1);
    }

    #[test]
    fn breaker_skips_rest_of_batch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::open(dir.path()).unwrap();
        let throttled = RawResponse::json("{\"Note\": \"quota\"}");
        let source = Scripted::new(&[
            ("A", throttled.clone()),
            ("B", throttled.clone()),
            ("C", RawResponse::csv(BODY)),
        ]);

        let mut config = fast_config();
        config.download.breaker_threshold = 2;
        let dl = Downloader::new(&source, &cache, &config);
        let summary = dl.download_all(&["A", "B", "C"], &LogProgress);

        assert_eq!(summary.rejected.len(), 2);
        assert_eq!(summary.skipped, vec!["C".to_string()]);
        assert_eq!(source.calls.get(), 2);
        assert!(summary.all_succeeded());
        assert!(!summary.is_complete());
        assert!(dl.breaker_cooldown() > Duration::from_secs(23 * 60 * 60));
    }
}
