//! Per-symbol series cache.
//!
//! Layout: `{cache_dir}/{SYMBOL}.csv` holds the provider response verbatim,
//! `{cache_dir}/{SYMBOL}.meta.json` a small metadata sidecar.
//!
//! - `%`, `/` and `\` in a symbol are percent-escaped in file names, so
//!   `BRK/B` lives in `BRK%2FB.csv` and never collides with `BRK_B.csv`.
//! - Presence of the `.csv` file is what "cached" means.
//! - Writes are atomic (write to `.csv.tmp`, fsync, rename into place), so a
//!   crash never leaves a truncated file that passes the presence check.
//! - Leftover `.tmp` files from an interrupted run are swept on open.

use super::alphavantage::SeriesFunction;
use super::provider::{sniff, Payload};
use super::series::TimeSeries;
use crate::error::DataError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const DATA_EXT: &str = "csv";
const TMP_EXT: &str = "csv.tmp";
const META_SUFFIX: &str = ".meta.json";

/// Metadata sidecar for a cached symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub symbol: String,
    pub function: SeriesFunction,
    pub row_count: usize,
    pub first_timestamp: Option<NaiveDate>,
    pub last_timestamp: Option<NaiveDate>,
    pub data_hash: String,
    pub cached_at: chrono::NaiveDateTime,
}

/// Cache status for a single symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub symbol: String,
    pub cached: bool,
    pub meta: Option<CacheMeta>,
}

/// A cached file that should not be there.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheProblem {
    pub symbol: String,
    pub path: PathBuf,
    pub reason: String,
}

/// Result of loading many symbols at once.
#[derive(Debug, Default)]
pub struct LoadedSeries {
    pub series: Vec<TimeSeries>,
    pub missing: Vec<String>,
    pub malformed: Vec<(String, DataError)>,
}

/// The on-disk series cache.
#[derive(Debug, Clone)]
pub struct SeriesCache {
    cache_dir: PathBuf,
}

impl SeriesCache {
    /// Cache rooted at `cache_dir`, without touching the filesystem.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Create the directory if needed and sweep interrupted writes.
    pub fn open(cache_dir: impl Into<PathBuf>) -> Result<Self, DataError> {
        let cache = Self::new(cache_dir);
        fs::create_dir_all(&cache.cache_dir)?;
        let swept = cache.sweep_partial_writes()?;
        if swept > 0 {
            tracing::warn!(
                swept,
                dir = %cache.cache_dir.display(),
                "removed partial downloads from an interrupted run"
            );
        }
        Ok(cache)
    }

    /// Root directory of the cache.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// File stem for a symbol. Path separators cannot appear in a file name.
    fn stem(symbol: &str) -> String {
        let mut stem = String::with_capacity(symbol.len());
        for c in symbol.chars() {
            match c {
                '%' => stem.push_str("%25"),
                '/' => stem.push_str("%2F"),
                '\\' => stem.push_str("%5C"),
                c => stem.push(c),
            }
        }
        stem
    }

    /// Inverse of [`SeriesCache::stem`].
    fn symbol_from_stem(stem: &str) -> String {
        let mut symbol = String::with_capacity(stem.len());
        let mut rest = stem;
        while let Some(pos) = rest.find('%') {
            symbol.push_str(&rest[..pos]);
            let escaped = &rest[pos..];
            let (decoded, len) = if escaped.starts_with("%25") {
                ('%', 3)
            } else if escaped.starts_with("%2F") {
                ('/', 3)
            } else if escaped.starts_with("%5C") {
                ('\\', 3)
            } else {
                ('%', 1)
            };
            symbol.push(decoded);
            rest = &escaped[len..];
        }
        symbol.push_str(rest);
        symbol
    }

    /// Path of the cached series for a symbol: `{cache_dir}/{SYMBOL}.csv`.
    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{DATA_EXT}", Self::stem(symbol)))
    }

    fn tmp_path(&self, symbol: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{TMP_EXT}", Self::stem(symbol)))
    }

    fn meta_path(&self, symbol: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}{META_SUFFIX}", Self::stem(symbol)))
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.path_for(symbol).is_file()
    }

    /// Persist a response body for `symbol`, atomically, and write its sidecar.
    pub fn store(
        &self,
        symbol: &str,
        body: &[u8],
        function: SeriesFunction,
    ) -> Result<CacheMeta, DataError> {
        fs::create_dir_all(&self.cache_dir)?;
        let path = self.path_for(symbol);
        let tmp_path = self.tmp_path(symbol);

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(body)?;
            file.sync_all()
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp_path);
            return Err(DataError::CacheError(format!("write {}: {e}", tmp_path.display())));
        }

        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            DataError::CacheError(format!("atomic rename failed: {e}"))
        })?;

        // The series is cached from here on; the sidecar is informational.
        let meta = Self::describe(symbol, body, function);
        if let Err(e) = self.write_meta(symbol, &meta) {
            tracing::warn!(symbol, error = %e, "series cached without its metadata sidecar");
        }

        Ok(meta)
    }

    fn write_meta(&self, symbol: &str, meta: &CacheMeta) -> Result<(), DataError> {
        let meta_json = serde_json::to_string_pretty(meta)
            .map_err(|e| DataError::CacheError(format!("meta serialization: {e}")))?;
        fs::write(self.meta_path(symbol), meta_json)
            .map_err(|e| DataError::CacheError(format!("meta write: {e}")))
    }

    fn describe(symbol: &str, body: &[u8], function: SeriesFunction) -> CacheMeta {
        let (row_count, first, last) = match TimeSeries::parse(symbol, body) {
            Ok(series) => (series.len(), series.first_date(), series.last_date()),
            Err(e) => {
                tracing::warn!(symbol, error = %e, "cached series does not parse");
                let lines = body.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count();
                (lines.saturating_sub(1), None, None)
            }
        };
        CacheMeta {
            symbol: symbol.to_string(),
            function,
            row_count,
            first_timestamp: first,
            last_timestamp: last,
            data_hash: blake3::hash(body).to_hex().to_string(),
            cached_at: chrono::Local::now().naive_local(),
        }
    }

    /// Remove a symbol's series and sidecar. Returns whether a series existed.
    pub fn remove(&self, symbol: &str) -> Result<bool, DataError> {
        let existed = remove_if_exists(&self.path_for(symbol))?;
        remove_if_exists(&self.meta_path(symbol))?;
        Ok(existed)
    }

    /// Load a cached series.
    pub fn load(&self, symbol: &str) -> Result<TimeSeries, DataError> {
        let path = self.path_for(symbol);
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DataError::NoCachedData {
                    symbol: symbol.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        TimeSeries::parse(symbol, &body)
    }

    /// Load every cached series among `symbols`, skipping those not cached.
    pub fn load_all(&self, symbols: &[&str]) -> LoadedSeries {
        let mut out = LoadedSeries::default();
        for &symbol in symbols {
            match self.load(symbol) {
                Ok(series) => out.series.push(series),
                Err(DataError::NoCachedData { .. }) => out.missing.push(symbol.to_string()),
                Err(e) => out.malformed.push((symbol.to_string(), e)),
            }
        }
        out
    }

    /// Read a symbol's sidecar, if present and readable.
    pub fn get_meta(&self, symbol: &str) -> Option<CacheMeta> {
        let content = fs::read_to_string(self.meta_path(symbol)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Cache status for each symbol.
    pub fn status(&self, symbols: &[&str]) -> Vec<CacheStatus> {
        symbols
            .iter()
            .map(|sym| CacheStatus {
                symbol: sym.to_string(),
                cached: self.contains(sym),
                meta: self.get_meta(sym),
            })
            .collect()
    }

    /// Symbols with a cached series, sorted.
    pub fn cached_symbols(&self) -> Result<Vec<String>, DataError> {
        let mut symbols = Vec::new();
        for (symbol, _) in self.data_files()? {
            symbols.push(symbol);
        }
        symbols.sort();
        Ok(symbols)
    }

    /// Total size in bytes of everything in the cache directory.
    pub fn total_size(&self) -> Result<u64, DataError> {
        let mut size = 0;
        if !self.cache_dir.exists() {
            return Ok(0);
        }
        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    size += meta.len();
                }
            }
        }
        Ok(size)
    }

    /// Find cached files that are error payloads or do not parse as a series.
    pub fn verify(&self) -> Result<Vec<CacheProblem>, DataError> {
        let mut problems = Vec::new();
        for (symbol, path) in self.data_files()? {
            let body = fs::read(&path)?;
            let reason = match sniff(&body) {
                Payload::Rejected { message } => Some(format!("error payload: {message}")),
                Payload::Csv => TimeSeries::parse(&symbol, &body)
                    .err()
                    .map(|e| e.to_string()),
            };
            if let Some(reason) = reason {
                problems.push(CacheProblem {
                    symbol,
                    path,
                    reason,
                });
            }
        }
        problems.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(problems)
    }

    /// Delete leftover `.csv.tmp` files. Returns how many were removed.
    pub fn sweep_partial_writes(&self) -> Result<usize, DataError> {
        let mut removed = 0;
        if !self.cache_dir.exists() {
            return Ok(0);
        }
        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            let is_tmp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&format!(".{TMP_EXT}")));
            if is_tmp && path.is_file() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// `(symbol, path)` for every `*.csv` in the cache directory.
    fn data_files(&self) -> Result<Vec<(String, PathBuf)>, DataError> {
        let mut files = Vec::new();
        if !self.cache_dir.exists() {
            return Ok(files);
        }
        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(DATA_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                files.push((Self::symbol_from_stem(stem), path.clone()));
            }
        }
        Ok(files)
    }
}

fn remove_if_exists(path: &Path) -> Result<bool, DataError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "\
timestamp,open,high,low,close,volume
2024-01-03,101.0,103.0,100.0,102.0,1100
2024-01-02,100.0,102.0,99.0,101.0,1000
";

    fn cache() -> (tempfile::TempDir, SeriesCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::open(dir.path().join("symbols")).unwrap();
        (dir, cache)
    }

    #[test]
    fn store_and_load_roundtrip() {
        let (_dir, cache) = cache();
        cache.store("SPY", BODY.as_bytes(), SeriesFunction::Daily).unwrap();

        assert!(cache.contains("SPY"));
        assert_eq!(fs::read(cache.path_for("SPY")).unwrap(), BODY.as_bytes());

        let series = cache.load("SPY").unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.first_date(), NaiveDate::from_ymd_opt(2024, 1, 2));
    }

    #[test]
    fn store_leaves_no_tmp_file() {
        let (_dir, cache) = cache();
        cache.store("SPY", BODY.as_bytes(), SeriesFunction::Daily).unwrap();
        assert!(!cache.tmp_path("SPY").exists());
    }

    #[test]
    fn meta_describes_series() {
        let (_dir, cache) = cache();
        cache.store("SPY", BODY.as_bytes(), SeriesFunction::Daily).unwrap();
        let meta = cache.get_meta("SPY").unwrap();

        assert_eq!(meta.row_count, 2);
        assert_eq!(meta.last_timestamp, NaiveDate::from_ymd_opt(2024, 1, 3));
        assert_eq!(meta.data_hash, blake3::hash(BODY.as_bytes()).to_hex().to_string());
        assert_eq!(cache.cached_symbols().unwrap(), vec!["SPY".to_string()]);
    }

    #[test]
    fn load_nonexistent_returns_no_cached_data() {
        let (_dir, cache) = cache();
        assert!(matches!(
            cache.load("NONEXISTENT"),
            Err(DataError::NoCachedData { .. })
        ));
    }

    #[test]
    fn open_sweeps_partial_writes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("AAPL.csv.tmp"), "timestamp,op").unwrap();
        fs::write(dir.path().join("MSFT.csv"), BODY).unwrap();

        let cache = SeriesCache::open(dir.path()).unwrap();

        assert!(!dir.path().join("AAPL.csv.tmp").exists());
        assert!(!cache.contains("AAPL"));
        assert!(cache.contains("MSFT"));
    }

    #[test]
    fn remove_deletes_series_and_meta() {
        let (_dir, cache) = cache();
        cache.store("SPY", BODY.as_bytes(), SeriesFunction::Daily).unwrap();
        assert!(cache.remove("SPY").unwrap());
        assert!(!cache.contains("SPY"));
        assert!(cache.get_meta("SPY").is_none());
        assert!(!cache.remove("SPY").unwrap());
    }

    #[test]
    fn verify_flags_error_payloads() {
        let (_dir, cache) = cache();
        cache.store("SPY", BODY.as_bytes(), SeriesFunction::Daily).unwrap();
        fs::write(
            cache.path_for("BAD"),
            r#"{"Note": "API call frequency exceeded"}"#,
        )
        .unwrap();

        let problems = cache.verify().unwrap();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].symbol, "BAD");
        assert!(problems[0].reason.contains("frequency"));
    }

    #[test]
    fn load_all_splits_missing_and_malformed() {
        let (_dir, cache) = cache();
        cache.store("SPY", BODY.as_bytes(), SeriesFunction::Daily).unwrap();
        fs::write(cache.path_for("JUNK"), "not,a,series\n1,2,3\n").unwrap();

        let loaded = cache.load_all(&["SPY", "QQQ", "JUNK"]);
        assert_eq!(loaded.series.len(), 1);
        assert_eq!(loaded.missing, vec!["QQQ".to_string()]);
        assert_eq!(loaded.malformed.len(), 1);
        assert_eq!(loaded.malformed[0].0, "JUNK");
    }

    #[test]
    fn symbol_with_slash_stays_in_cache_dir() {
        let (_dir, cache) = cache();
        let path = cache.path_for("BRK/B");
        assert_eq!(path.parent(), Some(cache.cache_dir()));
    }

    #[test]
    fn escaped_symbols_do_not_collide() {
        let (_dir, cache) = cache();
        cache.store("BRK/B", BODY.as_bytes(), SeriesFunction::Daily).unwrap();

        assert!(cache.contains("BRK/B"));
        assert!(!cache.contains("BRK_B"));
        assert!(!cache.contains("BRK%2FB"));
        assert_ne!(cache.path_for("BRK/B"), cache.path_for("BRK_B"));

        cache.store("BRK%2FB", BODY.as_bytes(), SeriesFunction::Daily).unwrap();
        assert_eq!(
            cache.cached_symbols().unwrap(),
            vec!["BRK%2FB".to_string(), "BRK/B".to_string()]
        );
    }

    #[test]
    fn failed_sidecar_write_still_caches_series() {
        let (_dir, cache) = cache();
        // A directory where the sidecar should go makes its write fail.
        fs::create_dir_all(cache.meta_path("AAPL")).unwrap();

        let meta = cache.store("AAPL", BODY.as_bytes(), SeriesFunction::Daily).unwrap();

        assert_eq!(meta.row_count, 2);
        assert!(cache.contains("AAPL"));
        assert!(cache.get_meta("AAPL").is_none());
        assert_eq!(cache.load("AAPL").unwrap().len(), 2);
    }
}
