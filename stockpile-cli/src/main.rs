//! Stockpile CLI: registry, download, and cache management commands.
//!
//! Commands:
//! - `registry`: merge the exchange listings and report (or save) the registry
//! - `download`: fetch every registry symbol not yet cached, paced to the quota
//! - `cache status`: report cache size, symbol count, date ranges
//! - `cache verify`: find cached files that are error payloads or corrupt
//! - `config`: print the effective configuration

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use stockpile_core::config::default_root_dir;
use stockpile_core::data::{
    AlphaVantageClient, DownloadProgress, DownloadSummary, Downloader, Outcome, SeriesCache,
};
use stockpile_core::{ApiKey, Config, Exchange, Registry, TieBreak};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "stockpile",
    about = "Stockpile: exchange listings and quota-paced price history downloads"
)]
struct Cli {
    /// Path to a TOML config file. Defaults to ~/stocks/config.toml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root directory (listings, key file, cache). Defaults to ~/stocks.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Cache directory. Defaults to root/symbols.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Log at debug level (RUST_LOG overrides).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct RegistryArgs {
    /// Only use these exchanges (nasdaq, amex, nyse).
    #[arg(long = "exchange")]
    exchanges: Vec<String>,

    /// Shuffle listings before deduplicating (random duplicate winner).
    #[arg(long, default_value_t = false)]
    shuffle: bool,

    /// Seed the shuffle (implies --shuffle).
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge the exchange listings into the symbol registry.
    Registry {
        #[command(flatten)]
        registry: RegistryArgs,

        /// Write the registry as CSV to this path.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Write the registry to the default location (root/reduced_data.csv).
        #[arg(long, default_value_t = false, conflicts_with = "output")]
        save: bool,
    },
    /// Download the series of every registry symbol not already cached.
    Download {
        #[command(flatten)]
        registry: RegistryArgs,

        /// Download these symbols instead of the registry.
        #[arg(long, num_args = 1..)]
        symbols: Vec<String>,

        /// Use the registry saved by `registry --save` instead of rebuilding
        /// it from the listings, keeping its order across runs.
        #[arg(long, default_value_t = false, conflicts_with = "symbols")]
        from_saved: bool,

        /// Fetch at most this many uncached symbols.
        #[arg(long)]
        limit: Option<usize>,

        /// List pending symbols without requesting anything.
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Override the daily request quota.
        #[arg(long)]
        quota: Option<u32>,

        /// Concurrent fetches (sharing the quota).
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Cache management commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Print the effective configuration as TOML.
    Config,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Report cache size, symbol count, and date ranges.
    Status {
        /// List every cached symbol.
        #[arg(long, default_value_t = false)]
        list: bool,
    },
    /// Find cached files that hold error payloads or do not parse.
    Verify {
        /// Actually delete (without this flag, only previews what would be removed).
        #[arg(long, default_value_t = false)]
        confirm: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(root) = cli.root {
        config.root_dir = root;
    }
    if cli.cache_dir.is_some() {
        config.cache_dir = cli.cache_dir;
    }

    match cli.command {
        Commands::Registry {
            registry,
            output,
            save,
        } => {
            let path = if save {
                Some(config.registry_file())
            } else {
                output
            };
            run_registry(&config, &registry, path.as_deref())
        }
        Commands::Download {
            registry,
            symbols,
            from_saved,
            limit,
            dry_run,
            quota,
            concurrency,
        } => {
            if let Some(quota) = quota {
                config.download.daily_quota = quota;
            }
            if let Some(concurrency) = concurrency {
                config.download.concurrency = concurrency;
            }
            config.validate()?;
            let source = if !symbols.is_empty() {
                SymbolSource::Explicit(symbols)
            } else if from_saved {
                SymbolSource::Saved
            } else {
                SymbolSource::Listings(registry)
            };
            run_download(&config, source, limit, dry_run)
        }
        Commands::Cache { action } => match action {
            CacheAction::Status { list } => run_cache_status(&config, list),
            CacheAction::Verify { confirm } => run_cache_verify(&config, confirm),
        },
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        return Config::from_file(path).with_context(|| format!("loading {}", path.display()));
    }
    let default_path = default_root_dir().join("config.toml");
    if default_path.is_file() {
        tracing::debug!(path = %default_path.display(), "using default config file");
        return Ok(Config::from_file(&default_path)?);
    }
    Ok(Config::default())
}

fn build_registry(config: &Config, args: &RegistryArgs) -> Result<Registry> {
    let exchanges = if args.exchanges.is_empty() {
        config.registry.exchanges.clone()
    } else {
        args.exchanges
            .iter()
            .map(|e| e.parse::<Exchange>())
            .collect::<Result<Vec<_>, _>>()?
    };
    let tie_break = if args.shuffle || args.seed.is_some() {
        TieBreak::Shuffled { seed: args.seed }
    } else {
        config.registry.tie_break
    };

    let listing_dir = config.listing_dir();
    Registry::load(&listing_dir, &exchanges, tie_break)
        .with_context(|| format!("loading listings from {}", listing_dir.display()))
}

/// Where `download` takes its symbols from.
enum SymbolSource {
    Listings(RegistryArgs),
    Saved,
    Explicit(Vec<String>),
}

fn run_registry(config: &Config, args: &RegistryArgs, output: Option<&Path>) -> Result<()> {
    let registry = build_registry(config, args)?;

    println!("Registry: {} symbols", registry.len());
    for (exchange, count) in registry.count_by_exchange() {
        println!("  {:<8} {count}", exchange.as_str());
    }
    let unknown_sector = registry
        .rows()
        .iter()
        .filter(|r| r.sector == stockpile_core::listing::UNKNOWN_SECTOR)
        .count();
    let no_cap = registry
        .rows()
        .iter()
        .filter(|r| r.market_cap.is_none())
        .count();
    println!("Unknown sector: {unknown_sector}");
    println!("No market cap:  {no_cap}");

    if let Some(path) = output {
        registry.save_csv(path)?;
        println!("Saved to: {}", path.display());
    }
    Ok(())
}

/// Progress reporter that drives an indicatif bar.
struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40} {pos}/{len} {msg} (eta {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar }
    }
}

impl DownloadProgress for BarProgress {
    fn on_start(&self, symbol: &str, _index: usize, _total: usize) {
        self.bar.set_message(symbol.to_string());
    }

    fn on_complete(&self, symbol: &str, _index: usize, _total: usize, outcome: &Outcome) {
        if let Outcome::Failed(e) = outcome {
            self.bar.println(format!("  FAIL: {symbol}: {e}"));
        }
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, _summary: &DownloadSummary) {
        self.bar.finish_and_clear();
    }
}

fn run_download(
    config: &Config,
    source: SymbolSource,
    limit: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    let symbols: Vec<String> = match source {
        SymbolSource::Listings(args) => {
            let registry = build_registry(config, &args)?;
            registry.symbols().into_iter().map(String::from).collect()
        }
        SymbolSource::Saved => {
            let path = config.registry_file();
            let registry = Registry::read_csv(&path).with_context(|| {
                format!("reading {} (run `registry --save` first)", path.display())
            })?;
            registry.symbols().into_iter().map(String::from).collect()
        }
        SymbolSource::Explicit(symbols) => {
            symbols.into_iter().map(|s| s.trim().to_string()).collect()
        }
    };
    if symbols.is_empty() {
        bail!("no symbols to download");
    }

    let cache = SeriesCache::open(config.cache_dir())?;
    let sym_refs: Vec<&str> = symbols.iter().map(|s| s.as_str()).collect();
    let mut pending: Vec<&str> = sym_refs
        .iter()
        .copied()
        .filter(|s| !cache.contains(s))
        .collect();
    let already = sym_refs.len() - pending.len();
    if let Some(limit) = limit {
        pending.truncate(limit);
    }

    println!(
        "{} symbols, {already} already cached, {} to fetch",
        sym_refs.len(),
        pending.len()
    );
    if pending.is_empty() {
        return Ok(());
    }

    if dry_run {
        let eta = config.request_interval() * pending.len().min(u32::MAX as usize) as u32;
        for symbol in &pending {
            println!("  {symbol}");
        }
        println!(
            "At {} requests/day this takes about {}.",
            config.download.daily_quota,
            format_duration(eta)
        );
        return Ok(());
    }

    let key_file = config.api_key_file();
    let api_key = ApiKey::from_file(&key_file)?;
    let client = AlphaVantageClient::new(&config.provider, api_key, config.request_timeout())?;
    let downloader = Downloader::new(&client, &cache, config);

    let progress = BarProgress::new(pending.len());
    let summary = downloader.download_all(&pending, &progress);

    println!(
        "Download complete: {} fetched, {} rejected, {} failed, {} skipped",
        summary.downloaded,
        summary.rejected.len(),
        summary.failed.len(),
        summary.skipped.len()
    );
    let cooldown = downloader.breaker_cooldown();
    if !cooldown.is_zero() {
        println!(
            "Provider kept rejecting requests; the quota should reset in about {}.",
            format_duration(cooldown)
        );
    }
    if !summary.rejected.is_empty() || !summary.skipped.is_empty() {
        println!(
            "{} symbol(s) still pending; rerun later to fetch them.",
            summary.rejected.len() + summary.skipped.len()
        );
    }

    if !summary.all_succeeded() {
        for (sym, err) in &summary.failed {
            eprintln!("Error for {sym}: {err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn run_cache_status(config: &Config, list: bool) -> Result<()> {
    let cache_dir = config.cache_dir();
    if !cache_dir.exists() {
        println!("Cache directory does not exist: {}", cache_dir.display());
        return Ok(());
    }

    let cache = SeriesCache::new(&cache_dir);
    let symbols = cache.cached_symbols()?;
    println!("Cache: {}", cache_dir.display());
    println!("Symbols: {}", symbols.len());
    println!("Total size: {}", format_size(cache.total_size()?));

    match Registry::load(
        &config.listing_dir(),
        &config.registry.exchanges,
        config.registry.tie_break,
    ) {
        Ok(registry) => {
            let pending = registry
                .symbols()
                .into_iter()
                .filter(|s| !cache.contains(s))
                .count();
            println!("Pending: {pending} of {} registry symbols", registry.len());
        }
        Err(e) => println!("Pending: unknown ({e})"),
    }

    if !list || symbols.is_empty() {
        return Ok(());
    }

    let refs: Vec<&str> = symbols.iter().map(|s| s.as_str()).collect();
    println!();
    println!("{:<8} {:<25} {:>8}", "Symbol", "Date Range", "Rows");
    println!("{}", "-".repeat(43));
    for status in cache.status(&refs) {
        let (range, rows) = match &status.meta {
            Some(meta) => (
                match (meta.first_timestamp, meta.last_timestamp) {
                    (Some(a), Some(b)) => format!("{a} to {b}"),
                    _ => "(no dates)".to_string(),
                },
                meta.row_count.to_string(),
            ),
            None => ("(no meta)".to_string(), "-".to_string()),
        };
        println!("{:<8} {:<25} {:>8}", status.symbol, range, rows);
    }
    Ok(())
}

fn run_cache_verify(config: &Config, confirm: bool) -> Result<()> {
    let cache_dir = config.cache_dir();
    if !cache_dir.exists() {
        println!("Cache directory does not exist: {}", cache_dir.display());
        return Ok(());
    }

    let cache = SeriesCache::new(&cache_dir);
    let problems = cache.verify()?;
    if problems.is_empty() {
        println!("All cached files look like valid series.");
        return Ok(());
    }

    println!("Found {} problem file(s):", problems.len());
    for p in &problems {
        println!("  {}: {}", p.symbol, p.reason);
    }

    if !confirm {
        println!();
        println!("Dry run. Pass --confirm to actually delete.");
        return Ok(());
    }

    for p in &problems {
        cache.remove(&p.symbol)?;
        println!("Removed: {}", p.symbol);
    }
    println!(
        "Done. Removed {} file(s); they will be fetched on the next download.",
        problems.len()
    );
    Ok(())
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86_400 {
        format!("{:.1}h", secs as f64 / 3600.0)
    } else {
        format!("{:.1} days", secs as f64 / 86_400.0)
    }
}
