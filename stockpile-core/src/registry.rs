//! The symbol registry: every exchange's listing concatenated, filtered and
//! deduplicated into one row per symbol.

use crate::error::DataError;
use crate::listing::{load_listing, Exchange, ListingRow};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Which row survives when a symbol is listed on more than one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TieBreak {
    /// Keep the first row in load order (nasdaq, amex, nyse).
    #[default]
    FirstSeen,

    /// Shuffle the concatenated listings before deduplicating, so the kept
    /// row is random. With a seed the outcome is reproducible.
    Shuffled { seed: Option<u64> },
}

/// Deduplicated registry of tradable symbols.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    rows: Vec<ListingRow>,
}

impl Registry {
    /// Build a registry from concatenated listing rows.
    ///
    /// Drops preferred-stock symbols (containing `^`) and keeps one row per
    /// symbol according to `tie_break`.
    pub fn from_rows(mut rows: Vec<ListingRow>, tie_break: TieBreak) -> Self {
        if let TieBreak::Shuffled { seed } = tie_break {
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            rows.shuffle(&mut rng);
        }

        let mut seen = HashSet::new();
        let mut duplicates = 0usize;
        let mut preferred = 0usize;
        let rows: Vec<ListingRow> = rows
            .into_iter()
            .filter(|row| {
                if row.is_preferred() {
                    preferred += 1;
                    return false;
                }
                if !seen.insert(row.symbol.clone()) {
                    duplicates += 1;
                    return false;
                }
                true
            })
            .collect();

        tracing::debug!(
            kept = rows.len(),
            duplicates,
            preferred,
            "built registry"
        );
        Self { rows }
    }

    /// Load every exchange's listing from `listing_dir` and build the registry.
    pub fn load(
        listing_dir: &Path,
        exchanges: &[Exchange],
        tie_break: TieBreak,
    ) -> Result<Self, DataError> {
        let mut all = Vec::new();
        for &exchange in exchanges {
            all.extend(load_listing(listing_dir, exchange)?);
        }
        Ok(Self::from_rows(all, tie_break))
    }

    pub fn rows(&self) -> &[ListingRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Symbols in registry order.
    pub fn symbols(&self) -> Vec<&str> {
        self.rows.iter().map(|r| r.symbol.as_str()).collect()
    }

    pub fn get(&self, symbol: &str) -> Option<&ListingRow> {
        self.rows.iter().find(|r| r.symbol == symbol)
    }

    /// Number of rows retained per exchange.
    pub fn count_by_exchange(&self) -> BTreeMap<Exchange, usize> {
        let mut counts = BTreeMap::new();
        for row in &self.rows {
            *counts.entry(row.exchange).or_insert(0) += 1;
        }
        counts
    }

    /// Write the registry as CSV (`Symbol,Name,Exchange,Sector,MarketCap,Industry`).
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), DataError> {
        let mut wtr = csv::Writer::from_writer(writer);
        for row in &self.rows {
            wtr.serialize(row)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Write the registry CSV to `path`, atomically.
    pub fn save_csv(&self, path: &Path) -> Result<(), DataError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("csv.tmp");
        self.write_csv(fs::File::create(&tmp_path)?)?;
        fs::rename(&tmp_path, path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            DataError::CacheError(format!("atomic rename failed: {e}"))
        })?;
        Ok(())
    }

    /// Read back a registry written by [`Registry::save_csv`].
    pub fn read_csv(path: &Path) -> Result<Self, DataError> {
        let mut rdr = csv::Reader::from_path(path)?;
        let rows = rdr
            .deserialize::<ListingRow>()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rows })
    }
}
