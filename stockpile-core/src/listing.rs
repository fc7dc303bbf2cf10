//! Per-exchange listing files and their normalization.
//!
//! The exchanges publish the same information with slightly different
//! schemas. NASDAQ names its column `Industry` and reports `MarketCap` as a
//! plain number (plus an `ADR TSO` column nobody needs). AMEX and NYSE use a
//! lowercase `industry` column and format market caps as `$2.5B` / `$310.4M`.
//! Everything is normalized into [`ListingRow`].

use crate::error::DataError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Sector assigned to rows whose listing leaves it blank.
pub const UNKNOWN_SECTOR: &str = "Unknown";

/// Cell values treated as missing, following the usual CSV conventions.
const MISSING_VALUES: &[&str] = &["", "n/a", "na", "nan", "null", "none", "#n/a", "-"];

/// A listing exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Nasdaq,
    Amex,
    Nyse,
}

impl Exchange {
    /// All exchanges, in the order their listings are concatenated.
    pub const ALL: [Exchange; 3] = [Exchange::Nasdaq, Exchange::Amex, Exchange::Nyse];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Nasdaq => "nasdaq",
            Exchange::Amex => "amex",
            Exchange::Nyse => "nyse",
        }
    }

    /// File name of this exchange's listing: `companylist_{exchange}.csv`.
    pub fn listing_file_name(&self) -> String {
        format!("companylist_{}.csv", self.as_str())
    }

    /// Column layout of this exchange's listing file.
    pub fn schema(&self) -> ListingSchema {
        match self {
            Exchange::Nasdaq => ListingSchema {
                industry_column: "Industry",
                market_cap: MarketCapFormat::Numeric,
            },
            Exchange::Amex | Exchange::Nyse => ListingSchema {
                industry_column: "industry",
                market_cap: MarketCapFormat::Abbreviated,
            },
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nasdaq" => Ok(Exchange::Nasdaq),
            "amex" => Ok(Exchange::Amex),
            "nyse" => Ok(Exchange::Nyse),
            other => Err(DataError::UnknownExchange(other.to_string())),
        }
    }
}

/// How an exchange formats its `MarketCap` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketCapFormat {
    /// Plain number of dollars, e.g. `2500000000`.
    Numeric,
    /// Dollar string with a magnitude suffix, e.g. `$2.5B` or `$310.4M`.
    Abbreviated,
}

/// Exchange-specific column layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingSchema {
    pub industry_column: &'static str,
    pub market_cap: MarketCapFormat,
}

/// One normalized listing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRow {
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "Name")]
    pub name: Option<String>,
    #[serde(rename = "Exchange")]
    pub exchange: Exchange,
    #[serde(rename = "Sector")]
    pub sector: String,
    #[serde(rename = "MarketCap")]
    pub market_cap: Option<f64>,
    #[serde(rename = "Industry")]
    pub industry: String,
}

impl ListingRow {
    /// Preferred-stock tickers (`BAC^A`) cannot be queried from the provider.
    pub fn is_preferred(&self) -> bool {
        self.symbol.contains('^')
    }
}

pub(crate) fn is_missing(value: &str) -> bool {
    let v = value.trim();
    MISSING_VALUES.iter().any(|m| v.eq_ignore_ascii_case(m))
}

/// Headers that carry no name: blank, or a leftover `Unnamed: N` index column.
fn is_unnamed(header: &str) -> bool {
    let h = header.trim();
    h.is_empty() || h.starts_with("Unnamed")
}

/// Parse a market cap cell according to the exchange's format.
///
/// Missing values yield `Ok(None)`. `$2.5B` is read as `2.5e9`, `$310.4M` as
/// `310.4e6`.
pub fn parse_market_cap(
    raw: &str,
    format: MarketCapFormat,
    symbol: &str,
) -> Result<Option<f64>, DataError> {
    if is_missing(raw) {
        return Ok(None);
    }
    let invalid = || DataError::InvalidMarketCap {
        symbol: symbol.to_string(),
        raw: raw.to_string(),
    };

    let text = raw.trim();
    let value = match format {
        MarketCapFormat::Numeric => text.parse::<f64>().map_err(|_| invalid())?,
        MarketCapFormat::Abbreviated => {
            let body = text.trim_matches('$');
            let (mantissa, exponent) = match body.char_indices().last() {
                Some((i, 'M')) => (&body[..i], "e6"),
                Some((i, 'B')) => (&body[..i], "e9"),
                _ => (body, ""),
            };
            if mantissa.is_empty() || mantissa.contains(['e', 'E']) {
                return Err(invalid());
            }
            // Rewriting the suffix as an exponent keeps the value identical to
            // the literal `2.5e9`, not `2.5 * 1e9`.
            format!("{mantissa}{exponent}")
                .parse::<f64>()
                .map_err(|_| invalid())?
        }
    };

    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    Ok(Some(value))
}

/// Load and normalize `{listing_dir}/companylist_{exchange}.csv`.
pub fn load_listing(listing_dir: &Path, exchange: Exchange) -> Result<Vec<ListingRow>, DataError> {
    let path = listing_dir.join(exchange.listing_file_name());
    let file = File::open(&path).map_err(|source| DataError::ListingUnreadable {
        path: path.clone(),
        source,
    })?;
    let rows = parse_listing(file, exchange)?;
    tracing::debug!(%exchange, rows = rows.len(), path = %path.display(), "loaded listing");
    Ok(rows)
}

/// Normalize a listing read from any source.
///
/// Fails fast on a missing `Symbol`, `Sector` or `MarketCap` column, on any
/// unnamed column that holds data, and on an unparseable market cap. Rows
/// with a blank symbol are skipped.
pub fn parse_listing<R: Read>(reader: R, exchange: Exchange) -> Result<Vec<ListingRow>, DataError> {
    let schema = exchange.schema();
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let find = |name: &str| headers.iter().position(|h| h.trim() == name);
    let require = |name: &str| {
        find(name).ok_or_else(|| DataError::MissingColumn {
            exchange: exchange.to_string(),
            column: name.to_string(),
        })
    };

    let symbol_idx = require("Symbol")?;
    let sector_idx = require("Sector")?;
    let cap_idx = require("MarketCap")?;
    let name_idx = find("Name");
    let industry_idx = find(schema.industry_column).or_else(|| {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case("industry"))
    });
    let unnamed: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| is_unnamed(h))
        .map(|(i, h)| (i, h.to_string()))
        .collect();

    let mut rows = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = record?;

        for (idx, header) in &unnamed {
            if let Some(value) = record.get(*idx).filter(|v| !is_missing(v)) {
                return Err(DataError::UnnamedColumnWithData {
                    exchange: exchange.to_string(),
                    column: if header.is_empty() {
                        format!("#{idx}")
                    } else {
                        header.clone()
                    },
                    row: line + 1,
                    value: value.to_string(),
                });
            }
        }

        let symbol = record.get(symbol_idx).unwrap_or("").trim();
        // Tickers like NAN or NA are real; only a blank cell means no symbol.
        if symbol.is_empty() {
            tracing::debug!(%exchange, row = line + 1, "skipping listing row without a symbol");
            continue;
        }

        let sector = record
            .get(sector_idx)
            .filter(|v| !is_missing(v))
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| UNKNOWN_SECTOR.to_string());
        let market_cap =
            parse_market_cap(record.get(cap_idx).unwrap_or(""), schema.market_cap, symbol)?;
        let industry = industry_idx
            .and_then(|i| record.get(i))
            .filter(|v| !is_missing(v))
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        let name = name_idx
            .and_then(|i| record.get(i))
            .filter(|v| !is_missing(v))
            .map(|v| v.trim().to_string());

        rows.push(ListingRow {
            symbol: symbol.to_string(),
            name,
            exchange,
            sector,
            market_cap,
            industry,
        });
    }

    Ok(rows)
}
