//! Parsed view of a cached time series file.

use crate::error::DataError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One row of a provider time series.
///
/// Adjusted endpoints add `adjusted close` and `dividend amount` (and, for
/// daily, `split coefficient`); plain endpoints leave them `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesBar {
    pub timestamp: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adjusted_close: Option<f64>,
    pub volume: u64,
    pub dividend_amount: Option<f64>,
    pub split_coefficient: Option<f64>,
}

/// A symbol's full series, oldest bar first.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub symbol: String,
    pub bars: Vec<SeriesBar>,
}

/// Column positions resolved from the header row.
struct Columns {
    timestamp: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: usize,
    adjusted_close: Option<usize>,
    dividend_amount: Option<usize>,
    split_coefficient: Option<usize>,
}

impl Columns {
    fn resolve(headers: &csv::StringRecord, symbol: &str) -> Result<Self, DataError> {
        let normalized: Vec<String> = headers
            .iter()
            .map(|h| h.trim().to_ascii_lowercase().replace('_', " "))
            .collect();
        let find = |name: &str| normalized.iter().position(|h| h == name);
        let require = |name: &str| {
            find(name).ok_or_else(|| DataError::MalformedSeries {
                symbol: symbol.to_string(),
                reason: format!("missing '{name}' column"),
            })
        };

        Ok(Self {
            timestamp: require("timestamp")?,
            open: require("open")?,
            high: require("high")?,
            low: require("low")?,
            close: require("close")?,
            volume: require("volume")?,
            adjusted_close: find("adjusted close"),
            dividend_amount: find("dividend amount"),
            split_coefficient: find("split coefficient"),
        })
    }
}

impl TimeSeries {
    /// Parse a CSV body as returned by the provider.
    pub fn parse(symbol: &str, body: &[u8]) -> Result<Self, DataError> {
        let malformed = |reason: String| DataError::MalformedSeries {
            symbol: symbol.to_string(),
            reason,
        };

        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(body);
        let columns = Columns::resolve(rdr.headers()?, symbol)?;

        let mut bars = Vec::new();
        for (i, record) in rdr.records().enumerate() {
            let record = record?;
            let row = i + 1;
            let field = |idx: usize| record.get(idx).unwrap_or("");
            let num = |idx: usize, name: &str| {
                field(idx)
                    .parse::<f64>()
                    .map_err(|_| malformed(format!("row {row}: bad {name} '{}'", field(idx))))
            };
            let opt_num = |idx: Option<usize>| idx.and_then(|i| field(i).parse::<f64>().ok());

            let ts = field(columns.timestamp);
            let date_part = ts.split_whitespace().next().unwrap_or("");
            let timestamp = NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
                .map_err(|_| malformed(format!("row {row}: bad timestamp '{ts}'")))?;
            let volume = field(columns.volume)
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .ok_or_else(|| {
                    malformed(format!("row {row}: bad volume '{}'", field(columns.volume)))
                })? as u64;

            bars.push(SeriesBar {
                timestamp,
                open: num(columns.open, "open")?,
                high: num(columns.high, "high")?,
                low: num(columns.low, "low")?,
                close: num(columns.close, "close")?,
                adjusted_close: opt_num(columns.adjusted_close),
                volume,
                dividend_amount: opt_num(columns.dividend_amount),
                split_coefficient: opt_num(columns.split_coefficient),
            });
        }

        bars.sort_by_key(|b| b.timestamp);
        Ok(Self {
            symbol: symbol.to_string(),
            bars,
        })
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.bars.first().map(|b| b.timestamp)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.bars.last().map(|b| b.timestamp)
    }

    /// Adjusted close where the endpoint provides it, close otherwise.
    pub fn closes(&self) -> Vec<f64> {
        self.bars
            .iter()
            .map(|b| b.adjusted_close.unwrap_or(b.close))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEEKLY_ADJUSTED: &str = "\
timestamp,open,high,low,close,adjusted close,volume,dividend amount
2024-01-12,185.0,187.1,183.6,185.9,185.2,246000000,0.0000
2024-01-05,187.2,188.4,181.2,181.2,180.5,312000000,0.0000
";

    const DAILY: &str = "\
timestamp,open,high,low,close,volume
2024-01-03,10.0,11.0,9.5,10.5,1000
";

    #[test]
    fn parses_adjusted_series_oldest_first() {
        let series = TimeSeries::parse("AAPL", WEEKLY_ADJUSTED.as_bytes()).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(
            series.first_date(),
            NaiveDate::from_ymd_opt(2024, 1, 5)
        );
        assert_eq!(series.bars[1].adjusted_close, Some(185.2));
        assert_eq!(series.bars[1].dividend_amount, Some(0.0));
        assert_eq!(series.bars[1].volume, 246_000_000);
        assert_eq!(series.closes(), vec![180.5, 185.2]);
    }

    #[test]
    fn parses_plain_series() {
        let series = TimeSeries::parse("X", DAILY.as_bytes()).unwrap();
        assert_eq!(series.bars[0].adjusted_close, None);
        assert_eq!(series.closes(), vec![10.5]);
    }

    #[test]
    fn missing_timestamp_column_is_malformed() {
        let err = TimeSeries::parse("X", b"date,open,high,low,close,volume\n").unwrap_err();
        assert!(err.to_string().contains("timestamp"));
    }

    #[test]
    fn bad_number_names_row() {
        let body = "timestamp,open,high,low,close,volume\n2024-01-03,x,11,9,10,5\n";
        let err = TimeSeries::parse("X", body.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn header_only_is_empty_series() {
        let series = TimeSeries::parse("X", b"timestamp,open,high,low,close,volume\n").unwrap();
        assert!(series.is_empty());
        assert_eq!(series.last_date(), None);
    }
}
