//! Alpha Vantage quote source.
//!
//! Queries `{base_url}?function=..&symbol=..&apikey=..&datatype=csv`. The API
//! answers with CSV on success and a JSON object (HTTP 200) when it throttles
//! or does not know the symbol; classification happens in `provider`.

use super::provider::{QuoteSource, RawResponse};
use crate::config::{ApiKey, ProviderConfig};
use crate::error::DataError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co/query";

/// Time series endpoints that support `datatype=csv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SeriesFunction {
    #[serde(rename = "TIME_SERIES_DAILY")]
    Daily,
    #[serde(rename = "TIME_SERIES_DAILY_ADJUSTED")]
    DailyAdjusted,
    #[serde(rename = "TIME_SERIES_WEEKLY")]
    Weekly,
    #[default]
    #[serde(rename = "TIME_SERIES_WEEKLY_ADJUSTED")]
    WeeklyAdjusted,
    #[serde(rename = "TIME_SERIES_MONTHLY")]
    Monthly,
    #[serde(rename = "TIME_SERIES_MONTHLY_ADJUSTED")]
    MonthlyAdjusted,
}

impl SeriesFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeriesFunction::Daily => "TIME_SERIES_DAILY",
            SeriesFunction::DailyAdjusted => "TIME_SERIES_DAILY_ADJUSTED",
            SeriesFunction::Weekly => "TIME_SERIES_WEEKLY",
            SeriesFunction::WeeklyAdjusted => "TIME_SERIES_WEEKLY_ADJUSTED",
            SeriesFunction::Monthly => "TIME_SERIES_MONTHLY",
            SeriesFunction::MonthlyAdjusted => "TIME_SERIES_MONTHLY_ADJUSTED",
        }
    }
}

impl fmt::Display for SeriesFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Blocking Alpha Vantage client.
pub struct AlphaVantageClient {
    client: reqwest::blocking::Client,
    base_url: String,
    function: SeriesFunction,
    api_key: ApiKey,
}

impl AlphaVantageClient {
    pub fn new(
        provider: &ProviderConfig,
        api_key: ApiKey,
        timeout: Duration,
    ) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("stockpile/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DataError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: provider.base_url.clone(),
            function: provider.function,
            api_key,
        })
    }

    pub fn function(&self) -> SeriesFunction {
        self.function
    }

    /// Build the query URL for a symbol.
    pub fn query_url(&self, symbol: &str) -> Result<reqwest::Url, DataError> {
        reqwest::Url::parse_with_params(
            &self.base_url,
            &[
                ("function", self.function.as_str()),
                ("symbol", symbol),
                ("apikey", self.api_key.expose()),
                ("datatype", "csv"),
            ],
        )
        .map_err(|e| DataError::Config(format!("invalid base URL '{}': {e}", self.base_url)))
    }
}

impl QuoteSource for AlphaVantageClient {
    fn name(&self) -> &str {
        "alpha_vantage"
    }

    fn fetch(&self, symbol: &str) -> Result<RawResponse, DataError> {
        let url = self.query_url(symbol)?;
        tracing::debug!(symbol, function = %self.function, "requesting series");

        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| DataError::NetworkUnreachable(format!("{symbol}: {}", e.without_url())))?;

        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp
            .bytes()
            .map_err(|e| DataError::NetworkUnreachable(format!("{symbol}: {}", e.without_url())))?
            .to_vec();

        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> AlphaVantageClient {
        let provider = ProviderConfig {
            base_url: base_url.to_string(),
            ..ProviderConfig::default()
        };
        AlphaVantageClient::new(&provider, ApiKey::new("demo"), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn query_url_carries_all_parameters() {
        let url = client(DEFAULT_BASE_URL).query_url("IBM").unwrap();
        assert_eq!(
            url.as_str(),
            "https://www.alphavantage.co/query?function=TIME_SERIES_WEEKLY_ADJUSTED&symbol=IBM&apikey=demo&datatype=csv"
        );
    }

    #[test]
    fn query_url_encodes_symbol() {
        let url = client(DEFAULT_BASE_URL).query_url("BRK B").unwrap();
        assert!(url.as_str().contains("symbol=BRK+B"));
    }

    #[test]
    fn bad_base_url_is_config_error() {
        let err = client("not a url").query_url("IBM").unwrap_err();
        assert!(matches!(err, DataError::Config(_)));
    }

    #[test]
    fn function_names_match_serde() {
        let f: SeriesFunction = serde_json::from_str("\"TIME_SERIES_DAILY\"").unwrap();
        assert_eq!(f, SeriesFunction::Daily);
        assert_eq!(
            serde_json::to_string(&SeriesFunction::MonthlyAdjusted).unwrap(),
            format!("\"{}\"", SeriesFunction::MonthlyAdjusted)
        );
    }
}
