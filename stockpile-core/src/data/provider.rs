//! Quote source trait and response classification.
//!
//! The QuoteSource trait abstracts over the remote API so the downloader can
//! be driven by a scripted source in tests. A source returns the raw HTTP
//! response; deciding whether it is usable data is done here, once.

use crate::error::DataError;

/// A raw response from a quote source, kept byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// What a response turned out to contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Tabular data, safe to cache.
    Csv,
    /// The provider refused (throttling, unknown symbol, bad key).
    Rejected { message: String },
}

impl RawResponse {
    /// A 200 response with a CSV body.
    pub fn csv(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: Some("application/x-download".to_string()),
            body: body.into(),
        }
    }

    /// A 200 response with a JSON body, which is how the provider reports
    /// throttling and invalid symbols.
    pub fn json(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: Some("application/json".to_string()),
            body: body.into(),
        }
    }

    /// Classify the response.
    ///
    /// A non-2xx status or a JSON content type decides immediately. Otherwise
    /// the body is sniffed: data starts with a CSV header, errors with `{`.
    pub fn classify(&self) -> Payload {
        if !(200..300).contains(&self.status) {
            return Payload::Rejected {
                message: error_message(&self.body)
                    .unwrap_or_else(|| format!("HTTP {}", self.status)),
            };
        }

        let json_type = self
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
        if json_type {
            return Payload::Rejected {
                message: error_message(&self.body)
                    .unwrap_or_else(|| "JSON response instead of CSV".to_string()),
            };
        }

        sniff(&self.body)
    }
}

/// Decide from the body alone, for files already on disk.
pub fn sniff(body: &[u8]) -> Payload {
    let body = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);
    match body.iter().find(|b| !b.is_ascii_whitespace()) {
        None => Payload::Rejected {
            message: "empty response".to_string(),
        },
        Some(b'{') => Payload::Rejected {
            message: error_message(body).unwrap_or_else(|| "JSON error object".to_string()),
        },
        Some(_) => Payload::Csv,
    }
}

/// Pull the human-readable message out of a JSON error object.
///
/// The provider uses `Note` for throttling, `Error Message` for bad symbols
/// and `Information` for key problems.
fn error_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let obj = value.as_object()?;
    ["Error Message", "Note", "Information"]
        .iter()
        .find_map(|k| obj.get(*k))
        .or_else(|| obj.values().find(|v| v.is_string()))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// A source of per-symbol time series.
///
/// Implementations only fetch; caching and pacing live in the downloader.
pub trait QuoteSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Fetch the raw time series response for one symbol.
    fn fetch(&self, symbol: &str) -> Result<RawResponse, DataError>;
}
