//! Stock quote lookup against the stooq CSV endpoint.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

pub const DEFAULT_BASE_URL: &str = "https://stooq.com";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

const SYMBOL_COLUMN: usize = 0;
const CLOSE_COLUMN: usize = 6;
const NO_DATA: &str = "N/D";

#[derive(Debug, thiserror::Error)]
pub enum QuoteError {
    #[error("expected 200 status code, got {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Network(String),

    #[error("malformed quote response: {0}")]
    Malformed(String),

    #[error("no quote available for {0}")]
    NotFound(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Quote {
    pub symbol: String,
    /// Close price exactly as the provider printed it.
    pub price: String,
}

#[async_trait]
pub trait QuoteApi: Send + Sync {
    async fn get_quote(&self, symbol: &str) -> Result<Quote, QuoteError>;
}

pub struct StooqClient {
    client: reqwest::Client,
    base_url: String,
}

impl Default for StooqClient {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL, DEFAULT_TIMEOUT)
    }
}

impl StooqClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("Parlor/1.0")
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn quote_url(&self, symbol: &str) -> Result<reqwest::Url, QuoteError> {
        let mut url = reqwest::Url::parse(&format!("{}/q/l/", self.base_url))
            .map_err(|e| QuoteError::Network(format!("invalid base url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("s", symbol)
            .append_pair("f", "sd2t2ohlcv")
            .append_key_only("h")
            .append_pair("e", "csv");
        Ok(url)
    }
}

#[async_trait]
impl QuoteApi for StooqClient {
    #[instrument(skip(self))]
    async fn get_quote(&self, symbol: &str) -> Result<Quote, QuoteError> {
        let url = self.quote_url(symbol)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| QuoteError::Network(e.to_string()))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(QuoteError::Status(status.as_u16()));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| QuoteError::Network(e.to_string()))?;
        debug!(bytes = body.len(), "quote response received");

        parse_quote(&body, symbol)
    }
}

/// Pick the close price from a stooq CSV body.
///
/// Prefers the row whose symbol matches case-insensitively and falls back to
/// the first data row.
pub fn parse_quote(body: &str, symbol: &str) -> Result<Quote, QuoteError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let mut first: Option<csv::StringRecord> = None;
    let mut matched: Option<csv::StringRecord> = None;
    for record in reader.records() {
        let record = record.map_err(|e| QuoteError::Malformed(e.to_string()))?;
        let is_match = record
            .get(SYMBOL_COLUMN)
            .is_some_and(|s| s.eq_ignore_ascii_case(symbol));
        if is_match {
            matched = Some(record);
            break;
        }
        if first.is_none() {
            first = Some(record);
        }
    }

    let record = matched
        .or(first)
        .ok_or_else(|| QuoteError::Malformed("no data rows".into()))?;

    let row_symbol = record.get(SYMBOL_COLUMN).unwrap_or_default();
    let price = record
        .get(CLOSE_COLUMN)
        .ok_or_else(|| QuoteError::Malformed(format!("row has {} columns", record.len())))?;

    if price.is_empty() || price == NO_DATA {
        return Err(QuoteError::NotFound(symbol.to_string()));
    }

    Ok(Quote {
        symbol: row_symbol.to_string(),
        price: price.to_string(),
    })
}
