//! TwelveData REST client.
//!
//! TwelveData answers every endpoint with either the payload or an error
//! object `{"status":"error","code":...,"message":...}` (often with HTTP 200),
//! so every response is checked for that shape before parsing. All prices
//! arrive as decimal strings.

use crate::error::{LedgerError, Result};
use crate::services::QuoteProvider;
use crate::types::Quote;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

pub const TWELVE_DATA_REST_URL: &str = "https://api.twelvedata.com";

/// TwelveData REST client.
pub struct TwelveDataClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl TwelveDataClient {
    pub fn new(api_key: String, base_url: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .query(&[("apikey", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| LedgerError::UpstreamUnavailable(format!("{path}: {e}")))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| LedgerError::UpstreamUnavailable(format!("{path}: invalid body: {e}")))?;
        check_error(path, &body)?;
        Ok(body)
    }
}

#[async_trait]
impl QuoteProvider for TwelveDataClient {
    async fn quote(&self, symbol: &str) -> Result<Quote> {
        let body = self.get_json("quote", &[("symbol", symbol)]).await?;
        let quote = parse_quote(&body)?;
        debug!("HTTP quote {} = {}", symbol, quote.price);
        Ok(quote)
    }

    async fn historical_close(&self, symbol: &str, at_or_before_ms: i64) -> Result<Decimal> {
        let end_date = format_end_date(at_or_before_ms);
        let body = self
            .get_json(
                "time_series",
                &[
                    ("symbol", symbol),
                    ("interval", "1min"),
                    ("outputsize", "1"),
                    ("timezone", "UTC"),
                    ("end_date", end_date.as_str()),
                ],
            )
            .await?;
        parse_time_series_close(&body)
    }

    async fn usd_rate(&self, currency: &str) -> Result<Decimal> {
        let pair = format!("{}/USD", currency.to_uppercase());
        let body = self.get_json("price", &[("symbol", pair.as_str())]).await?;
        decimal_field(&body, "price")
    }
}

fn check_error(path: &str, body: &Value) -> Result<()> {
    if body.get("status").and_then(Value::as_str) == Some("error") {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(LedgerError::UpstreamUnavailable(format!("{path}: {message}")));
    }
    Ok(())
}

/// Read a field that TwelveData sends as a decimal string (or, rarely, a number).
fn decimal_field(body: &Value, field: &str) -> Result<Decimal> {
    let value = body
        .get(field)
        .ok_or_else(|| LedgerError::UpstreamUnavailable(format!("missing field {field}")))?;
    let parsed = match value {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    };
    match parsed {
        Some(price) if price > Decimal::ZERO => Ok(price),
        _ => Err(LedgerError::UpstreamUnavailable(format!(
            "unusable {field}: {value}"
        ))),
    }
}

pub(crate) fn parse_quote(body: &Value) -> Result<Quote> {
    check_error("quote", body)?;
    let price = decimal_field(body, "close")?;
    // Quote timestamps are unix seconds
    let timestamp = body
        .get("timestamp")
        .and_then(Value::as_i64)
        .map(|s| s * 1000)
        .unwrap_or_else(|| Utc::now().timestamp_millis());
    Ok(Quote::new(price, timestamp))
}

pub(crate) fn parse_time_series_close(body: &Value) -> Result<Decimal> {
    check_error("time_series", body)?;
    let first = body
        .get("values")
        .and_then(Value::as_array)
        .and_then(|values| values.first())
        .ok_or_else(|| LedgerError::UpstreamUnavailable("time_series: no data found".to_string()))?;
    decimal_field(first, "close")
}

fn format_end_date(ts_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .unwrap_or_default()
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_parse_quote() {
        let body = json!({
            "symbol": "BTC/USD",
            "close": "67012.50000",
            "timestamp": 1_700_000_000
        });
        let quote = parse_quote(&body).unwrap();
        assert_eq!(quote.price, dec!(67012.5));
        assert_eq!(quote.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_error_payload_is_unavailable() {
        let body = json!({"code": 429, "message": "You have run out of API credits", "status": "error"});
        let err = parse_quote(&body).unwrap_err();
        assert!(matches!(err, LedgerError::UpstreamUnavailable(ref m) if m.contains("API credits")));
    }

    #[test]
    fn test_parse_time_series() {
        let body = json!({
            "meta": {"symbol": "EUR/USD", "interval": "1min"},
            "values": [{"datetime": "2024-03-01 12:00:00", "close": "1.08345"}],
            "status": "ok"
        });
        assert_eq!(parse_time_series_close(&body).unwrap(), dec!(1.08345));

        let empty = json!({"values": [], "status": "ok"});
        assert!(parse_time_series_close(&empty).is_err());
    }

    #[test]
    fn test_rejects_zero_price() {
        let body = json!({"close": "0"});
        assert!(parse_quote(&body).is_err());
    }

    #[test]
    fn test_end_date_format() {
        assert_eq!(format_end_date(1_709_294_400_000), "2024-03-01 12:00:00");
    }
}
