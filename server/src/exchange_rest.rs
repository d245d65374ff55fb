// Authenticated REST access to the exchange candle endpoint
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use tickerflow_common::{Candle, FeedError, Granularity, Result};

use crate::auth::TokenMinter;

#[derive(Debug, Deserialize)]
struct CandleResponse {
    candles: Vec<RawCandle>,
}

#[derive(Debug, Deserialize)]
struct RawCandle {
    start: String,
    low: String,
    high: String,
    open: String,
    close: String,
    volume: String,
}

/// REST client with a minimum inter-request interval shared across callers.
pub struct ExchangeRestClient {
    http: reqwest::Client,
    base_url: String,
    minter: Option<Arc<TokenMinter>>,
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl ExchangeRestClient {
    pub fn new(
        base_url: impl Into<String>,
        minter: Option<Arc<TokenMinter>>,
        min_interval_ms: u64,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            minter,
            last_request: Mutex::new(None),
            min_interval: Duration::from_millis(min_interval_ms),
        }
    }

    async fn rate_limit(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Fetch candles for `[start_ts, end_ts]`, sorted ascending by
    /// `open_ts`. A 429 maps to `FeedError::RateLimited`.
    pub async fn fetch_candles(
        &self,
        product: &str,
        granularity: Granularity,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<Vec<Candle>> {
        self.rate_limit().await;

        let path = format!("/api/v3/brokerage/market/products/{product}/candles");
        let mut request = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(&[
                ("start", start_ts.to_string()),
                ("end", end_ts.to_string()),
                ("granularity", granularity.rest_name().to_string()),
            ]);

        if let Some(minter) = &self.minter {
            let host = self
                .base_url
                .trim_start_matches("https://")
                .trim_start_matches("http://");
            let token = minter.rest_token("GET", host, &path)?;
            request = request.header("Authorization", format!("Bearer {}", token.value));
        }

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(FeedError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::ServiceUnavailable(format!(
                "candle endpoint returned {status}: {body}"
            )));
        }

        let data: CandleResponse = response.json().await?;
        let mut candles = parse_candles(data.candles);
        candles.sort_by_key(|c| c.open_ts);
        debug!(
            "Fetched {} candle(s) for {} {}",
            candles.len(),
            product,
            granularity.label()
        );
        Ok(candles)
    }
}

fn parse_candles(raw: Vec<RawCandle>) -> Vec<Candle> {
    raw.into_iter()
        .filter_map(|rc| {
            Some(Candle {
                open_ts: rc.start.parse().ok()?,
                open: rc.open.parse().ok()?,
                high: rc.high.parse().ok()?,
                low: rc.low.parse().ok()?,
                close: rc.close.parse().ok()?,
                volume: rc.volume.parse().ok()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(start: &str) -> RawCandle {
        RawCandle {
            start: start.into(),
            low: "99".into(),
            high: "101".into(),
            open: "100".into(),
            close: "100.5".into(),
            volume: "12.5".into(),
        }
    }

    #[test]
    fn parses_string_fields() {
        let candles = parse_candles(vec![raw("1700000000")]);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].open_ts, 1_700_000_000);
        assert_eq!(candles[0].open, 100.0);
        assert_eq!(candles[0].close, 100.5);
        assert_eq!(candles[0].volume, 12.5);
    }

    #[test]
    fn unparseable_rows_are_skipped() {
        let mut bad = raw("1700000000");
        bad.open = "not-a-number".into();
        let candles = parse_candles(vec![bad, raw("1700000060")]);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].open_ts, 1_700_000_060);
    }
}
