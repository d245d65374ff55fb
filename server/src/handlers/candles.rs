// Candle REST handler with the Redis-then-upstream fallback ladder
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use tickerflow_common::{Candle, Granularity};

use crate::state::AppState;

const DEFAULT_HOURS: i64 = 24;

#[derive(Debug, Deserialize)]
pub struct CandleParams {
    pub hours: Option<i64>,
}

/// Explicit result of the fallback ladder so each rung is observable.
#[derive(Debug, PartialEq)]
pub enum CandleFetchOutcome {
    /// Redis had the range.
    HitCache(Vec<Candle>),
    /// Redis was empty; the upstream REST fetch populated it.
    Fetched(Vec<Candle>),
    /// Both Redis and the upstream fetch came back empty.
    EmptyAfterFetch,
    Failed(String),
}

impl CandleFetchOutcome {
    pub fn candles(self) -> Vec<Candle> {
        match self {
            CandleFetchOutcome::HitCache(candles) | CandleFetchOutcome::Fetched(candles) => candles,
            _ => Vec::new(),
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            CandleFetchOutcome::HitCache(_) => "cache",
            CandleFetchOutcome::Fetched(_) => "upstream",
            CandleFetchOutcome::EmptyAfterFetch => "empty",
            CandleFetchOutcome::Failed(_) => "failed",
        }
    }
}

async fn fetch_with_fallback(
    state: &AppState,
    product: &str,
    granularity: Granularity,
    start_ts: i64,
    end_ts: i64,
) -> CandleFetchOutcome {
    match state
        .store
        .get_range(product, granularity, start_ts, end_ts)
        .await
    {
        Ok(stored) if !stored.is_empty() => return CandleFetchOutcome::HitCache(stored),
        Ok(_) => {}
        Err(e) => return CandleFetchOutcome::Failed(e.to_string()),
    }

    // Redis had nothing for the range: populate it synchronously.
    match state
        .rest
        .fetch_candles(product, granularity, start_ts, end_ts)
        .await
    {
        Ok(fetched) if fetched.is_empty() => CandleFetchOutcome::EmptyAfterFetch,
        Ok(fetched) => {
            if let Err(e) = state.store.store(product, granularity, &fetched).await {
                warn!("Failed to backfill {} {}: {}", product, granularity.label(), e);
            }
            CandleFetchOutcome::Fetched(fetched)
        }
        Err(e) => CandleFetchOutcome::Failed(e.to_string()),
    }
}

/// GET /api/candles/:pair/:granularity?hours=H
pub async fn get_candles(
    Path((pair, granularity_label)): Path<(String, String)>,
    Query(params): Query<CandleParams>,
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(granularity) = Granularity::from_label(&granularity_label) else {
        state.metrics.record_http_request("GET", "/api/candles", 400);
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": format!("unknown granularity {granularity_label:?}"),
            })),
        ));
    };

    let hours = params.hours.unwrap_or(DEFAULT_HOURS).max(1);
    let end_ts = Utc::now().timestamp();
    let start_ts = end_ts - hours * 3600;

    let outcome = fetch_with_fallback(&state, &pair, granularity, start_ts, end_ts).await;
    if let CandleFetchOutcome::Failed(error) = &outcome {
        state.metrics.record_http_request("GET", "/api/candles", 500);
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"success": false, "error": error})),
        ));
    }

    let source = outcome.source();
    let candles = outcome.candles();
    let metadata = state
        .store
        .get_metadata(&pair, granularity)
        .await
        .unwrap_or_default();

    state.metrics.record_http_request("GET", "/api/candles", 200);
    Ok(Json(json!({
        "success": true,
        "pair": pair,
        "granularity": granularity_label,
        "count": candles.len(),
        "source": source,
        "timeRange": {
            "start": start_ts,
            "end": end_ts,
            "hours": hours,
        },
        "metadata": {
            "totalDatabaseCount": metadata.as_ref().map(|m| m.total_candles).unwrap_or(0),
            "storageMetadata": metadata,
        },
        "data": candles,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_ts: i64) -> Candle {
        Candle::seed(open_ts, 100.0, 1.0)
    }

    #[test]
    fn outcome_exposes_candles_and_source() {
        let hit = CandleFetchOutcome::HitCache(vec![candle(0)]);
        assert_eq!(hit.source(), "cache");
        assert_eq!(hit.candles().len(), 1);

        let fetched = CandleFetchOutcome::Fetched(vec![candle(0), candle(60)]);
        assert_eq!(fetched.source(), "upstream");
        assert_eq!(fetched.candles().len(), 2);

        assert_eq!(CandleFetchOutcome::EmptyAfterFetch.source(), "empty");
        assert!(CandleFetchOutcome::EmptyAfterFetch.candles().is_empty());
        assert!(CandleFetchOutcome::Failed("x".into()).candles().is_empty());
    }
}
