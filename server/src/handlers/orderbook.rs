// Order-book REST handlers
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

use crate::orderbook::FullBook;
use crate::state::AppState;

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_TOP_COUNT: usize = 50;
const DEFAULT_TOP_COUNT: usize = 10;
const DEFAULT_DEPTH_PERCENT: f64 = 1.0;

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    pub depth: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct TopParams {
    pub count: Option<usize>,
}

fn book_payload(book: &FullBook, cached: bool) -> Value {
    json!({
        "success": true,
        "data": {
            "bids": book.bids,
            "asks": book.asks,
            "metadata": book.metadata,
        },
        "cached": cached,
    })
}

fn failure(error: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "error": error.to_string()})),
    )
}

/// GET /api/orderbook/:product returns the full book, or an empty payload
/// if Redis does not answer within two seconds.
pub async fn get_orderbook(
    Path(product): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state.metrics.record_http_request("GET", "/api/orderbook", 200);

    match tokio::time::timeout(SNAPSHOT_TIMEOUT, state.book.get_full(&product)).await {
        Ok(Ok(book)) => {
            if book.bids.is_empty() && book.asks.is_empty() {
                // Warm hub cache can still hydrate the page.
                if state.config.features.book_cache_enabled {
                    if let Some(snapshot) = state
                        .hub
                        .cached_snapshots()
                        .into_iter()
                        .find(|s| {
                            s.get("product_id").and_then(|p| p.as_str()) == Some(product.as_str())
                        })
                    {
                        return Ok(Json(json!({
                            "success": true,
                            "data": {
                                "bids": snapshot.get("bids"),
                                "asks": snapshot.get("asks"),
                                "metadata": Value::Null,
                            },
                            "cached": true,
                        })));
                    }
                }
            }
            Ok(Json(book_payload(&book, false)))
        }
        Ok(Err(e)) => Err(failure(e)),
        Err(_) => {
            warn!("Order book read for {} timed out", product);
            Ok(Json(book_payload(&FullBook::empty(), false)))
        }
    }
}

/// GET /api/orderbook/:product/range?depth=N returns levels within N
/// percent of the mid price.
pub async fn get_orderbook_range(
    Path(product): Path<String>,
    Query(params): Query<RangeParams>,
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state
        .metrics
        .record_http_request("GET", "/api/orderbook/range", 200);

    let book = state.book.get_full(&product).await.map_err(failure)?;
    let Some(mid) = book.mid() else {
        return Ok(Json(book_payload(&FullBook::empty(), false)));
    };
    let depth = params.depth.unwrap_or(DEFAULT_DEPTH_PERCENT).max(0.0);
    let (min, max) = range_around_mid(mid, depth);
    let ranged = state
        .book
        .get_range(&product, min, max)
        .await
        .map_err(failure)?;
    Ok(Json(json!({
        "success": true,
        "data": {
            "bids": ranged.bids,
            "asks": ranged.asks,
            "metadata": ranged.metadata,
            "mid": mid,
        },
        "cached": false,
    })))
}

/// GET /api/orderbook/:product/top?count=N (N ≤ 50)
pub async fn get_orderbook_top(
    Path(product): Path<String>,
    Query(params): Query<TopParams>,
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state
        .metrics
        .record_http_request("GET", "/api/orderbook/top", 200);

    let count = clamp_top_count(params.count);
    let book = state.book.get_top(&product, count).await.map_err(failure)?;
    Ok(Json(book_payload(&book, false)))
}

pub fn clamp_top_count(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_TOP_COUNT).clamp(1, MAX_TOP_COUNT)
}

pub fn range_around_mid(mid: f64, depth_percent: f64) -> (f64, f64) {
    let span = mid * depth_percent / 100.0;
    (mid - span, mid + span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_count_is_clamped() {
        assert_eq!(clamp_top_count(None), 10);
        assert_eq!(clamp_top_count(Some(5)), 5);
        assert_eq!(clamp_top_count(Some(0)), 1);
        assert_eq!(clamp_top_count(Some(500)), 50);
    }

    #[test]
    fn range_brackets_the_mid() {
        let (min, max) = range_around_mid(100.0, 1.0);
        assert_eq!(min, 99.0);
        assert_eq!(max, 101.0);
        let (min, max) = range_around_mid(100.0, 0.0);
        assert_eq!(min, 100.0);
        assert_eq!(max, 100.0);
    }
}
