// Health check handler
use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let redis_healthy = state.redis.is_connected().await;

    let response = json!({
        "status": "ok",
        "service": "tickerflow-server",
        "version": env!("CARGO_PKG_VERSION"),
        "state": state.lifecycle.get().as_str(),
        "timestamp": chrono::Utc::now().timestamp(),
        "uptime_secs": state.metrics.uptime_secs(),
        "memory": {
            "rss_bytes": resident_set_bytes(),
        },
        "upstream": {
            "state": state.upstream_health.state().as_str(),
            "last_message_age_secs": state.upstream_health.last_message_age_secs(),
        },
        "subscriptions": {
            "clients": state.registry.client_count(),
            "products": state.registry.product_count(),
            "total": state.registry.subscription_count(),
        },
        "components": {
            "redis": if redis_healthy { "healthy" } else { "unhealthy" },
        },
    });

    state.metrics.record_http_request("GET", "/health", 200);
    Json(response)
}

/// Resident set size from procfs; zero where unavailable.
fn resident_set_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|statm| {
            statm
                .split_whitespace()
                .nth(1)
                .and_then(|pages| pages.parse::<u64>().ok())
        })
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}
