// Server time handler used by the chart frontend for clock skew
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

pub async fn get_time() -> Json<Value> {
    let now = Utc::now();
    Json(json!({
        "timestamp_ms": now.timestamp_millis(),
        "unixTime_s": now.timestamp(),
        "iso": now.to_rfc3339(),
    }))
}
