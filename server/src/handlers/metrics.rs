// Prometheus metrics endpoint
use axum::extract::State;

use crate::state::AppState;

pub async fn prometheus_metrics(State(state): State<AppState>) -> String {
    state.prometheus.render()
}
