// Metrics collection for tickerflow services
use metrics::{counter, gauge, histogram};
use std::time::Instant;

pub struct MetricsCollector {
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    // Upstream feed metrics
    pub fn record_trade_processed(&self, product: &str) {
        counter!("trades_processed_total", "product" => product.to_string()).increment(1);
    }

    pub fn record_upstream_message(&self, channel: &str) {
        counter!("upstream_messages_total", "channel" => channel.to_string()).increment(1);
    }

    pub fn record_upstream_decode_error(&self) {
        counter!("upstream_decode_errors_total").increment(1);
    }

    pub fn record_upstream_connection_status(&self, connected: bool) {
        gauge!("upstream_connected").set(if connected { 1.0 } else { 0.0 });
    }

    pub fn record_upstream_reconnection(&self) {
        counter!("upstream_reconnections_total").increment(1);
    }

    // Candle pipeline metrics
    pub fn record_candle_emitted(&self, product: &str, granularity: &str, kind: &str) {
        counter!("candles_emitted_total",
            "product" => product.to_string(),
            "granularity" => granularity.to_string(),
            "kind" => kind.to_string())
        .increment(1);
    }

    pub fn record_candle_gap(&self, product: &str, granularity: &str, missing: u64) {
        counter!("candle_gap_buckets_total",
            "product" => product.to_string(),
            "granularity" => granularity.to_string())
        .increment(missing);
    }

    // Redis metrics
    pub fn record_redis_operation(&self, operation: &str, success: bool) {
        let status = if success { "success" } else { "error" };
        counter!("redis_operations_total",
            "operation" => operation.to_string(),
            "status" => status.to_string())
        .increment(1);
    }

    pub fn record_redis_latency(&self, latency_ms: f64, operation: &str) {
        histogram!("redis_operation_latency_ms", "operation" => operation.to_string())
            .record(latency_ms);
    }

    // Local client metrics
    pub fn record_client_connected(&self, count: usize) {
        gauge!("clients_connected").set(count as f64);
    }

    pub fn record_client_frame_sent(&self, frame_type: &str) {
        counter!("client_frames_sent_total", "type" => frame_type.to_string()).increment(1);
    }

    pub fn record_client_frames_dropped(&self, reason: &str, count: u64) {
        counter!("client_frames_dropped_total", "reason" => reason.to_string()).increment(count);
    }

    pub fn record_broadcast_throttled(&self) {
        counter!("broadcast_throttled_total").increment(1);
    }

    // REST poller metrics
    pub fn record_rest_poll(&self, product: &str, granularity: &str, success: bool) {
        let status = if success { "success" } else { "error" };
        counter!("rest_polls_total",
            "product" => product.to_string(),
            "granularity" => granularity.to_string(),
            "status" => status.to_string())
        .increment(1);
    }

    // HTTP API metrics
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16) {
        counter!("http_requests_total",
            "method" => method.to_string(),
            "path" => path.to_string(),
            "status" => status_code.to_string())
        .increment(1);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
