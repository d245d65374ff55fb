// Application state shared with the HTTP handlers
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use tickerflow_common::{Config, MetricsCollector};

use crate::bot_bridge::BotBridge;
use crate::exchange_rest::ExchangeRestClient;
use crate::hub::BroadcastHub;
use crate::orderbook::BookEngine;
use crate::redis_conn::RedisHandle;
use crate::registry::SubscriptionRegistry;
use crate::store::CandleStore;
use crate::upstream::{UpstreamCommand, UpstreamHealth};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Draining => "draining",
            ProcessState::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<ProcessState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::Starting),
        }
    }

    pub fn set(&self, state: ProcessState) {
        *self.state.lock().expect("lifecycle poisoned") = state;
    }

    pub fn get(&self) -> ProcessState {
        *self.state.lock().expect("lifecycle poisoned")
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Explicitly constructed in main and cloned into every handler; no
/// load-time singletons.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SubscriptionRegistry>,
    pub hub: Arc<BroadcastHub>,
    pub book: Arc<BookEngine>,
    pub store: Arc<CandleStore>,
    pub rest: Arc<ExchangeRestClient>,
    pub redis: RedisHandle,
    pub upstream_tx: mpsc::Sender<UpstreamCommand>,
    pub upstream_health: Arc<UpstreamHealth>,
    pub bot: BotBridge,
    pub metrics: Arc<MetricsCollector>,
    pub prometheus: PrometheusHandle,
    pub lifecycle: Arc<Lifecycle>,
}
