// Continuous updater: periodic REST gap-fill and freshness safety net
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tickerflow_common::{
    ActivityKind, DatabaseActivity, FeedError, Granularity, MetricsCollector, UpdaterConfig,
};

use crate::exchange_rest::ExchangeRestClient;
use crate::hub::HubEvent;
use crate::store::CandleStore;

const RATE_LIMIT_EXTRA_SLEEP: Duration = Duration::from_secs(2);

pub struct ContinuousUpdater {
    store: Arc<CandleStore>,
    rest: Arc<ExchangeRestClient>,
    hub_tx: mpsc::Sender<HubEvent>,
    config: UpdaterConfig,
    metrics: Arc<MetricsCollector>,
}

impl ContinuousUpdater {
    pub fn new(
        store: Arc<CandleStore>,
        rest: Arc<ExchangeRestClient>,
        hub_tx: mpsc::Sender<HubEvent>,
        config: UpdaterConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            rest,
            hub_tx,
            config,
            metrics,
        }
    }

    /// One task per (product, granularity), each on its own poll period.
    /// All tasks stop when the shutdown signal flips.
    pub fn spawn_all(
        self: Arc<Self>,
        products: &[String],
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        if !self.config.enabled {
            return Vec::new();
        }
        let mut handles = Vec::new();
        for product in products {
            for granularity in Granularity::ALL {
                let updater = Arc::clone(&self);
                let product = product.clone();
                let mut shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    let mut interval = tokio::time::interval(granularity.poll_interval());
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = interval.tick() => {
                                updater.tick(&product, granularity).await;
                            }
                            _ = shutdown.changed() => {
                                debug!("Updater for {} {} stopping", product, granularity.label());
                                return;
                            }
                        }
                    }
                }));
            }
        }
        handles
    }

    async fn tick(&self, product: &str, granularity: Granularity) {
        self.emit_activity(DatabaseActivity {
            kind: ActivityKind::FetchStart,
            pair: product.to_string(),
            granularity: granularity.label().to_string(),
            operation: "rest_poll".to_string(),
            count: None,
            latest_price: None,
            error: None,
        })
        .await;

        let now = Utc::now().timestamp();
        let start = now - granularity.seconds() * self.config.lookback_buckets as i64;

        match self.rest.fetch_candles(product, granularity, start, now).await {
            Ok(candles) => {
                self.metrics.record_rest_poll(product, granularity.label(), true);
                let latest_price = candles.last().map(|c| c.close);
                let count = candles.len();
                if let Err(e) = self.upsert_and_prune(product, granularity, &candles).await {
                    warn!(
                        "Store maintenance failed for {} {}: {}",
                        product,
                        granularity.label(),
                        e
                    );
                    self.emit_error(product, granularity, &e.to_string()).await;
                    return;
                }
                self.emit_activity(DatabaseActivity {
                    kind: ActivityKind::StoreComplete,
                    pair: product.to_string(),
                    granularity: granularity.label().to_string(),
                    operation: "rest_poll".to_string(),
                    count: Some(count),
                    latest_price,
                    error: None,
                })
                .await;
            }
            Err(FeedError::RateLimited) => {
                self.metrics.record_rest_poll(product, granularity.label(), false);
                warn!(
                    "Rate limited fetching {} {}; backing off",
                    product,
                    granularity.label()
                );
                self.emit_error(product, granularity, "rate limited").await;
                tokio::time::sleep(RATE_LIMIT_EXTRA_SLEEP).await;
            }
            Err(e) => {
                self.metrics.record_rest_poll(product, granularity.label(), false);
                warn!(
                    "REST poll failed for {} {}: {}",
                    product,
                    granularity.label(),
                    e
                );
                self.emit_error(product, granularity, &e.to_string()).await;
            }
        }
    }

    async fn upsert_and_prune(
        &self,
        product: &str,
        granularity: Granularity,
        candles: &[tickerflow_common::Candle],
    ) -> tickerflow_common::Result<()> {
        let stored = self.store.store(product, granularity, candles).await?;
        if let Some(last) = candles.last() {
            self.store
                .write_checkpoint(product, granularity, last.open_ts, stored)
                .await?;
        }
        let cutoff = Utc::now().timestamp() - granularity.retention_days() * 86_400;
        self.store
            .delete_older_than(product, granularity, cutoff)
            .await?;
        Ok(())
    }

    async fn emit_error(&self, product: &str, granularity: Granularity, message: &str) {
        self.emit_activity(DatabaseActivity {
            kind: ActivityKind::Error,
            pair: product.to_string(),
            granularity: granularity.label().to_string(),
            operation: "rest_poll".to_string(),
            count: None,
            latest_price: None,
            error: Some(message.to_string()),
        })
        .await;
    }

    async fn emit_activity(&self, activity: DatabaseActivity) {
        if self.hub_tx.send(HubEvent::Activity(activity)).await.is_err() {
            debug!("Hub channel closed; dropping activity event");
        }
    }
}
