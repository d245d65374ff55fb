// Multi-granularity OHLCV aggregation over the live trade stream
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tickerflow_common::{
    Candle, CandleEvent, CandleKind, GapEvent, Granularity, MetricsCollector, Trade,
};

use crate::hub::HubEvent;
use crate::store::CandleStore;

#[derive(Debug, Clone)]
pub enum AggregatorEvent {
    Candle(CandleEvent),
    Gap(GapEvent),
}

#[derive(Debug, Default)]
struct BucketState {
    current: Option<Candle>,
    last_emitted_complete_ts: Option<i64>,
}

/// Folds trades into per-granularity OHLCV buckets for one product.
/// Owns all in-memory bucket state; emissions are immutable records.
pub struct CandleAggregator {
    product: String,
    buckets: HashMap<Granularity, BucketState>,
}

impl CandleAggregator {
    pub fn new(product: impl Into<String>) -> Self {
        Self {
            product: product.into(),
            buckets: Granularity::ALL
                .iter()
                .map(|g| (*g, BucketState::default()))
                .collect(),
        }
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    /// Fold one trade into every granularity. Returns completion and gap
    /// events first, then one `incomplete` event per granularity for the
    /// bucket the trade landed in.
    pub fn apply_trade(&mut self, price: f64, size: f64, ts: i64) -> Vec<AggregatorEvent> {
        let mut events = Vec::new();

        for granularity in Granularity::ALL {
            let bucket_ts = granularity.bucket_start(ts);
            let state = self
                .buckets
                .get_mut(&granularity)
                .expect("granularity map is total");

            match &mut state.current {
                None => {
                    state.current = Some(Candle::seed(bucket_ts, price, size));
                }
                Some(current) if current.open_ts == bucket_ts => {
                    current.fold(price, size);
                }
                Some(current) if bucket_ts > current.open_ts => {
                    let finished = *current;
                    // Exactly-once completion per bucket.
                    if state.last_emitted_complete_ts != Some(finished.open_ts) {
                        state.last_emitted_complete_ts = Some(finished.open_ts);
                        events.push(AggregatorEvent::Candle(CandleEvent {
                            product: self.product.clone(),
                            granularity,
                            kind: CandleKind::Complete,
                            candle: finished,
                        }));
                    }
                    let step = granularity.seconds();
                    if bucket_ts - finished.open_ts > step {
                        events.push(AggregatorEvent::Gap(GapEvent {
                            product: self.product.clone(),
                            granularity,
                            first_missing_ts: finished.open_ts + step,
                            count: (bucket_ts - finished.open_ts) / step - 1,
                        }));
                    }
                    state.current = Some(Candle::seed(bucket_ts, price, size));
                }
                Some(current) => {
                    // Late trade for a bucket already completed.
                    debug!(
                        "Dropping late trade for {} {}: ts={} current bucket={}",
                        self.product,
                        granularity.label(),
                        ts,
                        current.open_ts
                    );
                    continue;
                }
            }

            let current = self
                .buckets
                .get(&granularity)
                .and_then(|s| s.current)
                .expect("bucket was just seeded or folded");
            events.push(AggregatorEvent::Candle(CandleEvent {
                product: self.product.clone(),
                granularity,
                kind: CandleKind::Incomplete,
                candle: current,
            }));
        }

        events
    }
}

/// Per-product aggregation task: consumes the trade channel, persists
/// completed candles and forwards every emission to the broadcast hub.
pub async fn run_aggregator(
    mut aggregator: CandleAggregator,
    mut trade_rx: mpsc::Receiver<Trade>,
    hub_tx: mpsc::Sender<HubEvent>,
    store: Arc<CandleStore>,
    metrics: Arc<MetricsCollector>,
) {
    while let Some(trade) = trade_rx.recv().await {
        for event in aggregator.apply_trade(trade.price, trade.size, trade.ts) {
            match event {
                AggregatorEvent::Candle(candle_event) => {
                    let kind = match candle_event.kind {
                        CandleKind::Complete => "complete",
                        CandleKind::Incomplete => "incomplete",
                    };
                    metrics.record_candle_emitted(
                        &candle_event.product,
                        candle_event.granularity.label(),
                        kind,
                    );
                    if candle_event.kind == CandleKind::Complete {
                        if let Err(e) = store
                            .store(
                                &candle_event.product,
                                candle_event.granularity,
                                &[candle_event.candle],
                            )
                            .await
                        {
                            warn!(
                                "Failed to persist {} {} candle: {}",
                                candle_event.product,
                                candle_event.granularity.label(),
                                e
                            );
                        }
                    }
                    if hub_tx.send(HubEvent::Candle(candle_event)).await.is_err() {
                        debug!("Hub channel closed; stopping aggregator");
                        return;
                    }
                }
                AggregatorEvent::Gap(gap) => {
                    warn!(
                        "Candle gap on {} {}: {} missing bucket(s) from {}",
                        gap.product,
                        gap.granularity.label(),
                        gap.count,
                        gap.first_missing_ts
                    );
                    metrics.record_candle_gap(
                        &gap.product,
                        gap.granularity.label(),
                        gap.count.max(0) as u64,
                    );
                }
            }
        }
    }
    debug!("Trade channel for {} closed", aggregator.product());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles_for(
        events: &[AggregatorEvent],
        granularity: Granularity,
    ) -> Vec<(CandleKind, Candle)> {
        events
            .iter()
            .filter_map(|e| match e {
                AggregatorEvent::Candle(c) if c.granularity == granularity => {
                    Some((c.kind, c.candle))
                }
                _ => None,
            })
            .collect()
    }

    fn gaps_for(events: &[AggregatorEvent], granularity: Granularity) -> Vec<GapEvent> {
        events
            .iter()
            .filter_map(|e| match e {
                AggregatorEvent::Gap(g) if g.granularity == granularity => Some(g.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn two_bucket_aggregation() {
        // Trades (100,1,t=10) (101,2,t=30) (99,1,t=55) close the first
        // minute bucket when (102,1,t=65) arrives.
        let mut agg = CandleAggregator::new("BTC-USD");
        agg.apply_trade(100.0, 1.0, 10);
        agg.apply_trade(101.0, 2.0, 30);
        agg.apply_trade(99.0, 1.0, 55);
        let events = agg.apply_trade(102.0, 1.0, 65);

        let minute = candles_for(&events, Granularity::OneMinute);
        assert_eq!(minute.len(), 2);

        let (kind, complete) = minute[0];
        assert_eq!(kind, CandleKind::Complete);
        assert_eq!(complete.open_ts, 0);
        assert_eq!(complete.open, 100.0);
        assert_eq!(complete.high, 101.0);
        assert_eq!(complete.low, 99.0);
        assert_eq!(complete.close, 99.0);
        assert_eq!(complete.volume, 4.0);

        let (kind, incomplete) = minute[1];
        assert_eq!(kind, CandleKind::Incomplete);
        assert_eq!(incomplete.open_ts, 60);
        assert_eq!(incomplete.open, 102.0);
        assert_eq!(incomplete.volume, 1.0);

        assert!(gaps_for(&events, Granularity::OneMinute).is_empty());
    }

    #[test]
    fn every_fold_emits_an_incomplete() {
        let mut agg = CandleAggregator::new("BTC-USD");
        let events = agg.apply_trade(100.0, 1.0, 10);
        // One incomplete per granularity, no completions yet.
        assert_eq!(events.len(), Granularity::ALL.len());
        for g in Granularity::ALL {
            let candles = candles_for(&events, g);
            assert_eq!(candles.len(), 1);
            assert_eq!(candles[0].0, CandleKind::Incomplete);
            assert_eq!(candles[0].1.open_ts, g.bucket_start(10));
        }
    }

    #[test]
    fn gap_detection() {
        // Bucket at 0 completes when t=185 arrives; buckets 60 and 120 are
        // missing.
        let mut agg = CandleAggregator::new("BTC-USD");
        agg.apply_trade(100.0, 1.0, 10);
        let events = agg.apply_trade(101.0, 1.0, 185);

        let gaps = gaps_for(&events, Granularity::OneMinute);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].first_missing_ts, 60);
        assert_eq!(gaps[0].count, 2);

        let minute = candles_for(&events, Granularity::OneMinute);
        assert_eq!(minute[0].0, CandleKind::Complete);
        assert_eq!(minute[0].1.open_ts, 0);
        assert_eq!(minute[1].0, CandleKind::Incomplete);
        assert_eq!(minute[1].1.open_ts, 180);
    }

    #[test]
    fn adjacent_buckets_emit_no_gap() {
        let mut agg = CandleAggregator::new("BTC-USD");
        agg.apply_trade(100.0, 1.0, 10);
        let events = agg.apply_trade(101.0, 1.0, 65);
        assert!(gaps_for(&events, Granularity::OneMinute).is_empty());
    }

    #[test]
    fn late_trades_are_dropped() {
        let mut agg = CandleAggregator::new("BTC-USD");
        agg.apply_trade(100.0, 1.0, 10);
        agg.apply_trade(102.0, 1.0, 65);
        // t=30 belongs to the completed bucket at 0; nothing for 1m.
        let events = agg.apply_trade(50.0, 1.0, 30);
        let minute = candles_for(&events, Granularity::OneMinute);
        assert!(minute.is_empty());
        // The 5m bucket is still current at 0, so that granularity folds it.
        let five = candles_for(&events, Granularity::FiveMinutes);
        assert_eq!(five.len(), 1);
        assert_eq!(five[0].1.low, 50.0);
    }

    #[test]
    fn completion_is_monotonic_and_deduplicated() {
        let mut agg = CandleAggregator::new("BTC-USD");
        let mut completions = Vec::new();
        let trades = [
            (100.0, 1.0, 5),
            (101.0, 1.0, 65),
            (102.0, 1.0, 125),
            (103.0, 1.0, 250),
            (104.0, 1.0, 310),
        ];
        for (price, size, ts) in trades {
            for event in agg.apply_trade(price, size, ts) {
                if let AggregatorEvent::Candle(c) = event {
                    if c.granularity == Granularity::OneMinute && c.kind == CandleKind::Complete {
                        completions.push(c.candle.open_ts);
                    }
                }
            }
        }
        let mut sorted = completions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(completions, sorted, "completions must be strictly increasing");
    }

    #[test]
    fn ohlcv_invariants_hold_for_random_folds() {
        let mut agg = CandleAggregator::new("BTC-USD");
        // Deterministic pseudo-random walk.
        let mut price = 1000.0_f64;
        let mut seed = 0x2545f4914f6cdd1d_u64;
        for i in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            price = (price + ((seed % 200) as f64 - 100.0) / 10.0).max(1.0);
            let size = ((seed % 90) + 10) as f64 / 100.0;
            for event in agg.apply_trade(price, size, i * 7) {
                if let AggregatorEvent::Candle(c) = event {
                    let k = c.candle;
                    assert!(k.low <= k.open.min(k.close));
                    assert!(k.high >= k.open.max(k.close));
                    assert!(k.volume >= 0.0);
                    assert_eq!(k.open_ts, c.granularity.bucket_start(k.open_ts));
                }
            }
        }
    }
}
