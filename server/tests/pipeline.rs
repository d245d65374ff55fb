// End-to-end checks for the aggregation and fan-out pipeline, exercised
// through the public component APIs without Redis or network.
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use tickerflow_common::{Candle, CandleEvent, CandleKind, Granularity, MetricsCollector};
use tickerflow_server::aggregator::{AggregatorEvent, CandleAggregator};
use tickerflow_server::hub::{
    BroadcastHub, ClientHandle, ClientQueue, HubEvent, CLOSE_GOING_AWAY,
};
use tickerflow_server::registry::SubscriptionRegistry;

fn one_minute_candles(events: &[AggregatorEvent]) -> Vec<(CandleKind, Candle)> {
    events
        .iter()
        .filter_map(|e| match e {
            AggregatorEvent::Candle(c) if c.granularity == Granularity::OneMinute => {
                Some((c.kind, c.candle))
            }
            _ => None,
        })
        .collect()
}

#[test]
fn aggregation_scenario_one() {
    // Four trades spanning two minute buckets.
    let mut agg = CandleAggregator::new("BTC-USD");
    agg.apply_trade(100.0, 1.0, 10);
    agg.apply_trade(101.0, 2.0, 30);
    agg.apply_trade(99.0, 1.0, 55);
    let events = agg.apply_trade(102.0, 1.0, 65);

    let candles = one_minute_candles(&events);
    assert_eq!(candles.len(), 2);
    let (kind, complete) = candles[0];
    assert_eq!(kind, CandleKind::Complete);
    assert_eq!(
        (complete.open_ts, complete.open, complete.high, complete.low, complete.close, complete.volume),
        (0, 100.0, 101.0, 99.0, 99.0, 4.0)
    );
    let (kind, incomplete) = candles[1];
    assert_eq!(kind, CandleKind::Incomplete);
    assert_eq!(
        (incomplete.open_ts, incomplete.open, incomplete.volume),
        (60, 102.0, 1.0)
    );
}

#[test]
fn aggregation_scenario_two_gap() {
    let mut agg = CandleAggregator::new("BTC-USD");
    agg.apply_trade(100.0, 1.0, 10);
    let events = agg.apply_trade(101.0, 1.0, 185);

    let gap = events
        .iter()
        .find_map(|e| match e {
            AggregatorEvent::Gap(g) if g.granularity == Granularity::OneMinute => Some(g.clone()),
            _ => None,
        })
        .expect("expected a gap event");
    assert_eq!(gap.first_missing_ts, 60);
    assert_eq!(gap.count, 2);

    let candles = one_minute_candles(&events);
    assert_eq!(candles.last().unwrap().1.open_ts, 180);
}

#[test]
fn no_gap_events_on_contiguous_stream() {
    let mut agg = CandleAggregator::new("BTC-USD");
    for minute in 0..10 {
        let events = agg.apply_trade(100.0, 1.0, minute * 60 + 1);
        assert!(
            events.iter().all(|e| !matches!(e, AggregatorEvent::Gap(_))),
            "no gaps expected on a contiguous stream"
        );
    }
}

fn build_hub() -> (Arc<BroadcastHub>, Arc<SubscriptionRegistry>) {
    let registry = Arc::new(SubscriptionRegistry::new());
    let hub = Arc::new(BroadcastHub::new(
        registry.clone(),
        Arc::new(MetricsCollector::new()),
        1000,
    ));
    (hub, registry)
}

fn connect_client(
    hub: &BroadcastHub,
    id: &str,
) -> (Arc<ClientQueue>, watch::Receiver<Option<u16>>) {
    let queue = Arc::new(ClientQueue::new(256));
    let (close_tx, close_rx) = watch::channel(None);
    hub.add_client(id, ClientHandle { queue: queue.clone(), close: close_tx });
    (queue, close_rx)
}

fn incomplete_event() -> CandleEvent {
    CandleEvent {
        product: "BTC-USD".into(),
        granularity: Granularity::OneMinute,
        kind: CandleKind::Incomplete,
        candle: Candle::seed(0, 100.0, 1.0),
    }
}

fn complete_event() -> CandleEvent {
    CandleEvent {
        kind: CandleKind::Complete,
        ..incomplete_event()
    }
}

#[tokio::test]
async fn throttle_scenario() {
    // 100 incomplete events in a burst: one delivery per window; completes
    // always pass.
    let (hub, registry) = build_hub();
    let (queue, _close) = connect_client(&hub, "c1");
    registry.add("c1", "BTC-USD", "1m", 60);

    for _ in 0..100 {
        hub.handle_event(HubEvent::Candle(incomplete_event()));
    }
    let mut incompletes = 0;
    while let Some(frame) = queue.try_pop() {
        let value: serde_json::Value = serde_json::from_str(&frame.text).unwrap();
        if value["candleType"] == "incomplete" {
            incompletes += 1;
        }
    }
    assert_eq!(incompletes, 1);

    for _ in 0..5 {
        hub.handle_event(HubEvent::Candle(complete_event()));
    }
    let mut completes = 0;
    while let Some(frame) = queue.try_pop() {
        let value: serde_json::Value = serde_json::from_str(&frame.text).unwrap();
        if value["candleType"] == "complete" {
            completes += 1;
        }
    }
    assert_eq!(completes, 5);
}

#[tokio::test]
async fn disconnect_releases_all_client_state() {
    let (hub, registry) = build_hub();
    let (_queue, _close) = connect_client(&hub, "c1");
    registry.add("c1", "BTC-USD", "1m", 60);
    registry.add("c1", "ETH-USD", "5m", 300);
    assert_eq!(registry.subscription_count(), 2);

    hub.remove_client("c1");
    let freed = registry.drop_client("c1");

    assert_eq!(hub.client_count(), 0);
    assert_eq!(registry.client_count(), 0);
    assert_eq!(registry.subscription_count(), 0);
    // Both products were solely held by this client.
    let mut freed = freed;
    freed.sort();
    assert_eq!(freed, vec!["BTC-USD".to_string(), "ETH-USD".to_string()]);
}

#[tokio::test]
async fn shutdown_closes_every_client_with_going_away() {
    let (hub, _registry) = build_hub();
    let mut close_receivers = Vec::new();
    for i in 0..50 {
        let (queue, close_rx) = connect_client(&hub, &format!("c{i}"));
        close_receivers.push((queue, close_rx));
    }
    assert_eq!(hub.client_count(), 50);

    hub.close_all(CLOSE_GOING_AWAY);
    assert_eq!(hub.client_count(), 0);
    for (_queue, close_rx) in &mut close_receivers {
        assert_eq!(*close_rx.borrow_and_update(), Some(CLOSE_GOING_AWAY));
    }
}

#[tokio::test]
async fn hub_event_loop_stops_on_shutdown() {
    let (hub, _registry) = build_hub();
    let (hub_tx, hub_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = hub.start(hub_rx, shutdown_rx);
    hub_tx
        .send(HubEvent::Candle(complete_event()))
        .await
        .unwrap();
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("hub loop should stop promptly")
        .expect("hub task should not panic");
}
