// Broadcast hub: routes pipeline events to the subscribed local clients
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tickerflow_common::{
    BookChange, BookEvent, BookSide, CandleEvent, CandleKind, DatabaseActivity, MetricsCollector,
    ServerFrame, Ticker,
};

use crate::registry::SubscriptionRegistry;

/// Close code sent when a client cannot keep up with its queue.
pub const CLOSE_OVERLOADED: u16 = 1013;
/// Close code sent to every client during graceful shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Everything the hub can fan out.
#[derive(Debug, Clone)]
pub enum HubEvent {
    Candle(CandleEvent),
    Ticker(Ticker),
    Book(BookEvent),
    Activity(DatabaseActivity),
    PubSubDelta { channel: String, payload: String },
}

/// One frame queued toward a client socket. Droppable frames are shed
/// first under backpressure; a non-droppable frame that cannot be queued
/// even after shedding closes the client instead.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub text: String,
    pub droppable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The queue was full; this many queued droppable frames were
    /// discarded to make room.
    QueuedAfterShedding(usize),
    /// The queue was full and the incoming frame was droppable.
    DroppedIncoming,
    /// The queue is full of must-deliver frames; nothing could be shed.
    Overflow,
}

/// Bounded per-client frame queue with priority shedding. When full, a
/// must-deliver frame evicts already-queued droppable frames (incomplete
/// candles and similar) before the caller resorts to closing the client.
#[derive(Debug)]
pub struct ClientQueue {
    frames: Mutex<VecDeque<OutboundFrame>>,
    notify: Notify,
    capacity: usize,
}

impl ClientQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, frame: OutboundFrame) -> EnqueueOutcome {
        let mut frames = self.frames.lock().expect("client queue poisoned");
        if frames.len() < self.capacity {
            frames.push_back(frame);
            self.notify.notify_one();
            return EnqueueOutcome::Queued;
        }
        if frame.droppable {
            return EnqueueOutcome::DroppedIncoming;
        }
        let before = frames.len();
        frames.retain(|queued| !queued.droppable);
        let shed = before - frames.len();
        if frames.len() < self.capacity {
            frames.push_back(frame);
            self.notify.notify_one();
            EnqueueOutcome::QueuedAfterShedding(shed)
        } else {
            EnqueueOutcome::Overflow
        }
    }

    pub fn try_pop(&self) -> Option<OutboundFrame> {
        self.frames.lock().expect("client queue poisoned").pop_front()
    }

    /// Wait for the next frame. `notify_one` stores a permit when no
    /// waiter is parked, so pushes between polls are never lost.
    pub async fn pop(&self) -> OutboundFrame {
        loop {
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.frames.lock().expect("client queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write-side handle for one client: the shedding frame queue plus an
/// always-available close signal.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub queue: Arc<ClientQueue>,
    pub close: watch::Sender<Option<u16>>,
}

struct HubInner {
    clients: HashMap<String, ClientHandle>,
    /// Last level2 snapshot per product, replayed to new clients.
    cached_snapshots: HashMap<String, serde_json::Value>,
}

pub struct BroadcastHub {
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<MetricsCollector>,
    inner: Mutex<HubInner>,
    incomplete_window: Duration,
}

impl BroadcastHub {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        metrics: Arc<MetricsCollector>,
        incomplete_window_ms: u64,
    ) -> Self {
        Self {
            registry,
            metrics,
            inner: Mutex::new(HubInner {
                clients: HashMap::new(),
                cached_snapshots: HashMap::new(),
            }),
            incomplete_window: Duration::from_millis(incomplete_window_ms),
        }
    }

    pub fn add_client(&self, client_id: &str, handle: ClientHandle) {
        let mut inner = self.inner.lock().expect("hub poisoned");
        inner.clients.insert(client_id.to_string(), handle);
        self.metrics.record_client_connected(inner.clients.len());
        info!("Client {} connected ({} total)", client_id, inner.clients.len());
    }

    pub fn remove_client(&self, client_id: &str) {
        let mut inner = self.inner.lock().expect("hub poisoned");
        if inner.clients.remove(client_id).is_some() {
            self.metrics.record_client_connected(inner.clients.len());
            info!(
                "Client {} disconnected ({} total)",
                client_id,
                inner.clients.len()
            );
        }
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().expect("hub poisoned").clients.len()
    }

    /// Cached level2 snapshots for new-client hydration.
    pub fn cached_snapshots(&self) -> Vec<serde_json::Value> {
        let inner = self.inner.lock().expect("hub poisoned");
        inner.cached_snapshots.values().cloned().collect()
    }

    /// Close every client with the given code and clear the client map.
    pub fn close_all(&self, code: u16) {
        let mut inner = self.inner.lock().expect("hub poisoned");
        for (client_id, handle) in inner.clients.drain() {
            debug!("Closing client {} with code {}", client_id, code);
            let _ = handle.close.send(Some(code));
        }
        self.metrics.record_client_connected(0);
    }

    pub fn handle_event(&self, event: HubEvent) {
        match event {
            HubEvent::Candle(candle) => self.broadcast_candle(candle),
            HubEvent::Ticker(ticker) => self.broadcast_ticker(ticker),
            HubEvent::Book(book) => self.broadcast_book(book),
            HubEvent::Activity(activity) => self.broadcast_activity(activity),
            HubEvent::PubSubDelta { channel, payload } => {
                self.broadcast_pubsub_delta(channel, payload)
            }
        }
    }

    /// Candle events are translated to the client-facing granularity label
    /// through the registry; events with no mapping are dropped.
    fn broadcast_candle(&self, event: CandleEvent) {
        let Some(label) = self
            .registry
            .label_for(&event.product, event.granularity.seconds())
        else {
            debug!(
                "No granularity label for {} {}s; dropping candle",
                event.product,
                event.granularity.seconds()
            );
            return;
        };

        let window = match event.kind {
            CandleKind::Complete => Duration::ZERO,
            CandleKind::Incomplete => self.incomplete_window,
        };
        let droppable = event.kind == CandleKind::Incomplete;
        let frame = ServerFrame::candle(&event.product, &label, &event);
        let Ok(text) = serde_json::to_string(&frame) else {
            return;
        };

        for client_id in self.registry.clients_for(&event.product, &label) {
            if !self
                .registry
                .should_emit(&client_id, &event.product, &label, window)
            {
                self.metrics.record_broadcast_throttled();
                continue;
            }
            self.send_to(&client_id, OutboundFrame { text: text.clone(), droppable }, "candle");
        }
    }

    /// Tickers go to every client subscribed to the product at any
    /// granularity, unthrottled.
    fn broadcast_ticker(&self, ticker: Ticker) {
        let product = ticker.product_id.clone();
        let Ok(text) = serde_json::to_string(&ServerFrame::Ticker { data: ticker }) else {
            return;
        };
        for client_id in self.registry.clients_for_product(&product) {
            self.send_to(
                &client_id,
                OutboundFrame { text: text.clone(), droppable: false },
                "ticker",
            );
        }
    }

    /// Book traffic fans out to all connected clients; snapshots are also
    /// cached for new-client hydration.
    fn broadcast_book(&self, event: BookEvent) {
        let data = match &event {
            BookEvent::Snapshot { product, bids, asks } => {
                let data = json!({
                    "type": "snapshot",
                    "product_id": product,
                    "bids": bids,
                    "asks": asks,
                });
                self.inner
                    .lock()
                    .expect("hub poisoned")
                    .cached_snapshots
                    .insert(product.clone(), data.clone());
                data
            }
            BookEvent::Update { product, changes } => {
                let (bids, asks) = split_changes(changes);
                json!({
                    "type": "update",
                    "product_id": product,
                    "bids": bids,
                    "asks": asks,
                })
            }
        };

        let Ok(text) = serde_json::to_string(&ServerFrame::Level2 { data }) else {
            return;
        };
        self.broadcast_all(text, false, "level2");
    }

    fn broadcast_activity(&self, activity: DatabaseActivity) {
        let Ok(text) = serde_json::to_string(&ServerFrame::DatabaseActivity { data: activity })
        else {
            return;
        };
        self.broadcast_all(text, true, "database_activity");
    }

    /// Pub/sub payloads are parsed once, then fanned out verbatim.
    fn broadcast_pubsub_delta(&self, channel: String, payload: String) {
        let data: serde_json::Value = match serde_json::from_str(&payload) {
            Ok(value) => value,
            Err(e) => {
                warn!("Unparseable pub/sub delta on {}: {}", channel, e);
                return;
            }
        };
        let Ok(text) = serde_json::to_string(&ServerFrame::OrderbookDelta { channel, data })
        else {
            return;
        };
        self.broadcast_all(text, true, "orderbook-delta");
    }

    fn broadcast_all(&self, text: String, droppable: bool, frame_type: &str) {
        let clients: Vec<String> = {
            let inner = self.inner.lock().expect("hub poisoned");
            inner.clients.keys().cloned().collect()
        };
        for client_id in clients {
            self.send_to(
                &client_id,
                OutboundFrame { text: text.clone(), droppable },
                frame_type,
            );
        }
    }

    /// Queue one frame toward one client. A full queue drops an incoming
    /// droppable frame, sheds queued droppable frames to make room for a
    /// must-deliver one, and only when nothing can be shed closes the
    /// client with 1013.
    fn send_to(&self, client_id: &str, frame: OutboundFrame, frame_type: &str) {
        let handle = {
            let inner = self.inner.lock().expect("hub poisoned");
            inner.clients.get(client_id).cloned()
        };
        let Some(handle) = handle else {
            return;
        };

        match handle.queue.push(frame) {
            EnqueueOutcome::Queued => self.metrics.record_client_frame_sent(frame_type),
            EnqueueOutcome::QueuedAfterShedding(shed) => {
                self.metrics
                    .record_client_frames_dropped("backpressure", shed as u64);
                debug!(
                    "Shed {} queued frame(s) for slow client {} to deliver a {}",
                    shed, client_id, frame_type
                );
                self.metrics.record_client_frame_sent(frame_type);
            }
            EnqueueOutcome::DroppedIncoming => {
                self.metrics.record_client_frames_dropped("backpressure", 1);
                debug!("Dropped {} frame for slow client {}", frame_type, client_id);
            }
            EnqueueOutcome::Overflow => {
                warn!(
                    "Client {} queue full of critical frames on {}; closing with {}",
                    client_id, frame_type, CLOSE_OVERLOADED
                );
                let _ = handle.close.send(Some(CLOSE_OVERLOADED));
                self.remove_client(client_id);
            }
        }
    }

    /// Consume the hub event channel until it closes or shutdown flips.
    pub fn start(
        self: &Arc<Self>,
        mut event_rx: mpsc::Receiver<HubEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = event_rx.recv() => {
                        match event {
                            Some(event) => hub.handle_event(event),
                            None => {
                                debug!("Hub event channel closed");
                                return;
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Broadcast hub stopping");
                        return;
                    }
                }
            }
        })
    }
}

fn split_changes(changes: &[BookChange]) -> (Vec<serde_json::Value>, Vec<serde_json::Value>) {
    let bids = changes
        .iter()
        .filter(|c| c.side == BookSide::Bid)
        .map(|c| json!({"price": c.price, "size": c.size}))
        .collect();
    let asks = changes
        .iter()
        .filter(|c| c.side == BookSide::Ask)
        .map(|c| json!({"price": c.price, "size": c.size}))
        .collect();
    (bids, asks)
}

/// Bridge Redis pub/sub book deltas into the hub event channel. Reconnects
/// forever until shutdown.
pub fn start_pubsub_bridge(
    redis_url: String,
    hub_tx: mpsc::Sender<HubEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match run_pubsub_session(&redis_url, &hub_tx, &mut shutdown).await {
                Ok(true) => return,
                Ok(false) | Err(_) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }
    })
}

/// Returns Ok(true) on shutdown, Ok(false) when the connection dropped.
async fn run_pubsub_session(
    redis_url: &str,
    hub_tx: &mpsc::Sender<HubEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> tickerflow_common::Result<bool> {
    use futures_util::StreamExt;

    let client = redis::Client::open(redis_url)?;
    let conn = client.get_async_connection().await?;
    let mut pubsub = conn.into_pubsub();
    pubsub.psubscribe("orderbook:*:delta").await?;
    info!("Subscribed to Redis pub/sub pattern orderbook:*:delta");

    let mut stream = pubsub.on_message();
    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else {
                    warn!("Redis pub/sub stream ended");
                    return Ok(false);
                };
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Bad pub/sub payload on {}: {}", channel, e);
                        continue;
                    }
                };
                if hub_tx.send(HubEvent::PubSubDelta { channel, payload }).await.is_err() {
                    return Ok(true);
                }
            }
            _ = shutdown.changed() => {
                return Ok(true);
            }
        }
    }
}
