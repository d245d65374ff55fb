// Exchange WebSocket client: single authenticated connection with
// subscription replay and backoff reconnect
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use tickerflow_common::{
    BookChange, BookEvent, BookLevel, BookSide, FeedError, MetricsCollector, Result, Ticker,
    Trade, UpstreamConfig, UpstreamEnvelope, WireBookEvent, WireTickerEvent, WireTradeEvent,
};

use crate::auth::TokenMinter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Ticker,
    MarketTrades,
    Level2,
    Heartbeats,
}

impl Channel {
    pub fn wire_name(&self) -> &'static str {
        match self {
            Channel::Ticker => "ticker",
            Channel::MarketTrades => "market_trades",
            Channel::Level2 => "l2_data",
            Channel::Heartbeats => "heartbeats",
        }
    }
}

/// Decoded upstream events, routed by the wire `channel` discriminator.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Trade(Trade),
    Ticker(Ticker),
    Book(BookEvent),
    SubscriptionsAck,
    GaveUp,
}

#[derive(Debug)]
pub enum UpstreamCommand {
    SubscribeTrades(String),
    SubscribeTicker(String),
    SubscribeBook(String),
    SubscribeHeartbeats(String),
    Unsubscribe(String, Channel),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Failed,
    Backoff,
    GaveUp,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
            ConnectionState::Backoff => "backoff",
            ConnectionState::GaveUp => "gave_up",
        }
    }
}

/// Connection health shared with the REST /health handler.
#[derive(Debug)]
pub struct UpstreamHealth {
    pub state: Mutex<ConnectionState>,
    pub last_message_at: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
}

impl UpstreamHealth {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Idle),
            last_message_at: Mutex::new(None),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("upstream state poisoned") = state;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("upstream state poisoned")
    }

    fn touch(&self) {
        *self
            .last_message_at
            .lock()
            .expect("upstream health poisoned") = Some(chrono::Utc::now());
    }

    pub fn last_message_age_secs(&self) -> Option<i64> {
        self.last_message_at
            .lock()
            .expect("upstream health poisoned")
            .map(|t| (chrono::Utc::now() - t).num_seconds())
    }
}

impl Default for UpstreamHealth {
    fn default() -> Self {
        Self::new()
    }
}

pub struct UpstreamClient {
    config: UpstreamConfig,
    minter: Option<Arc<TokenMinter>>,
    event_tx: mpsc::Sender<UpstreamEvent>,
    health: Arc<UpstreamHealth>,
    metrics: Arc<MetricsCollector>,
    /// Desired subscriptions, replayed on every (re)connect.
    desired: HashMap<String, HashSet<Channel>>,
}

impl UpstreamClient {
    pub fn new(
        config: UpstreamConfig,
        minter: Option<Arc<TokenMinter>>,
        event_tx: mpsc::Sender<UpstreamEvent>,
        health: Arc<UpstreamHealth>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            minter,
            event_tx,
            health,
            metrics,
            desired: HashMap::new(),
        }
    }

    /// Connection supervisor. Runs until `Shutdown` or the command channel
    /// closes. After `max_reconnect_attempts` consecutive failures a
    /// terminal `GaveUp` is emitted and the loop parks until the next
    /// command restarts it.
    pub async fn run(mut self, mut cmd_rx: mpsc::Receiver<UpstreamCommand>) {
        let mut attempts: u32 = 0;
        // One free reconnect after an auth rejection, outside the backoff curve.
        let mut auth_retry_pending = false;

        loop {
            if attempts >= self.config.max_reconnect_attempts {
                error!(
                    "Upstream gave up after {} reconnect attempts",
                    attempts
                );
                self.health.set_state(ConnectionState::GaveUp);
                let _ = self.event_tx.send(UpstreamEvent::GaveUp).await;
                // Park until a caller asks for something again.
                match cmd_rx.recv().await {
                    Some(UpstreamCommand::Shutdown) | None => return,
                    Some(cmd) => {
                        self.apply_command_offline(cmd);
                        attempts = 0;
                    }
                }
            }

            self.health.set_state(ConnectionState::Connecting);
            let session = self.run_session(&mut cmd_rx).await;
            self.metrics.record_upstream_connection_status(false);

            match session {
                SessionEnd::Shutdown => {
                    self.health.set_state(ConnectionState::Closed);
                    info!("Upstream client shut down");
                    return;
                }
                SessionEnd::AuthRejected => {
                    self.health.set_state(ConnectionState::Failed);
                    if let Some(minter) = &self.minter {
                        minter.invalidate();
                    }
                    if !auth_retry_pending {
                        warn!("Upstream rejected auth; refreshing token and reconnecting once");
                        auth_retry_pending = true;
                        continue;
                    }
                    auth_retry_pending = false;
                    attempts += 1;
                }
                SessionEnd::ConnectFailed(e) => {
                    self.health.set_state(ConnectionState::Failed);
                    warn!("Upstream connect failed: {}", e);
                    attempts += 1;
                }
                SessionEnd::Closed => {
                    // The socket had opened, so the attempt counter restarts.
                    self.health.set_state(ConnectionState::Closed);
                    auth_retry_pending = false;
                    attempts = 1;
                }
            }

            self.health.set_state(ConnectionState::Backoff);
            self.metrics.record_upstream_reconnection();
            let delay = backoff_delay(
                attempts,
                self.config.reconnect_delay_secs,
                self.config.backoff_multiplier,
                self.config.max_backoff_secs,
            );
            info!("Reconnecting to upstream in {:?} (attempt {})", delay, attempts);
            // Stay responsive to commands while backing off.
            let deadline = tokio::time::Instant::now() + delay;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(UpstreamCommand::Shutdown) | None => {
                            self.health.set_state(ConnectionState::Closed);
                            info!("Upstream client shut down during backoff");
                            return;
                        }
                        Some(cmd) => self.apply_command_offline(cmd),
                    }
                }
            }
        }
    }

    /// One connection lifetime: connect, replay subscriptions, pump frames.
    async fn run_session(&mut self, cmd_rx: &mut mpsc::Receiver<UpstreamCommand>) -> SessionEnd {
        let connect = connect_async(self.config.ws_url.as_str());
        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let (ws_stream, _) = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return SessionEnd::ConnectFailed(FeedError::WebSocket(e)),
            Err(_) => {
                return SessionEnd::ConnectFailed(FeedError::ServiceUnavailable(format!(
                    "connect timed out after {timeout:?}"
                )))
            }
        };

        info!("Connected to upstream at {}", self.config.ws_url);
        self.health.set_state(ConnectionState::Open);
        self.metrics.record_upstream_connection_status(true);

        let (mut write, mut read) = ws_stream.split();

        // Replay every desired subscription before serving traffic.
        for (product, channels) in self.desired.clone() {
            for channel in channels {
                if let Err(e) = self.send_subscribe(&mut write, &product, channel).await {
                    warn!("Resubscribe {}:{} failed: {}", product, channel.wire_name(), e);
                    return SessionEnd::Closed;
                }
            }
        }

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.health.touch();
                            match self.dispatch_frame(&text).await {
                                FrameOutcome::Ok => {}
                                FrameOutcome::AuthRejected => return SessionEnd::AuthRejected,
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if write.send(Message::Pong(data)).await.is_err() {
                                return SessionEnd::Closed;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            warn!("Upstream closed the connection: {:?}", frame);
                            return SessionEnd::Closed;
                        }
                        Some(Ok(_)) => {
                            debug!("Ignoring non-text upstream frame");
                        }
                        Some(Err(e)) => {
                            error!("Upstream socket error: {}", e);
                            return SessionEnd::Closed;
                        }
                        None => {
                            warn!("Upstream stream ended");
                            return SessionEnd::Closed;
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(UpstreamCommand::Shutdown) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            return SessionEnd::Shutdown;
                        }
                        Some(cmd) => {
                            if let Err(e) = self.apply_command(&mut write, cmd).await {
                                warn!("Subscription frame failed: {}", e);
                                return SessionEnd::Closed;
                            }
                        }
                    }
                }
            }
        }
    }

    fn apply_command_offline(&mut self, cmd: UpstreamCommand) {
        match cmd {
            UpstreamCommand::SubscribeTrades(p) => {
                self.desired.entry(p).or_default().insert(Channel::MarketTrades);
            }
            UpstreamCommand::SubscribeTicker(p) => {
                self.desired.entry(p).or_default().insert(Channel::Ticker);
            }
            UpstreamCommand::SubscribeBook(p) => {
                self.desired.entry(p).or_default().insert(Channel::Level2);
            }
            UpstreamCommand::SubscribeHeartbeats(p) => {
                self.desired.entry(p).or_default().insert(Channel::Heartbeats);
            }
            UpstreamCommand::Unsubscribe(p, channel) => {
                if let Some(channels) = self.desired.get_mut(&p) {
                    channels.remove(&channel);
                    if channels.is_empty() {
                        self.desired.remove(&p);
                    }
                }
            }
            UpstreamCommand::Shutdown => {}
        }
    }

    async fn apply_command<S>(&mut self, write: &mut S, cmd: UpstreamCommand) -> Result<()>
    where
        S: SinkExt<Message> + Unpin,
        FeedError: From<S::Error>,
    {
        match cmd {
            UpstreamCommand::SubscribeTrades(p) => {
                if self
                    .desired
                    .entry(p.clone())
                    .or_default()
                    .insert(Channel::MarketTrades)
                {
                    self.send_subscribe(write, &p, Channel::MarketTrades).await?;
                }
            }
            UpstreamCommand::SubscribeTicker(p) => {
                if self
                    .desired
                    .entry(p.clone())
                    .or_default()
                    .insert(Channel::Ticker)
                {
                    self.send_subscribe(write, &p, Channel::Ticker).await?;
                }
            }
            UpstreamCommand::SubscribeBook(p) => {
                if self
                    .desired
                    .entry(p.clone())
                    .or_default()
                    .insert(Channel::Level2)
                {
                    self.send_subscribe(write, &p, Channel::Level2).await?;
                }
            }
            UpstreamCommand::SubscribeHeartbeats(p) => {
                if self
                    .desired
                    .entry(p.clone())
                    .or_default()
                    .insert(Channel::Heartbeats)
                {
                    self.send_subscribe(write, &p, Channel::Heartbeats).await?;
                }
            }
            UpstreamCommand::Unsubscribe(p, channel) => {
                let known = self
                    .desired
                    .get_mut(&p)
                    .map(|channels| channels.remove(&channel))
                    .unwrap_or(false);
                if known {
                    if self.desired.get(&p).is_some_and(|c| c.is_empty()) {
                        self.desired.remove(&p);
                    }
                    self.send_unsubscribe(write, &p, channel).await?;
                }
            }
            UpstreamCommand::Shutdown => {}
        }
        Ok(())
    }

    async fn send_subscribe<S>(&self, write: &mut S, product: &str, channel: Channel) -> Result<()>
    where
        S: SinkExt<Message> + Unpin,
        FeedError: From<S::Error>,
    {
        let mut frame = json!({
            "type": "subscribe",
            "product_ids": [product],
            "channel": channel.wire_name(),
        });
        // The book channel is authenticated; attach the current token.
        if channel == Channel::Level2 {
            if let Some(minter) = &self.minter {
                match minter.get_token() {
                    Ok(token) => {
                        frame["jwt"] = json!(token.value);
                    }
                    Err(e) => warn!("No token for book subscription: {}", e),
                }
            }
        }
        write.send(Message::Text(frame.to_string())).await?;
        debug!("Subscribed upstream {}:{}", product, channel.wire_name());
        Ok(())
    }

    async fn send_unsubscribe<S>(
        &self,
        write: &mut S,
        product: &str,
        channel: Channel,
    ) -> Result<()>
    where
        S: SinkExt<Message> + Unpin,
        FeedError: From<S::Error>,
    {
        let frame = json!({
            "type": "unsubscribe",
            "product_ids": [product],
            "channel": channel.wire_name(),
        });
        write.send(Message::Text(frame.to_string())).await?;
        debug!("Unsubscribed upstream {}:{}", product, channel.wire_name());
        Ok(())
    }

    async fn dispatch_frame(&self, text: &str) -> FrameOutcome {
        match decode_frame(text) {
            Ok(DecodedFrame::Events(events)) => {
                for event in events {
                    match &event {
                        UpstreamEvent::Trade(trade) => {
                            self.metrics.record_trade_processed(&trade.product);
                        }
                        UpstreamEvent::Ticker(_) => self.metrics.record_upstream_message("ticker"),
                        UpstreamEvent::Book(_) => self.metrics.record_upstream_message("l2_data"),
                        UpstreamEvent::SubscriptionsAck => {
                            info!("Upstream subscription confirmed");
                        }
                        UpstreamEvent::GaveUp => {}
                    }
                    if self.event_tx.send(event).await.is_err() {
                        warn!("Upstream event channel closed");
                    }
                }
                FrameOutcome::Ok
            }
            Ok(DecodedFrame::AuthRejected) => FrameOutcome::AuthRejected,
            Ok(DecodedFrame::Ignored) => FrameOutcome::Ok,
            Err(e) => {
                self.metrics.record_upstream_decode_error();
                warn!("Dropping malformed upstream frame: {}", e);
                FrameOutcome::Ok
            }
        }
    }
}

enum SessionEnd {
    Shutdown,
    AuthRejected,
    ConnectFailed(FeedError),
    Closed,
}

enum FrameOutcome {
    Ok,
    AuthRejected,
}

#[derive(Debug)]
pub enum DecodedFrame {
    Events(Vec<UpstreamEvent>),
    AuthRejected,
    Ignored,
}

pub fn backoff_delay(attempts: u32, base_secs: u64, multiplier: f64, cap_secs: u64) -> Duration {
    let exp = multiplier.powi(attempts.saturating_sub(1) as i32);
    let secs = (base_secs as f64 * exp).min(cap_secs as f64);
    Duration::from_secs_f64(secs)
}

/// Decode one upstream text frame into typed events. Routing is by the
/// `channel` discriminator, not the message type field.
pub fn decode_frame(text: &str) -> Result<DecodedFrame> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    // Error frames arrive without a channel.
    if value.get("type").and_then(|t| t.as_str()) == Some("error") {
        let message = value
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown upstream error");
        if message.contains("401") || message.contains("403") || message.contains("authentication")
        {
            return Ok(DecodedFrame::AuthRejected);
        }
        return Err(FeedError::Decode(format!("upstream error: {message}")));
    }

    let envelope: UpstreamEnvelope = serde_json::from_value(value)?;
    let mut events = Vec::new();

    match envelope.channel.as_str() {
        "market_trades" => {
            for raw in envelope.events {
                let event: WireTradeEvent = serde_json::from_value(raw)?;
                for wire in event.trades {
                    events.push(UpstreamEvent::Trade(Trade::try_from(wire)?));
                }
            }
        }
        "l2_data" => {
            for raw in envelope.events {
                let event: WireBookEvent = serde_json::from_value(raw)?;
                events.push(UpstreamEvent::Book(decode_book_event(event)?));
            }
        }
        "ticker" => {
            for raw in envelope.events {
                let event: WireTickerEvent = serde_json::from_value(raw)?;
                for wire in event.tickers {
                    events.push(UpstreamEvent::Ticker(Ticker::from(wire)));
                }
            }
        }
        "subscriptions" => return Ok(DecodedFrame::Events(vec![UpstreamEvent::SubscriptionsAck])),
        "heartbeats" => return Ok(DecodedFrame::Ignored),
        other => {
            return Err(FeedError::Decode(format!("unknown channel {other:?}")));
        }
    }

    Ok(DecodedFrame::Events(events))
}

fn decode_book_event(event: WireBookEvent) -> Result<BookEvent> {
    let parse_side = |side: &str| -> Result<BookSide> {
        match side {
            "bid" => Ok(BookSide::Bid),
            "offer" | "ask" => Ok(BookSide::Ask),
            other => Err(FeedError::Decode(format!("unknown book side {other:?}"))),
        }
    };

    match event.r#type.as_str() {
        "snapshot" => {
            let mut bids = Vec::new();
            let mut asks = Vec::new();
            for level in event.updates {
                let parsed = BookLevel {
                    price: level
                        .price_level
                        .parse()
                        .map_err(|_| FeedError::Decode("bad price level".into()))?,
                    size: level
                        .new_quantity
                        .parse()
                        .map_err(|_| FeedError::Decode("bad level size".into()))?,
                };
                match parse_side(&level.side)? {
                    BookSide::Bid => bids.push(parsed),
                    BookSide::Ask => asks.push(parsed),
                }
            }
            Ok(BookEvent::Snapshot {
                product: event.product_id,
                bids,
                asks,
            })
        }
        "update" => {
            let mut changes = Vec::new();
            for level in event.updates {
                changes.push(BookChange {
                    side: parse_side(&level.side)?,
                    price: level
                        .price_level
                        .parse()
                        .map_err(|_| FeedError::Decode("bad price level".into()))?,
                    size: level
                        .new_quantity
                        .parse()
                        .map_err(|_| FeedError::Decode("bad level size".into()))?,
                });
            }
            Ok(BookEvent::Update {
                product: event.product_id,
                changes,
            })
        }
        other => Err(FeedError::Decode(format!("unknown l2 event type {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_delay(1, 1, 2.0, 60), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, 1, 2.0, 60), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, 1, 2.0, 60), Duration::from_secs(4));
        assert_eq!(backoff_delay(10, 1, 2.0, 60), Duration::from_secs(60));
    }

    #[test]
    fn decodes_market_trades() {
        let text = r#"{
            "channel": "market_trades",
            "timestamp": "2024-01-01T00:00:11Z",
            "sequence_num": 3,
            "events": [{
                "type": "update",
                "trades": [{
                    "trade_id": "42",
                    "product_id": "BTC-USD",
                    "price": "50000.00",
                    "size": "0.5",
                    "side": "SELL",
                    "time": "2024-01-01T00:00:10.123Z"
                }]
            }]
        }"#;
        let decoded = decode_frame(text).unwrap();
        let DecodedFrame::Events(events) = decoded else {
            panic!("expected events");
        };
        assert_eq!(events.len(), 1);
        let UpstreamEvent::Trade(trade) = &events[0] else {
            panic!("expected a trade");
        };
        assert_eq!(trade.product, "BTC-USD");
        assert_eq!(trade.price, 50000.0);
        // Millisecond precision floors to seconds.
        assert_eq!(trade.ts, 1704067210);
    }

    #[test]
    fn decodes_book_snapshot_and_update() {
        let snapshot = r#"{
            "channel": "l2_data",
            "events": [{
                "type": "snapshot",
                "product_id": "BTC-USD",
                "updates": [
                    {"side": "bid", "price_level": "100", "new_quantity": "1"},
                    {"side": "offer", "price_level": "101", "new_quantity": "2"}
                ]
            }]
        }"#;
        let DecodedFrame::Events(events) = decode_frame(snapshot).unwrap() else {
            panic!("expected events");
        };
        let UpstreamEvent::Book(BookEvent::Snapshot { product, bids, asks }) = &events[0] else {
            panic!("expected a snapshot");
        };
        assert_eq!(product, "BTC-USD");
        assert_eq!(bids.len(), 1);
        assert_eq!(asks.len(), 1);

        let update = r#"{
            "channel": "l2_data",
            "events": [{
                "type": "update",
                "product_id": "BTC-USD",
                "updates": [
                    {"side": "bid", "price_level": "99", "new_quantity": "0"}
                ]
            }]
        }"#;
        let DecodedFrame::Events(events) = decode_frame(update).unwrap() else {
            panic!("expected events");
        };
        let UpstreamEvent::Book(BookEvent::Update { changes, .. }) = &events[0] else {
            panic!("expected an update");
        };
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].side, BookSide::Bid);
        assert_eq!(changes[0].size, 0.0);
    }

    #[test]
    fn decodes_subscriptions_ack_and_heartbeats() {
        let ack = r#"{"channel": "subscriptions", "events": [{"subscriptions": {}}]}"#;
        assert!(matches!(
            decode_frame(ack).unwrap(),
            DecodedFrame::Events(events) if matches!(events[0], UpstreamEvent::SubscriptionsAck)
        ));
        let heartbeat = r#"{"channel": "heartbeats", "events": []}"#;
        assert!(matches!(decode_frame(heartbeat).unwrap(), DecodedFrame::Ignored));
    }

    #[test]
    fn auth_rejection_is_detected() {
        let err = r#"{"type": "error", "message": "authentication failure: 401"}"#;
        assert!(matches!(decode_frame(err).unwrap(), DecodedFrame::AuthRejected));
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(decode_frame("not json").is_err());
        assert!(decode_frame(r#"{"channel": "mystery", "events": []}"#).is_err());
    }
}
