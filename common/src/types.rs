// Core market-data types shared between the feed pipeline and the local server
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of supported candle granularities. The label/seconds
/// mapping is authoritative and compile-time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Granularity {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    TwoHours,
    FourHours,
    SixHours,
    TwelveHours,
    OneDay,
}

impl Granularity {
    pub const ALL: [Granularity; 10] = [
        Granularity::OneMinute,
        Granularity::FiveMinutes,
        Granularity::FifteenMinutes,
        Granularity::ThirtyMinutes,
        Granularity::OneHour,
        Granularity::TwoHours,
        Granularity::FourHours,
        Granularity::SixHours,
        Granularity::TwelveHours,
        Granularity::OneDay,
    ];

    pub fn seconds(&self) -> i64 {
        match self {
            Granularity::OneMinute => 60,
            Granularity::FiveMinutes => 300,
            Granularity::FifteenMinutes => 900,
            Granularity::ThirtyMinutes => 1800,
            Granularity::OneHour => 3600,
            Granularity::TwoHours => 7200,
            Granularity::FourHours => 14400,
            Granularity::SixHours => 21600,
            Granularity::TwelveHours => 43200,
            Granularity::OneDay => 86400,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Granularity::OneMinute => "1m",
            Granularity::FiveMinutes => "5m",
            Granularity::FifteenMinutes => "15m",
            Granularity::ThirtyMinutes => "30m",
            Granularity::OneHour => "1h",
            Granularity::TwoHours => "2h",
            Granularity::FourHours => "4h",
            Granularity::SixHours => "6h",
            Granularity::TwelveHours => "12h",
            Granularity::OneDay => "1d",
        }
    }

    pub fn from_label(label: &str) -> Option<Granularity> {
        Granularity::ALL.iter().copied().find(|g| g.label() == label)
    }

    pub fn from_seconds(seconds: i64) -> Option<Granularity> {
        Granularity::ALL
            .iter()
            .copied()
            .find(|g| g.seconds() == seconds)
    }

    /// Exchange REST parameter name for this granularity.
    pub fn rest_name(&self) -> &'static str {
        match self {
            Granularity::OneMinute => "ONE_MINUTE",
            Granularity::FiveMinutes => "FIVE_MINUTE",
            Granularity::FifteenMinutes => "FIFTEEN_MINUTE",
            Granularity::ThirtyMinutes => "THIRTY_MINUTE",
            Granularity::OneHour => "ONE_HOUR",
            Granularity::TwoHours => "TWO_HOUR",
            Granularity::FourHours => "FOUR_HOUR",
            Granularity::SixHours => "SIX_HOUR",
            Granularity::TwelveHours => "TWELVE_HOUR",
            Granularity::OneDay => "ONE_DAY",
        }
    }

    /// Candle retention in Redis, in days.
    pub fn retention_days(&self) -> i64 {
        match self {
            Granularity::OneMinute => 7,
            Granularity::FiveMinutes => 30,
            Granularity::FifteenMinutes => 60,
            Granularity::ThirtyMinutes => 90,
            Granularity::OneHour => 180,
            Granularity::TwoHours => 365,
            Granularity::FourHours => 365,
            Granularity::SixHours => 365,
            Granularity::TwelveHours => 365,
            Granularity::OneDay => 1825,
        }
    }

    /// Continuous-updater poll period.
    pub fn poll_interval(&self) -> std::time::Duration {
        let secs = match self {
            Granularity::OneMinute => 5,
            Granularity::FiveMinutes => 15,
            Granularity::FifteenMinutes => 30,
            Granularity::ThirtyMinutes => 60,
            Granularity::OneHour => 120,
            Granularity::TwoHours => 180,
            Granularity::FourHours => 240,
            Granularity::SixHours => 300,
            Granularity::TwelveHours => 450,
            Granularity::OneDay => 600,
        };
        std::time::Duration::from_secs(secs)
    }

    /// Start of the bucket containing `ts` (Unix seconds).
    pub fn bucket_start(&self, ts: i64) -> i64 {
        ts - ts.rem_euclid(self.seconds())
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub product: String,
    pub price: f64,
    pub size: f64,
    /// Unix seconds; millisecond inputs are floored at the decode boundary.
    pub ts: i64,
    pub side: Side,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn seed(open_ts: i64, price: f64, size: f64) -> Self {
        Self {
            open_ts,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: size,
        }
    }

    /// Fold one more trade from the same bucket into the running OHLCV.
    pub fn fold(&mut self, price: f64, size: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += size;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandleKind {
    Complete,
    Incomplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleEvent {
    pub product: String,
    pub granularity: Granularity,
    pub kind: CandleKind,
    pub candle: Candle,
}

/// Missing buckets between the last completed candle and a newly opened one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapEvent {
    pub product: String,
    pub granularity: Granularity,
    pub first_missing_ts: i64,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub product_id: String,
    pub price: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub time: i64,
    pub volume_24h: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bid,
    Ask,
}

/// A single price-level change; size 0 removes the level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookChange {
    pub side: BookSide,
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BookEvent {
    Snapshot {
        product: String,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
    },
    Update {
        product: String,
        changes: Vec<BookChange>,
    },
}

impl BookEvent {
    pub fn product(&self) -> &str {
        match self {
            BookEvent::Snapshot { product, .. } => product,
            BookEvent::Update { product, .. } => product,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    FetchStart,
    StoreComplete,
    Error,
}

/// Emitted by the candle store path so clients can render storage activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseActivity {
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub pair: String,
    pub granularity: String,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// Exchange wire messages. Incoming frames carry a `channel` discriminator;
// the event payload shape depends on the channel, so the envelope keeps the
// events as raw JSON and the upstream client parses per channel.

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamEnvelope {
    pub channel: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub sequence_num: Option<u64>,
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireTradeEvent {
    pub r#type: String,
    pub trades: Vec<WireTrade>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireTrade {
    pub trade_id: String,
    pub product_id: String,
    pub price: String,
    pub size: String,
    pub side: String,
    pub time: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireBookEvent {
    pub r#type: String,
    pub product_id: String,
    pub updates: Vec<WireBookLevel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireBookLevel {
    pub side: String,
    pub price_level: String,
    pub new_quantity: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireTickerEvent {
    pub r#type: String,
    pub tickers: Vec<WireTicker>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireTicker {
    pub product_id: String,
    pub price: String,
    #[serde(default)]
    pub best_bid: String,
    #[serde(default)]
    pub best_ask: String,
    #[serde(default)]
    pub volume_24_h: String,
}

impl TryFrom<WireTrade> for Trade {
    type Error = crate::error::FeedError;

    fn try_from(msg: WireTrade) -> Result<Self, Self::Error> {
        let ts = DateTime::parse_from_rfc3339(&msg.time)
            .map(|t| t.timestamp())
            .unwrap_or_else(|_| Utc::now().timestamp());
        let side = match msg.side.to_ascii_lowercase().as_str() {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            other => {
                return Err(crate::error::FeedError::Decode(format!(
                    "unknown trade side {other:?}"
                )))
            }
        };
        Ok(Trade {
            product: msg.product_id,
            price: msg
                .price
                .parse()
                .map_err(|_| crate::error::FeedError::Decode("bad trade price".into()))?,
            size: msg
                .size
                .parse()
                .map_err(|_| crate::error::FeedError::Decode("bad trade size".into()))?,
            ts,
            side,
        })
    }
}

impl From<WireTicker> for Ticker {
    fn from(msg: WireTicker) -> Self {
        Ticker {
            product_id: msg.product_id,
            price: msg.price.parse().unwrap_or(0.0),
            best_bid: msg.best_bid.parse().unwrap_or(0.0),
            best_ask: msg.best_ask.parse().unwrap_or(0.0),
            time: Utc::now().timestamp(),
            volume_24h: msg.volume_24_h.parse().unwrap_or(0.0),
        }
    }
}

// Local client protocol: JSON frames on the fan-out WebSocket.

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    pub pair: String,
    pub granularity: String,
}

/// Outbound frames written to local clients. Flat candle frames and nested
/// envelopes match what the chart frontend consumes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "connected")]
    Connected { message: String },
    #[serde(rename = "subscribed")]
    Subscribed { pair: String, granularity: String },
    #[serde(rename = "unsubscribed")]
    Unsubscribed { pair: String, granularity: String },
    #[serde(rename = "candle")]
    Candle {
        pair: String,
        granularity: String,
        time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        #[serde(rename = "candleType")]
        candle_type: CandleKind,
    },
    #[serde(rename = "ticker")]
    Ticker { data: Ticker },
    #[serde(rename = "level2")]
    Level2 { data: serde_json::Value },
    #[serde(rename = "orderbook-delta")]
    OrderbookDelta {
        channel: String,
        data: serde_json::Value,
    },
    #[serde(rename = "database_activity")]
    DatabaseActivity { data: DatabaseActivity },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerFrame {
    pub fn candle(product: &str, label: &str, event: &CandleEvent) -> Self {
        ServerFrame::Candle {
            pair: product.to_string(),
            granularity: label.to_string(),
            time: event.candle.open_ts,
            open: event.candle.open,
            high: event.candle.high,
            low: event.candle.low,
            close: event.candle.close,
            volume: event.candle.volume,
            candle_type: event.kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granularity_label_seconds_bijection() {
        for g in Granularity::ALL {
            assert_eq!(Granularity::from_label(g.label()), Some(g));
            assert_eq!(Granularity::from_seconds(g.seconds()), Some(g));
        }
        assert_eq!(Granularity::from_label("3m"), None);
        assert_eq!(Granularity::from_seconds(61), None);
    }

    #[test]
    fn bucket_start_floors_to_granularity() {
        let g = Granularity::OneMinute;
        assert_eq!(g.bucket_start(0), 0);
        assert_eq!(g.bucket_start(59), 0);
        assert_eq!(g.bucket_start(60), 60);
        assert_eq!(g.bucket_start(185), 180);
        assert_eq!(Granularity::OneDay.bucket_start(90000), 86400);
    }

    #[test]
    fn candle_fold_maintains_invariants() {
        let mut c = Candle::seed(0, 100.0, 1.0);
        c.fold(101.0, 2.0);
        c.fold(99.0, 1.0);
        assert_eq!(c.open, 100.0);
        assert_eq!(c.high, 101.0);
        assert_eq!(c.low, 99.0);
        assert_eq!(c.close, 99.0);
        assert_eq!(c.volume, 4.0);
        assert!(c.low <= c.open.min(c.close));
        assert!(c.high >= c.open.max(c.close));
    }

    #[test]
    fn wire_trade_conversion() {
        let wire = WireTrade {
            trade_id: "1".into(),
            product_id: "BTC-USD".into(),
            price: "50000.5".into(),
            size: "0.25".into(),
            side: "BUY".into(),
            time: "2024-01-01T00:00:10Z".into(),
        };
        let trade = Trade::try_from(wire).unwrap();
        assert_eq!(trade.product, "BTC-USD");
        assert_eq!(trade.price, 50000.5);
        assert_eq!(trade.size, 0.25);
        assert_eq!(trade.ts, 1704067210);
        assert_eq!(trade.side, Side::Buy);
    }

    #[test]
    fn wire_trade_rejects_unknown_side() {
        let wire = WireTrade {
            trade_id: "1".into(),
            product_id: "BTC-USD".into(),
            price: "1".into(),
            size: "1".into(),
            side: "hold".into(),
            time: "2024-01-01T00:00:10Z".into(),
        };
        assert!(Trade::try_from(wire).is_err());
    }

    #[test]
    fn candle_frame_shape() {
        let event = CandleEvent {
            product: "BTC-USD".into(),
            granularity: Granularity::OneMinute,
            kind: CandleKind::Complete,
            candle: Candle::seed(60, 100.0, 1.0),
        };
        let frame = ServerFrame::candle("BTC-USD", "1m", &event);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "candle");
        assert_eq!(json["pair"], "BTC-USD");
        assert_eq!(json["granularity"], "1m");
        assert_eq!(json["time"], 60);
        assert_eq!(json["candleType"], "complete");
    }
}
