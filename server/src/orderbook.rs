// Redis-backed order books: snapshot replace, delta apply, throttled
// publication of changes on a pub/sub channel
use redis::AsyncCommands;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use tickerflow_common::{
    BookChange, BookLevel, BookSide, MetricsCollector, OrderBookConfig, Result,
};

use crate::redis_conn::RedisHandle;

#[derive(Debug, Clone)]
struct SnapshotEntry {
    hash: String,
    at: Instant,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BookMetadata {
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_count: usize,
    pub ask_count: usize,
    pub last_update_ms: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FullBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub metadata: Option<BookMetadata>,
}

impl FullBook {
    pub fn empty() -> Self {
        Self {
            bids: Vec::new(),
            asks: Vec::new(),
            metadata: None,
        }
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.bids.first(), self.asks.first()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / 2.0),
            _ => None,
        }
    }
}

/// Authoritative book state lives in Redis; the engine owns only the
/// snapshot-dedup and throttle maps.
pub struct BookEngine {
    redis: RedisHandle,
    config: OrderBookConfig,
    metrics: Arc<MetricsCollector>,
    snapshot_cache: Mutex<HashMap<String, SnapshotEntry>>,
    throttle: Mutex<HashMap<String, Instant>>,
}

fn bids_key(product: &str) -> String {
    format!("book:{product}:bids")
}

fn asks_key(product: &str) -> String {
    format!("book:{product}:asks")
}

fn meta_key(product: &str) -> String {
    format!("book:{product}:meta")
}

pub fn delta_channel(product: &str) -> String {
    format!("orderbook:{product}:delta")
}

/// Field operation a single change maps to; size 0 removes the level.
#[derive(Debug, Clone, PartialEq)]
pub enum LevelOp {
    Remove { side: BookSide, field: String },
    Set { side: BookSide, field: String, value: String },
}

pub fn change_to_op(change: &BookChange) -> LevelOp {
    let field = format_price(change.price);
    if change.size == 0.0 {
        LevelOp::Remove {
            side: change.side,
            field,
        }
    } else {
        LevelOp::Set {
            side: change.side,
            field,
            value: format_price(change.size),
        }
    }
}

pub fn format_price(value: f64) -> String {
    // Plain decimal form round-trips through Redis hash fields.
    format!("{value}")
}

fn sort_bids(levels: &mut [BookLevel]) {
    levels.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
}

fn sort_asks(levels: &mut [BookLevel]) {
    levels.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
}

/// md5 over the top ten levels of each side; identical fresh snapshots are
/// skipped without touching Redis.
pub fn snapshot_hash(bids: &[BookLevel], asks: &[BookLevel]) -> String {
    let mut text = String::new();
    for level in bids.iter().take(10) {
        text.push_str(&format!("{}:{};", format_price(level.price), format_price(level.size)));
    }
    text.push('|');
    for level in asks.iter().take(10) {
        text.push_str(&format!("{}:{};", format_price(level.price), format_price(level.size)));
    }
    format!("{:x}", md5::compute(text.as_bytes()))
}

pub fn parse_level_map(raw: HashMap<String, String>) -> Vec<BookLevel> {
    raw.into_iter()
        .filter_map(|(price, size)| {
            Some(BookLevel {
                price: price.parse().ok()?,
                size: size.parse().ok()?,
            })
        })
        .collect()
}

impl BookEngine {
    pub fn new(redis: RedisHandle, config: OrderBookConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            redis,
            config,
            metrics,
            snapshot_cache: Mutex::new(HashMap::new()),
            throttle: Mutex::new(HashMap::new()),
        }
    }

    /// Staleness gate for snapshot writes: true when the product has no
    /// cache entry or the entry is older than the cache TTL. A fresh entry
    /// debounces every incoming snapshot for the window.
    pub fn has_changed(&self, product: &str) -> bool {
        let cache = self.snapshot_cache.lock().expect("snapshot cache poisoned");
        match cache.get(product) {
            Some(entry)
                if entry.at.elapsed()
                    < Duration::from_secs(self.config.snapshot_cache_ttl_secs) =>
            {
                debug!(
                    "Snapshot cache for {} still fresh (hash {})",
                    product, entry.hash
                );
                false
            }
            _ => true,
        }
    }

    /// Per-product token at the configured minimum interval. True means the
    /// caller should skip. Checked before any Redis write.
    pub fn should_throttle(&self, product: &str) -> bool {
        let min_interval =
            Duration::from_millis(1000 / u64::from(self.config.throttle_rate_per_sec.max(1)));
        let mut throttle = self.throttle.lock().expect("throttle map poisoned");
        let now = Instant::now();
        match throttle.get(product) {
            Some(last) if now.duration_since(*last) < min_interval => true,
            _ => {
                throttle.insert(product.to_string(), now);
                false
            }
        }
    }

    /// Replace the whole book atomically: DEL both sides, write all levels
    /// and the meta blob, refresh the TTLs.
    pub async fn apply_snapshot(
        &self,
        product: &str,
        bids: &[BookLevel],
        asks: &[BookLevel],
    ) -> Result<bool> {
        if !self.has_changed(product) {
            return Ok(false);
        }

        let mut bids = bids.to_vec();
        let mut asks = asks.to_vec();
        sort_bids(&mut bids);
        sort_asks(&mut asks);
        let hash = snapshot_hash(&bids, &asks);

        let Some(mut conn) = self.redis.get().await else {
            return Ok(false);
        };

        let metadata = BookMetadata {
            best_bid: bids.first().map(|l| l.price).unwrap_or(0.0),
            best_ask: asks.first().map(|l| l.price).unwrap_or(0.0),
            bid_count: bids.len(),
            ask_count: asks.len(),
            last_update_ms: chrono::Utc::now().timestamp_millis(),
        };

        let ttl = self.config.ttl_secs as i64;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(bids_key(product)).arg(asks_key(product)).ignore();
        if !bids.is_empty() {
            let mut cmd = pipe.cmd("HSET");
            cmd.arg(bids_key(product));
            for level in &bids {
                cmd.arg(format_price(level.price)).arg(format_price(level.size));
            }
            cmd.ignore();
        }
        if !asks.is_empty() {
            let mut cmd = pipe.cmd("HSET");
            cmd.arg(asks_key(product));
            for level in &asks {
                cmd.arg(format_price(level.price)).arg(format_price(level.size));
            }
            cmd.ignore();
        }
        pipe.cmd("HSET")
            .arg(meta_key(product))
            .arg("data")
            .arg(serde_json::to_string(&metadata)?)
            .ignore();
        pipe.cmd("EXPIRE").arg(bids_key(product)).arg(ttl).ignore();
        pipe.cmd("EXPIRE").arg(asks_key(product)).arg(ttl).ignore();
        pipe.cmd("EXPIRE").arg(meta_key(product)).arg(ttl).ignore();

        if let Err(e) = pipe.query_async::<_, ()>(&mut conn).await {
            self.metrics.record_redis_operation("book_snapshot", false);
            self.redis.mark_down().await;
            return Err(e.into());
        }
        self.metrics.record_redis_operation("book_snapshot", true);

        self.snapshot_cache
            .lock()
            .expect("snapshot cache poisoned")
            .insert(product.to_string(), SnapshotEntry { hash, at: Instant::now() });
        Ok(true)
    }

    /// Apply incremental changes and publish the delta. Skips entirely when
    /// the product is inside its throttle window.
    pub async fn apply_delta(&self, product: &str, changes: &[BookChange]) -> Result<bool> {
        if changes.is_empty() {
            return Ok(false);
        }
        if self.should_throttle(product) {
            debug!("Throttling book delta for {}", product);
            return Ok(false);
        }
        let Some(mut conn) = self.redis.get().await else {
            return Ok(false);
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        for change in changes {
            match change_to_op(change) {
                LevelOp::Remove { side, field } => {
                    let key = match side {
                        BookSide::Bid => bids_key(product),
                        BookSide::Ask => asks_key(product),
                    };
                    pipe.cmd("HDEL").arg(key).arg(field).ignore();
                }
                LevelOp::Set { side, field, value } => {
                    let key = match side {
                        BookSide::Bid => bids_key(product),
                        BookSide::Ask => asks_key(product),
                    };
                    pipe.cmd("HSET").arg(key).arg(field).arg(value).ignore();
                }
            }
        }
        pipe.cmd("HSET")
            .arg(meta_key(product))
            .arg("lastUpdate")
            .arg(chrono::Utc::now().timestamp_millis())
            .ignore();

        if let Err(e) = pipe.query_async::<_, ()>(&mut conn).await {
            self.metrics.record_redis_operation("book_delta", false);
            self.redis.mark_down().await;
            return Err(e.into());
        }
        self.metrics.record_redis_operation("book_delta", true);

        // The stored book moved; the snapshot dedup entry is stale.
        self.snapshot_cache
            .lock()
            .expect("snapshot cache poisoned")
            .remove(product);

        self.publish_delta(product, changes).await;
        Ok(true)
    }

    /// PUBLISH the changed levels, capped per side, for the pub/sub bridge.
    async fn publish_delta(&self, product: &str, changes: &[BookChange]) {
        let Some(mut conn) = self.redis.get().await else {
            return;
        };

        let bids: Vec<_> = changes
            .iter()
            .filter(|c| c.side == BookSide::Bid)
            .take(self.config.publish_depth)
            .map(|c| json!({"price": c.price, "size": c.size}))
            .collect();
        let asks: Vec<_> = changes
            .iter()
            .filter(|c| c.side == BookSide::Ask)
            .take(self.config.publish_depth)
            .map(|c| json!({"price": c.price, "size": c.size}))
            .collect();

        let payload = json!({
            "product": product,
            "ts_ms": chrono::Utc::now().timestamp_millis(),
            "bids": bids,
            "asks": asks,
        });

        let result: redis::RedisResult<i64> = conn
            .publish(delta_channel(product), payload.to_string())
            .await;
        if let Err(e) = result {
            warn!("Failed to publish book delta for {}: {}", product, e);
            self.metrics.record_redis_operation("book_publish", false);
        } else {
            self.metrics.record_redis_operation("book_publish", true);
        }
    }

    /// Full sorted book plus metadata. Empty book when Redis is down.
    pub async fn get_full(&self, product: &str) -> Result<FullBook> {
        let Some(mut conn) = self.redis.get().await else {
            return Ok(FullBook::empty());
        };

        let raw_bids: HashMap<String, String> = conn.hgetall(bids_key(product)).await?;
        let raw_asks: HashMap<String, String> = conn.hgetall(asks_key(product)).await?;
        let meta_json: Option<String> = conn.hget(meta_key(product), "data").await?;

        let mut bids = parse_level_map(raw_bids);
        let mut asks = parse_level_map(raw_asks);
        sort_bids(&mut bids);
        sort_asks(&mut asks);

        let metadata = meta_json.and_then(|m| serde_json::from_str(&m).ok());
        Ok(FullBook { bids, asks, metadata })
    }

    pub async fn get_range(&self, product: &str, min: f64, max: f64) -> Result<FullBook> {
        let mut book = self.get_full(product).await?;
        book.bids.retain(|l| l.price >= min && l.price <= max);
        book.asks.retain(|l| l.price >= min && l.price <= max);
        Ok(book)
    }

    pub async fn get_top(&self, product: &str, count: usize) -> Result<FullBook> {
        let mut book = self.get_full(product).await?;
        book.bids.truncate(count);
        book.asks.truncate(count);
        Ok(book)
    }

    /// Periodic sweep: drop expired entries, then enforce the per-map caps
    /// keeping the most recent.
    pub fn prune(&self) {
        let snapshot_ttl = Duration::from_secs(self.config.snapshot_cache_ttl_secs);
        let throttle_ttl = Duration::from_secs(10);

        let mut cache = self.snapshot_cache.lock().expect("snapshot cache poisoned");
        cache.retain(|_, entry| entry.at.elapsed() < snapshot_ttl);
        if cache.len() > self.config.snapshot_cache_max {
            let mut entries: Vec<_> = cache.iter().map(|(k, v)| (k.clone(), v.at)).collect();
            entries.sort_by_key(|(_, at)| std::cmp::Reverse(*at));
            let keep: std::collections::HashSet<String> = entries
                .into_iter()
                .take(self.config.snapshot_cache_max)
                .map(|(k, _)| k)
                .collect();
            cache.retain(|k, _| keep.contains(k));
        }
        drop(cache);

        let mut throttle = self.throttle.lock().expect("throttle map poisoned");
        throttle.retain(|_, at| at.elapsed() < throttle_ttl);
        if throttle.len() > self.config.throttle_map_max {
            let mut entries: Vec<_> = throttle.iter().map(|(k, v)| (k.clone(), *v)).collect();
            entries.sort_by_key(|(_, at)| std::cmp::Reverse(*at));
            let keep: std::collections::HashSet<String> = entries
                .into_iter()
                .take(self.config.throttle_map_max)
                .map(|(k, _)| k)
                .collect();
            throttle.retain(|k, _| keep.contains(k));
        }
    }

    /// Spawn the 60s pruning sweep.
    pub fn start_pruning(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = Duration::from_secs(engine.config.prune_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                engine.prune();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: f64, size: f64) -> BookLevel {
        BookLevel { price, size }
    }

    /// In-memory mirror of the HDEL/HSET semantics the delta pipeline
    /// issues, used to check the fold independent of Redis.
    fn fold_ops(levels: &mut HashMap<String, String>, ops: &[LevelOp], side: BookSide) {
        for op in ops {
            match op {
                LevelOp::Remove { side: s, field } if *s == side => {
                    levels.remove(field);
                }
                LevelOp::Set { side: s, field, value } if *s == side => {
                    levels.insert(field.clone(), value.clone());
                }
                _ => {}
            }
        }
    }

    #[test]
    fn snapshot_then_delta_fold() {
        // Snapshot bids [(100,1),(99,2)] asks [(101,1)]; deltas remove bid
        // 99 and add ask (102,3).
        let mut bids: HashMap<String, String> = HashMap::new();
        let mut asks: HashMap<String, String> = HashMap::new();
        for l in [level(100.0, 1.0), level(99.0, 2.0)] {
            bids.insert(format_price(l.price), format_price(l.size));
        }
        asks.insert(format_price(101.0), format_price(1.0));

        let ops: Vec<LevelOp> = [
            BookChange { side: BookSide::Bid, price: 99.0, size: 0.0 },
            BookChange { side: BookSide::Ask, price: 102.0, size: 3.0 },
        ]
        .iter()
        .map(change_to_op)
        .collect();

        fold_ops(&mut bids, &ops, BookSide::Bid);
        fold_ops(&mut asks, &ops, BookSide::Ask);

        let mut bid_levels = parse_level_map(bids);
        let mut ask_levels = parse_level_map(asks);
        sort_bids(&mut bid_levels);
        sort_asks(&mut ask_levels);

        assert_eq!(bid_levels, vec![level(100.0, 1.0)]);
        assert_eq!(ask_levels, vec![level(101.0, 1.0), level(102.0, 3.0)]);
        assert_eq!(bid_levels.first().unwrap().price, 100.0); // best_bid
        assert_eq!(ask_levels.first().unwrap().price, 101.0); // best_ask
    }

    #[test]
    fn zero_size_delete_of_missing_price_is_noop() {
        let mut bids: HashMap<String, String> = HashMap::new();
        bids.insert(format_price(100.0), format_price(1.0));
        let ops = vec![change_to_op(&BookChange {
            side: BookSide::Bid,
            price: 98.5,
            size: 0.0,
        })];
        let before = bids.clone();
        fold_ops(&mut bids, &ops, BookSide::Bid);
        assert_eq!(bids, before);
    }

    #[test]
    fn snapshot_hash_covers_top_ten_only() {
        let bids: Vec<BookLevel> = (0..15).map(|i| level(100.0 - i as f64, 1.0)).collect();
        let asks: Vec<BookLevel> = (0..15).map(|i| level(101.0 + i as f64, 1.0)).collect();
        let base = snapshot_hash(&bids, &asks);

        // Changing a level beyond the top ten does not affect the hash.
        let mut deep = bids.clone();
        deep[12].size = 9.0;
        assert_eq!(base, snapshot_hash(&deep, &asks));

        // Changing a top level does.
        let mut top = bids.clone();
        top[0].size = 9.0;
        assert_ne!(base, snapshot_hash(&top, &asks));
    }

    #[test]
    fn identical_snapshots_are_idempotent_in_hash() {
        let bids = vec![level(100.0, 1.0), level(99.0, 2.0)];
        let asks = vec![level(101.0, 1.0)];
        assert_eq!(snapshot_hash(&bids, &asks), snapshot_hash(&bids, &asks));
    }

    #[test]
    fn sorting_orders_bids_desc_asks_asc() {
        let mut bids = vec![level(99.0, 1.0), level(101.0, 1.0), level(100.0, 1.0)];
        let mut asks = vec![level(103.0, 1.0), level(101.0, 1.0), level(102.0, 1.0)];
        sort_bids(&mut bids);
        sort_asks(&mut asks);
        assert_eq!(bids[0].price, 101.0);
        assert_eq!(asks[0].price, 101.0);
        assert!(bids.windows(2).all(|w| w[0].price >= w[1].price));
        assert!(asks.windows(2).all(|w| w[0].price <= w[1].price));
    }

    fn test_config(snapshot_cache_ttl_secs: u64) -> OrderBookConfig {
        OrderBookConfig {
            ttl_secs: 3600,
            snapshot_cache_ttl_secs,
            throttle_rate_per_sec: 10,
            publish_depth: 50,
            snapshot_cache_max: 50,
            throttle_map_max: 100,
            prune_interval_secs: 60,
        }
    }

    #[tokio::test]
    async fn has_changed_is_a_pure_staleness_gate() {
        let redis = RedisHandle::connect("redis://127.0.0.1:1").await;
        let engine = BookEngine::new(
            redis.clone(),
            test_config(5),
            Arc::new(MetricsCollector::new()),
        );

        // No cache entry: apply.
        assert!(engine.has_changed("BTC-USD"));

        // A fresh entry debounces every snapshot for the window, content
        // notwithstanding.
        engine.snapshot_cache.lock().unwrap().insert(
            "BTC-USD".to_string(),
            SnapshotEntry {
                hash: "aaaa".to_string(),
                at: Instant::now(),
            },
        );
        assert!(!engine.has_changed("BTC-USD"));
        assert!(engine.has_changed("ETH-USD"));

        // A zero TTL makes every entry stale immediately.
        let engine = BookEngine::new(redis, test_config(0), Arc::new(MetricsCollector::new()));
        engine.snapshot_cache.lock().unwrap().insert(
            "BTC-USD".to_string(),
            SnapshotEntry {
                hash: "aaaa".to_string(),
                at: Instant::now(),
            },
        );
        assert!(engine.has_changed("BTC-USD"));
    }

    #[test]
    fn mid_price_from_best_levels() {
        let book = FullBook {
            bids: vec![level(100.0, 1.0)],
            asks: vec![level(102.0, 1.0)],
            metadata: None,
        };
        assert_eq!(book.mid(), Some(101.0));
        assert_eq!(FullBook::empty().mid(), None);
    }
}
