// Redis candle store: day-bucketed keys with per-granularity retention
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use tickerflow_common::{Candle, Granularity, MetricsCollector, Result};

use crate::redis_conn::RedisHandle;

const DAY_SECS: i64 = 86_400;
const WEEK_SECS: i64 = 604_800;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreMetadata {
    #[serde(rename = "firstTimestamp")]
    pub first_timestamp: i64,
    #[serde(rename = "lastTimestamp")]
    pub last_timestamp: i64,
    #[serde(rename = "totalCandles")]
    pub total_candles: i64,
}

pub fn day_floor(ts: i64) -> i64 {
    ts - ts.rem_euclid(DAY_SECS)
}

pub fn week_floor(ts: i64) -> i64 {
    ts - ts.rem_euclid(WEEK_SECS)
}

pub fn candles_key(product: &str, granularity: Granularity, day: i64) -> String {
    format!("candles:{product}:{}:{day}", granularity.label())
}

pub fn meta_key(product: &str, granularity: Granularity) -> String {
    format!("meta:{product}:{}", granularity.label())
}

pub fn checkpoint_key(product: &str, granularity: Granularity, week: i64) -> String {
    format!("checkpoint:{product}:{}:{week}", granularity.label())
}

/// Day keys intersecting the inclusive range `[start, end]`.
pub fn day_keys_in_range(start: i64, end: i64) -> Vec<i64> {
    if end < start {
        return Vec::new();
    }
    let mut days = Vec::new();
    let mut day = day_floor(start);
    while day <= end {
        days.push(day);
        day += DAY_SECS;
    }
    days
}

/// Candles persist in Redis hashes keyed by `open_ts` inside day buckets,
/// so re-storing the same bucket is an upsert.
pub struct CandleStore {
    redis: RedisHandle,
    metrics: Arc<MetricsCollector>,
    enabled: bool,
}

impl CandleStore {
    pub fn new(redis: RedisHandle, metrics: Arc<MetricsCollector>, enabled: bool) -> Self {
        Self {
            redis,
            metrics,
            enabled,
        }
    }

    /// Upsert a batch of candles, refresh TTLs and maintain the metadata
    /// blob. No-op while storage is disabled or Redis is down.
    pub async fn store(
        &self,
        product: &str,
        granularity: Granularity,
        candles: &[Candle],
    ) -> Result<usize> {
        if !self.enabled || candles.is_empty() {
            return Ok(0);
        }
        let Some(mut conn) = self.redis.get().await else {
            return Ok(0);
        };

        let started = Instant::now();

        // Group by day bucket so each hash gets one HSET.
        let mut by_day: HashMap<i64, Vec<&Candle>> = HashMap::new();
        for candle in candles {
            by_day.entry(day_floor(candle.open_ts)).or_default().push(candle);
        }

        let ttl = granularity.retention_days() * DAY_SECS;
        let mut added_total: i64 = 0;
        for (day, day_candles) in by_day {
            let key = candles_key(product, granularity, day);
            let mut cmd = redis::cmd("HSET");
            cmd.arg(&key);
            for candle in day_candles {
                cmd.arg(candle.open_ts).arg(serde_json::to_string(candle)?);
            }
            let added: i64 = match cmd.query_async(&mut conn).await {
                Ok(n) => n,
                Err(e) => {
                    self.metrics.record_redis_operation("candle_store", false);
                    self.redis.mark_down().await;
                    return Err(e.into());
                }
            };
            added_total += added;
            let _: bool = conn.expire(&key, ttl).await?;
        }

        // Maintain first/last/count in the meta blob.
        let meta_field: Option<String> = conn.hget(meta_key(product, granularity), "data").await?;
        let mut meta: StoreMetadata = meta_field
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or_default();
        let batch_first = candles.iter().map(|c| c.open_ts).min().unwrap_or(0);
        let batch_last = candles.iter().map(|c| c.open_ts).max().unwrap_or(0);
        if meta.total_candles == 0 {
            meta.first_timestamp = batch_first;
            meta.last_timestamp = batch_last;
        } else {
            meta.first_timestamp = meta.first_timestamp.min(batch_first);
            meta.last_timestamp = meta.last_timestamp.max(batch_last);
        }
        meta.total_candles += added_total;
        let _: i64 = conn
            .hset(
                meta_key(product, granularity),
                "data",
                serde_json::to_string(&meta)?,
            )
            .await?;

        self.metrics.record_redis_operation("candle_store", true);
        self.metrics
            .record_redis_latency(started.elapsed().as_millis() as f64, "candle_store");
        debug!(
            "Stored {} candle(s) for {} {} ({} new)",
            candles.len(),
            product,
            granularity.label(),
            added_total
        );
        Ok(candles.len())
    }

    /// All candles with `open_ts` inside `[start_ts, end_ts]`, sorted
    /// ascending and deduplicated by `open_ts`.
    pub async fn get_range(
        &self,
        product: &str,
        granularity: Granularity,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<Vec<Candle>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let Some(mut conn) = self.redis.get().await else {
            return Ok(Vec::new());
        };

        let mut candles = Vec::new();
        for day in day_keys_in_range(start_ts, end_ts) {
            let key = candles_key(product, granularity, day);
            let raw: HashMap<String, String> = conn.hgetall(&key).await?;
            for (_, value) in raw {
                match serde_json::from_str::<Candle>(&value) {
                    Ok(candle) => {
                        if candle.open_ts >= start_ts && candle.open_ts <= end_ts {
                            candles.push(candle);
                        }
                    }
                    Err(e) => warn!("Skipping unparseable candle in {}: {}", key, e),
                }
            }
        }

        candles.sort_by_key(|c| c.open_ts);
        candles.dedup_by_key(|c| c.open_ts);
        Ok(candles)
    }

    pub async fn get_metadata(
        &self,
        product: &str,
        granularity: Granularity,
    ) -> Result<Option<StoreMetadata>> {
        if !self.enabled {
            return Ok(None);
        }
        let Some(mut conn) = self.redis.get().await else {
            return Ok(None);
        };
        let meta_field: Option<String> = conn.hget(meta_key(product, granularity), "data").await?;
        Ok(meta_field.and_then(|m| serde_json::from_str(&m).ok()))
    }

    /// Drop whole day buckets older than the cutoff and shrink the meta
    /// counters accordingly.
    pub async fn delete_older_than(
        &self,
        product: &str,
        granularity: Granularity,
        cutoff_ts: i64,
    ) -> Result<i64> {
        if !self.enabled {
            return Ok(0);
        }
        let Some(mut conn) = self.redis.get().await else {
            return Ok(0);
        };

        let Some(mut meta) = self.get_metadata(product, granularity).await? else {
            return Ok(0);
        };
        let cutoff_day = day_floor(cutoff_ts);
        if day_floor(meta.first_timestamp) >= cutoff_day {
            return Ok(0);
        }

        let mut removed: i64 = 0;
        let mut day = day_floor(meta.first_timestamp);
        while day < cutoff_day {
            let key = candles_key(product, granularity, day);
            let count: i64 = conn.hlen(&key).await?;
            if count > 0 {
                let _: i64 = conn.del(&key).await?;
                removed += count;
            }
            day += DAY_SECS;
        }

        if removed > 0 {
            meta.total_candles = (meta.total_candles - removed).max(0);
            meta.first_timestamp = meta.first_timestamp.max(cutoff_day);
            let _: i64 = conn
                .hset(
                    meta_key(product, granularity),
                    "data",
                    serde_json::to_string(&meta)?,
                )
                .await?;
            debug!(
                "Pruned {} candle(s) for {} {} below {}",
                removed,
                product,
                granularity.label(),
                cutoff_ts
            );
        }
        Ok(removed)
    }

    /// Weekly validation checkpoint: candle count and bounds for the week
    /// the batch landed in.
    pub async fn write_checkpoint(
        &self,
        product: &str,
        granularity: Granularity,
        batch_last_ts: i64,
        count: usize,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let Some(mut conn) = self.redis.get().await else {
            return Ok(());
        };
        let week = week_floor(batch_last_ts);
        let key = checkpoint_key(product, granularity, week);
        let payload = serde_json::json!({
            "week": week,
            "count": count,
            "lastTimestamp": batch_last_ts,
            "writtenAt": chrono::Utc::now().timestamp(),
        });
        let _: () = conn.set(&key, payload.to_string()).await?;
        let _: bool = conn
            .expire(&key, granularity.retention_days() * DAY_SECS)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_floor_and_keys() {
        assert_eq!(day_floor(0), 0);
        assert_eq!(day_floor(86_399), 0);
        assert_eq!(day_floor(86_400), 86_400);
        assert_eq!(day_floor(90_000), 86_400);
        assert_eq!(
            candles_key("BTC-USD", Granularity::OneMinute, 86_400),
            "candles:BTC-USD:1m:86400"
        );
        assert_eq!(meta_key("BTC-USD", Granularity::OneHour), "meta:BTC-USD:1h");
        assert_eq!(
            checkpoint_key("BTC-USD", Granularity::OneDay, 604_800),
            "checkpoint:BTC-USD:1d:604800"
        );
    }

    #[test]
    fn week_floor_aligns_to_epoch_weeks() {
        assert_eq!(week_floor(0), 0);
        assert_eq!(week_floor(604_799), 0);
        assert_eq!(week_floor(604_800), 604_800);
    }

    #[test]
    fn range_day_enumeration() {
        // A range inside one day touches one key.
        assert_eq!(day_keys_in_range(3_600, 7_200), vec![0]);
        // Spanning midnight touches both days.
        assert_eq!(day_keys_in_range(80_000, 90_000), vec![0, 86_400]);
        // Multi-day span enumerates every day bucket.
        assert_eq!(
            day_keys_in_range(0, 2 * 86_400),
            vec![0, 86_400, 2 * 86_400]
        );
        // Inverted range is empty.
        assert!(day_keys_in_range(100, 50).is_empty());
    }

    #[test]
    fn retention_table() {
        assert_eq!(Granularity::OneMinute.retention_days(), 7);
        assert_eq!(Granularity::FiveMinutes.retention_days(), 30);
        assert_eq!(Granularity::FifteenMinutes.retention_days(), 60);
        assert_eq!(Granularity::ThirtyMinutes.retention_days(), 90);
        assert_eq!(Granularity::OneHour.retention_days(), 180);
        assert_eq!(Granularity::FourHours.retention_days(), 365);
        assert_eq!(Granularity::SixHours.retention_days(), 365);
        assert_eq!(Granularity::TwelveHours.retention_days(), 365);
        assert_eq!(Granularity::OneDay.retention_days(), 1825);
    }

    #[test]
    fn metadata_serialization_uses_store_field_names() {
        let meta = StoreMetadata {
            first_timestamp: 100,
            last_timestamp: 200,
            total_candles: 3,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["firstTimestamp"], 100);
        assert_eq!(json["lastTimestamp"], 200);
        assert_eq!(json["totalCandles"], 3);
    }
}
