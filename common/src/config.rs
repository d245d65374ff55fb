// Centralized configuration: TOML file with environment overrides
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FeedError, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub upstream: UpstreamConfig,
    pub orderbook: OrderBookConfig,
    pub updater: UpdaterConfig,
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bounded outbound queue per client socket.
    pub client_queue_size: usize,
    /// Minimum interval between incomplete-candle frames per subscription.
    pub candle_throttle_ms: u64,
    pub shutdown_watchdog_secs: u64,
    /// Sibling trading-bot endpoint; opaque command frames are forwarded here.
    pub bot_ws_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    pub ws_url: String,
    pub rest_url: String,
    /// Exchange API key identifier used as the JWT `sub`/`kid`.
    pub key_name: Option<String>,
    /// EC private key in PEM form.
    pub key_pem: Option<String>,
    pub products: Vec<String>,
    pub connect_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub max_reconnect_attempts: u32,
    pub backoff_multiplier: f64,
    pub max_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrderBookConfig {
    pub ttl_secs: u64,
    pub snapshot_cache_ttl_secs: u64,
    pub throttle_rate_per_sec: u32,
    pub publish_depth: usize,
    pub snapshot_cache_max: usize,
    pub throttle_map_max: usize,
    pub prune_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpdaterConfig {
    pub enabled: bool,
    /// How many trailing buckets each poll fetches.
    pub lookback_buckets: usize,
    pub min_request_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeatureFlags {
    pub book_cache_enabled: bool,
    pub redis_storage_enabled: bool,
}

impl Config {
    /// Load configuration from file and environment variables.
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("TICKERFLOW_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            toml::from_str(&contents)
                .map_err(|e| FeedError::Config(format!("{config_path}: {e}")))?
        } else {
            Self::default()
        };

        config.override_from_env();
        config.validate()?;
        Ok(config)
    }

    fn override_from_env(&mut self) {
        if let Ok(host) = std::env::var("BIND_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("BIND_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.redis.url = url;
        }
        if let Ok(url) = std::env::var("UPSTREAM_WS_URL") {
            self.upstream.ws_url = url;
        }
        if let Ok(url) = std::env::var("UPSTREAM_REST_URL") {
            self.upstream.rest_url = url;
        }
        if let Ok(name) = std::env::var("EXCHANGE_KEY_NAME") {
            self.upstream.key_name = Some(name);
        }
        if let Ok(pem) = std::env::var("EXCHANGE_KEY_PEM") {
            self.upstream.key_pem = Some(pem);
        }
        if let Ok(url) = std::env::var("BOT_WS_URL") {
            self.server.bot_ws_url = Some(url);
        }
        if let Ok(products) = std::env::var("PRODUCTS") {
            let parsed: Vec<String> = products
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.upstream.products = parsed;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.upstream.products.is_empty() {
            return Err(FeedError::Config("no upstream products configured".into()));
        }
        if self.server.client_queue_size == 0 {
            return Err(FeedError::Config("client_queue_size must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 4290,
                client_queue_size: 256,
                candle_throttle_ms: 1000,
                shutdown_watchdog_secs: 5,
                bot_ws_url: None,
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
            },
            upstream: UpstreamConfig {
                ws_url: "wss://advanced-trade-ws.coinbase.com".to_string(),
                rest_url: "https://api.coinbase.com".to_string(),
                key_name: None,
                key_pem: None,
                products: vec!["BTC-USD".to_string()],
                connect_timeout_secs: 10,
                reconnect_delay_secs: 1,
                max_reconnect_attempts: 5,
                backoff_multiplier: 2.0,
                max_backoff_secs: 60,
            },
            orderbook: OrderBookConfig {
                ttl_secs: 3600,
                snapshot_cache_ttl_secs: 5,
                throttle_rate_per_sec: 10,
                publish_depth: 50,
                snapshot_cache_max: 50,
                throttle_map_max: 100,
                prune_interval_secs: 60,
            },
            updater: UpdaterConfig {
                enabled: true,
                lookback_buckets: 20,
                min_request_interval_ms: 100,
            },
            features: FeatureFlags {
                book_cache_enabled: true,
                redis_storage_enabled: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.client_queue_size, 256);
        assert_eq!(config.upstream.max_reconnect_attempts, 5);
    }

    #[test]
    fn toml_round_trip() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.upstream.products, config.upstream.products);
    }
}
