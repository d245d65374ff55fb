// Shared Redis connection with background reconnect
use redis::aio::MultiplexedConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Lazily reconnecting handle to the shared Redis instance. While the
/// connection is down, dependents degrade to no-ops returning empty.
#[derive(Clone)]
pub struct RedisHandle {
    url: String,
    inner: Arc<RwLock<Option<MultiplexedConnection>>>,
}

impl RedisHandle {
    /// Attempt an initial connection and start the background retry loop.
    /// Never fails: an unreachable Redis leaves the handle disconnected.
    pub async fn connect(url: &str) -> Self {
        let handle = Self {
            url: url.to_string(),
            inner: Arc::new(RwLock::new(None)),
        };

        match handle.try_connect().await {
            Ok(conn) => {
                info!("Connected to Redis at {}", handle.url);
                *handle.inner.write().await = Some(conn);
            }
            Err(e) => {
                warn!("Redis unavailable at {}: {}; retrying in background", handle.url, e);
            }
        }

        let retry = handle.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RECONNECT_INTERVAL).await;
                if retry.inner.read().await.is_some() {
                    continue;
                }
                match retry.try_connect().await {
                    Ok(conn) => {
                        info!("Reconnected to Redis at {}", retry.url);
                        *retry.inner.write().await = Some(conn);
                    }
                    Err(e) => warn!("Redis reconnect failed: {}", e),
                }
            }
        });

        handle
    }

    async fn try_connect(&self) -> redis::RedisResult<MultiplexedConnection> {
        let client = redis::Client::open(self.url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(conn)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn get(&self) -> Option<MultiplexedConnection> {
        self.inner.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// Drop the live connection so the retry loop re-establishes it.
    /// Called by dependents after an operation error.
    pub async fn mark_down(&self) {
        if self.inner.write().await.take().is_some() {
            warn!("Marking Redis connection down");
        }
    }
}
