// Error types for the tickerflow services
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("System time error: {0}")]
    SystemTime(#[from] std::time::SystemTimeError),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Channel send error")]
    ChannelSend,

    #[error("Credential material missing: {0}")]
    CredentialMissing(String),

    #[error("Token signing failed: {0}")]
    SigningFailed(#[from] jsonwebtoken::errors::Error),

    #[error("Upstream rejected authentication")]
    AuthRejected,

    #[error("Rate limited by upstream REST")]
    RateLimited,

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, FeedError>;
