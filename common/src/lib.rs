// Shared vocabulary for the tickerflow market-data services
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use config::*;
pub use error::*;
pub use metrics::MetricsCollector;
pub use types::*;
