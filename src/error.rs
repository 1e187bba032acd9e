use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Expected business outcomes of a trade request; none of these mutate state
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TradeError {
    #[error("Insufficient funds: required {required:.2}, available {available:.2}")]
    InsufficientFunds { required: f64, available: f64 },
    #[error("No open position for {asset}")]
    NoOpenPosition { asset: String },
    #[error("Already have open position for {asset}")]
    PositionAlreadyOpen { asset: String },
    #[error("Invalid order parameters: {0}")]
    InvalidOrderParameters(String),
    #[error("Unknown asset: {0}")]
    UnknownAsset(String),
    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),
    #[error("Invalid amount: {0}")]
    InvalidAmount(f64),
}

/// External price source failures; the market falls back to synthetic prices
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Feed unavailable: {0}")]
    Unavailable(String),
    #[error("Feed read timed out after {0:?}")]
    Timeout(Duration),
    #[error("Feed protocol error: {0}")]
    Protocol(String),
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FeedError::Unavailable(format!("request timed out: {}", err))
        } else if err.is_decode() {
            FeedError::Protocol(err.to_string())
        } else {
            FeedError::Unavailable(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage operation timed out")]
    Timeout,
}

impl From<redis::RedisError> for PersistenceError {
    fn from(err: redis::RedisError) -> Self {
        PersistenceError::Backend(err.to_string())
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        PersistenceError::Backend(err.to_string())
    }
}

/// Failure of a request sent to a running simulator
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulatorError {
    #[error(transparent)]
    Trade(#[from] TradeError),
    #[error("Simulator is not running")]
    Stopped,
}
