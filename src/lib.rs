// Core modules
pub mod account;
pub mod api;
pub mod config;
pub mod error;
pub mod execution;
pub mod market;
pub mod models;
pub mod persistence;
pub mod runtime;
pub mod session;

// Re-export commonly used types
pub use config::Settings;
pub use error::{FeedError, PersistenceError, SimulatorError, TradeError};
pub use models::*;
pub use runtime::{SessionSummary, Simulator, SimulatorHandle};
pub use session::{SimEvent, TradingSession};

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
