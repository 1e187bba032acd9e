pub mod aggregator;
pub mod feed;
pub mod generator;
pub mod history;

pub use aggregator::{CandleAggregator, CandleUpdate};
pub use feed::{CandleMode, MarketFeed, MarketUpdate};
pub use generator::{
    AssetDynamics, GeneratorConfig, MarketEvent, PriceGenerator, PriceModel, PriceStep, Shock,
};
pub use history::CandleHistory;
