pub mod binance;
pub mod fx;
mod http;
pub mod mock;

pub use binance::BinanceClient;
pub use fx::FxClient;
pub use mock::{MockFxSource, MockPriceSource};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::FeedError;
use crate::models::{Candle, Timeframe};

/// Something pushed by a live price subscription
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub kind: FeedEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEventKind {
    /// Current state of a candle; `is_final` once the exchange closed it
    Candle { candle: Candle, is_final: bool },
    /// Connection went up or down
    Status { connected: bool, text: String },
}

impl FeedEvent {
    pub fn candle(symbol: &str, timeframe: Timeframe, candle: Candle, is_final: bool) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            kind: FeedEventKind::Candle { candle, is_final },
        }
    }

    pub fn status(symbol: &str, timeframe: Timeframe, connected: bool, text: impl Into<String>) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            kind: FeedEventKind::Status {
                connected,
                text: text.into(),
            },
        }
    }
}

/// Running subscription; the background task is aborted when this is dropped
#[derive(Debug)]
pub struct FeedSubscription {
    symbol: String,
    timeframe: Timeframe,
    handle: Option<JoinHandle<()>>,
}

impl FeedSubscription {
    pub fn new(symbol: &str, timeframe: Timeframe, handle: JoinHandle<()>) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            handle: Some(handle),
        }
    }

    /// Subscription with no background task (mock sources)
    pub fn detached(symbol: &str, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            handle: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::debug!("Closed {} {} subscription", self.symbol, self.timeframe);
        }
    }
}

/// External candle source (exchange klines)
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Most recent `limit` closed candles, oldest first
    async fn fetch_historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError>;

    /// Stream live candles for `symbol` into `events` until the subscription is dropped
    async fn subscribe(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        events: mpsc::Sender<FeedEvent>,
    ) -> Result<FeedSubscription, FeedError>;
}

/// Polled currency pair quote
#[derive(Debug, Clone, PartialEq)]
pub struct FxRate {
    pub base: String,
    pub quote: String,
    pub rate: f64,
}

#[async_trait]
pub trait FxRateSource: Send + Sync {
    async fn fetch_rate(&self) -> Result<FxRate, FeedError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscription_aborts_task_on_drop() {
        let (alive_tx, alive_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _alive = alive_tx;
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });

        let sub = FeedSubscription::new("BTCUSDT", Timeframe::M1, handle);
        assert!(!sub.is_finished());
        drop(sub);

        // The sender is dropped together with the aborted task
        assert!(alive_rx.await.is_err());
    }

    #[test]
    fn test_detached_subscription_is_finished() {
        let sub = FeedSubscription::detached("BTCUSDT", Timeframe::H1);
        assert!(sub.is_finished());
        assert_eq!(sub.symbol(), "BTCUSDT");
        assert_eq!(sub.timeframe(), Timeframe::H1);
    }
}
