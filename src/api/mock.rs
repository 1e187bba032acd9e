use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::{FeedEvent, FeedSubscription, FxRate, FxRateSource, PriceSource};
use crate::error::FeedError;
use crate::models::{Candle, Timeframe};

/// Scripted price source for tests and offline runs
///
/// History is served from a fixed table; live events are pushed by the
/// caller through [`MockPriceSource::push`].
#[derive(Clone, Default)]
pub struct MockPriceSource {
    history: HashMap<String, Vec<Candle>>,
    fail_history: bool,
    subscribers: Arc<Mutex<Vec<(String, Timeframe, mpsc::Sender<FeedEvent>)>>>,
}

impl MockPriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(mut self, symbol: &str, candles: Vec<Candle>) -> Self {
        self.history.insert(symbol.to_uppercase(), candles);
        self
    }

    /// Every history request fails with `FeedError::Unavailable`
    pub fn failing_history(mut self) -> Self {
        self.fail_history = true;
        self
    }

    /// Number of subscriptions opened so far
    pub async fn subscription_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Deliver an event to every live subscriber of its symbol and timeframe
    pub async fn push(&self, event: FeedEvent) -> usize {
        let subscribers = self.subscribers.lock().await;
        let mut delivered = 0;
        for (symbol, timeframe, tx) in subscribers.iter() {
            if symbol.eq_ignore_ascii_case(&event.symbol)
                && *timeframe == event.timeframe
                && tx.send(event.clone()).await.is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl PriceSource for MockPriceSource {
    async fn fetch_historical_candles(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        if self.fail_history {
            return Err(FeedError::Unavailable("mock history disabled".to_string()));
        }
        let candles = self
            .history
            .get(&symbol.to_uppercase())
            .cloned()
            .unwrap_or_default();
        let skip = candles.len().saturating_sub(limit);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn subscribe(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        events: mpsc::Sender<FeedEvent>,
    ) -> Result<FeedSubscription, FeedError> {
        self.subscribers
            .lock()
            .await
            .push((symbol.to_string(), timeframe, events));
        Ok(FeedSubscription::detached(symbol, timeframe))
    }
}

/// Replays a list of rates, then repeats the last one
#[derive(Clone, Default)]
pub struct MockFxSource {
    rates: Arc<Mutex<VecDeque<f64>>>,
}

impl MockFxSource {
    pub fn new(rates: Vec<f64>) -> Self {
        Self {
            rates: Arc::new(Mutex::new(rates.into())),
        }
    }
}

#[async_trait]
impl FxRateSource for MockFxSource {
    async fn fetch_rate(&self) -> Result<FxRate, FeedError> {
        let mut rates = self.rates.lock().await;
        let rate = if rates.len() > 1 {
            rates.pop_front()
        } else {
            rates.front().copied()
        };
        rate.map(|rate| FxRate {
            base: "USD".to_string(),
            quote: "RUB".to_string(),
            rate,
        })
        .ok_or_else(|| FeedError::Unavailable("no mock rates".to_string()))
    }
}
