use super::history::CandleHistory;
use crate::models::{Candle, Timeframe};

/// Result of feeding one sample or candle into the aggregator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandleUpdate {
    /// True if a new bucket was opened (previous candle is now final)
    pub is_new_candle: bool,
    pub candle: Candle,
}

/// Buckets price samples into fixed-interval candles for one asset
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    timeframe: Timeframe,
    history: CandleHistory,
}

impl CandleAggregator {
    pub fn new(timeframe: Timeframe, capacity: usize) -> Self {
        Self {
            timeframe,
            history: CandleHistory::new(capacity),
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Fold a price sample into the open candle, or open a new one
    ///
    /// Returns `None` for samples older than the open bucket; finalized
    /// candles are never rewritten.
    pub fn append_sample(&mut self, price: f64, timestamp: i64) -> Option<CandleUpdate> {
        if !(price.is_finite() && price > 0.0) {
            tracing::warn!(price, "Ignoring non-positive price sample");
            return None;
        }

        let bucket = self.timeframe.bucket_start(timestamp);

        if let Some(open) = self.history.latest_mut() {
            if open.time == bucket {
                open.absorb(price);
                return Some(CandleUpdate {
                    is_new_candle: false,
                    candle: *open,
                });
            }
            if open.time > bucket {
                tracing::debug!(timestamp, open = open.time, "Dropping late sample");
                return None;
            }
        }

        let candle = Candle::flat(bucket, price);
        self.history.push(candle);
        Some(CandleUpdate {
            is_new_candle: true,
            candle,
        })
    }

    /// Accept a complete OHLC candle (synthetic generation or external feed)
    ///
    /// Same `time` as the open candle replaces it in place; a later `time`
    /// opens a new candle; anything older is ignored.
    pub fn append_candle(&mut self, candle: Candle) -> Option<CandleUpdate> {
        if !candle.is_consistent() {
            tracing::warn!(?candle, "Ignoring inconsistent candle");
            return None;
        }

        match self.history.latest_mut() {
            Some(open) if open.time == candle.time => {
                *open = candle;
                Some(CandleUpdate {
                    is_new_candle: false,
                    candle,
                })
            }
            Some(open) if open.time > candle.time => None,
            _ => {
                self.history.push(candle);
                Some(CandleUpdate {
                    is_new_candle: true,
                    candle,
                })
            }
        }
    }

    /// Replace history with `candles` (sorted by time, inconsistent ones skipped)
    pub fn seed(&mut self, mut candles: Vec<Candle>) {
        self.history.clear();
        candles.sort_by_key(|c| c.time);
        for candle in candles {
            self.append_candle(candle);
        }
    }

    /// Switch to another timeframe, discarding history
    pub fn reset(&mut self, timeframe: Timeframe) {
        self.timeframe = timeframe;
        self.history.clear();
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.history.latest()
    }

    pub fn candles(&self) -> Vec<Candle> {
        self.history.to_vec()
    }

    pub fn history(&self) -> &CandleHistory {
        &self.history
    }
}
