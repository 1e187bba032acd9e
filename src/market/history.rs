use crate::models::Candle;
use std::collections::VecDeque;

/// Rolling window of candles for one asset
///
/// The last element is the still-open candle; when the window is full the
/// oldest candle is evicted first.
#[derive(Debug, Clone)]
pub struct CandleHistory {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl CandleHistory {
    /// Create a new history
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of candles to keep (at least 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            candles: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a candle, returning the evicted one if the window was full
    pub fn push(&mut self, candle: Candle) -> Option<Candle> {
        self.candles.push_back(candle);
        if self.candles.len() > self.capacity {
            self.candles.pop_front()
        } else {
            None
        }
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn latest_mut(&mut self) -> Option<&mut Candle> {
        self.candles.back_mut()
    }

    /// The N most recent candles, oldest first
    pub fn recent(&self, n: usize) -> Vec<Candle> {
        let skip = self.candles.len().saturating_sub(n);
        self.candles.iter().skip(skip).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }

    pub fn to_vec(&self) -> Vec<Candle> {
        self.candles.iter().copied().collect()
    }

    pub fn clear(&mut self) {
        self.candles.clear();
    }
}
