use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// OHLC candlestick; `time` is the bucket start in unix seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    /// Candle where every price equals `price` (fresh bucket, history seed)
    pub fn flat(time: i64, price: f64) -> Self {
        Self {
            time,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    /// OHLC invariant: low <= min(open, close), high >= max(open, close), all positive
    pub fn is_consistent(&self) -> bool {
        self.low > 0.0
            && self.low <= self.open.min(self.close)
            && self.high >= self.open.max(self.close)
            && self.low <= self.high
    }

    /// True if `price` was traded through during this candle
    pub fn contains(&self, price: f64) -> bool {
        self.low <= price && price <= self.high
    }

    /// Fold a new sample into a still-open candle
    pub fn absorb(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }
}

/// Direction of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Spot trade direction (limit orders, conversions)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "BUY"),
            TradeSide::Sell => write!(f, "SELL"),
        }
    }
}

/// How big an order is: a number of units, or an amount of cash to commit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum OrderSize {
    Quantity(f64),
    Notional(f64),
}

impl OrderSize {
    /// Units this size represents at `price`
    pub fn quantity_at(&self, price: f64) -> f64 {
        match *self {
            OrderSize::Quantity(q) => q,
            OrderSize::Notional(n) => n / price,
        }
    }
}

/// Candle interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    S1,
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn seconds(self) -> i64 {
        match self {
            Timeframe::S1 => 1,
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
        }
    }

    /// Exchange-style interval label ("1m", "4h", ...)
    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::S1 => "1s",
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    /// Start of the bucket containing `timestamp`
    pub fn bucket_start(self, timestamp: i64) -> i64 {
        timestamp - timestamp.rem_euclid(self.seconds())
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1s" => Ok(Timeframe::S1),
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!(
                "unknown timeframe '{}', expected one of 1s, 1m, 5m, 15m, 1h, 4h, 1d",
                other
            )),
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

/// A tradable asset as configured at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetConfig {
    pub symbol: String,
    pub price: f64,
    /// Percent move scale per tick (random walk) or per sqrt-second (gbm)
    pub volatility: f64,
}

impl AssetConfig {
    pub fn new(symbol: &str, price: f64, volatility: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            price,
            volatility,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "STOP LOSS"),
            ExitReason::TakeProfit => write!(f, "TAKE PROFIT"),
            ExitReason::Manual => write!(f, "MANUAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// User-facing message for the rendering layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub message: String,
    pub severity: Severity,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candle_consistency() {
        let candle = Candle {
            time: 0,
            open: 100.0,
            high: 105.0,
            low: 98.0,
            close: 103.0,
        };
        assert!(candle.is_consistent());
        assert!(candle.contains(98.0));
        assert!(candle.contains(105.0));
        assert!(!candle.contains(105.5));

        let broken = Candle {
            low: 101.0,
            ..candle
        };
        assert!(!broken.is_consistent());
    }

    #[test]
    fn test_candle_absorb() {
        let mut candle = Candle::flat(60, 100.0);
        candle.absorb(104.0);
        candle.absorb(97.0);
        candle.absorb(99.0);

        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.high, 104.0);
        assert_eq!(candle.low, 97.0);
        assert_eq!(candle.close, 99.0);
        assert!(candle.is_consistent());
    }

    #[test]
    fn test_timeframe_parse_and_bucket() {
        let tf: Timeframe = "5m".parse().unwrap();
        assert_eq!(tf, Timeframe::M5);
        assert_eq!(tf.seconds(), 300);
        assert_eq!(tf.bucket_start(1_000), 900);
        assert_eq!(tf.bucket_start(900), 900);
        assert!("7m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_timeframe_serde_as_label() {
        let json = serde_json::to_string(&Timeframe::H4).unwrap();
        assert_eq!(json, "\"4h\"");
        let back: Timeframe = serde_json::from_str("\"1d\"").unwrap();
        assert_eq!(back, Timeframe::D1);
    }

    #[test]
    fn test_order_size_quantity() {
        assert_eq!(OrderSize::Quantity(3.0).quantity_at(50.0), 3.0);
        assert_eq!(OrderSize::Notional(500.0).quantity_at(50.0), 10.0);
    }
}
