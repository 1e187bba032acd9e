use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::account::{Deposit, LeaderboardEntry, TradeStats};
use crate::error::PersistenceError;
use crate::execution::{ConditionalOrder, Position};
use crate::models::Timeframe;

pub const KEY_BALANCE: &str = "balance";
pub const KEY_ASSETS: &str = "assets";
pub const KEY_POSITION: &str = "position";
pub const KEY_STATS: &str = "stats";
pub const KEY_STOP_LOSS: &str = "stopLoss";
pub const KEY_TAKE_PROFIT: &str = "takeProfit";
pub const KEY_ORDERS: &str = "orders";
pub const KEY_LEVERAGE: &str = "leverage";
pub const KEY_TIMEFRAME: &str = "timeframe";
pub const KEY_DEPOSITS: &str = "deposits";
pub const KEY_LEADERBOARD: &str = "leaderboard";

pub const ALL_KEYS: [&str; 11] = [
    KEY_BALANCE,
    KEY_ASSETS,
    KEY_POSITION,
    KEY_STATS,
    KEY_STOP_LOSS,
    KEY_TAKE_PROFIT,
    KEY_ORDERS,
    KEY_LEVERAGE,
    KEY_TIMEFRAME,
    KEY_DEPOSITS,
    KEY_LEADERBOARD,
];

/// Everything persisted between sessions; `None` means "keep the default"
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredState {
    pub balance: Option<f64>,
    pub assets: Option<BTreeMap<String, f64>>,
    pub positions: Option<Vec<Position>>,
    pub stats: Option<TradeStats>,
    pub stop_loss: Option<BTreeMap<String, f64>>,
    pub take_profit: Option<BTreeMap<String, f64>>,
    pub orders: Option<Vec<ConditionalOrder>>,
    pub leverage: Option<f64>,
    pub timeframe: Option<Timeframe>,
    pub deposits: Option<Vec<Deposit>>,
    pub leaderboard: Option<Vec<LeaderboardEntry>>,
}

impl StoredState {
    /// Encode every present field as a JSON string value
    pub fn to_values(&self) -> Result<HashMap<String, String>, PersistenceError> {
        let mut values = HashMap::new();
        put(&mut values, KEY_BALANCE, &self.balance)?;
        put(&mut values, KEY_ASSETS, &self.assets)?;
        put(&mut values, KEY_POSITION, &self.positions)?;
        put(&mut values, KEY_STATS, &self.stats)?;
        put(&mut values, KEY_STOP_LOSS, &self.stop_loss)?;
        put(&mut values, KEY_TAKE_PROFIT, &self.take_profit)?;
        put(&mut values, KEY_ORDERS, &self.orders)?;
        put(&mut values, KEY_LEVERAGE, &self.leverage)?;
        put(&mut values, KEY_TIMEFRAME, &self.timeframe)?;
        put(&mut values, KEY_DEPOSITS, &self.deposits)?;
        put(&mut values, KEY_LEADERBOARD, &self.leaderboard)?;
        Ok(values)
    }

    /// Decode field by field; malformed fields are logged and skipped
    pub fn from_values(values: &HashMap<String, String>) -> Self {
        Self {
            balance: take(values, KEY_BALANCE),
            assets: take(values, KEY_ASSETS),
            positions: take(values, KEY_POSITION),
            stats: take(values, KEY_STATS),
            stop_loss: take(values, KEY_STOP_LOSS),
            take_profit: take(values, KEY_TAKE_PROFIT),
            orders: take(values, KEY_ORDERS),
            leverage: take(values, KEY_LEVERAGE),
            timeframe: take(values, KEY_TIMEFRAME),
            deposits: take(values, KEY_DEPOSITS),
            leaderboard: take(values, KEY_LEADERBOARD),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == StoredState::default()
    }
}

fn put<T: Serialize>(
    values: &mut HashMap<String, String>,
    key: &str,
    value: &Option<T>,
) -> Result<(), PersistenceError> {
    if let Some(value) = value {
        values.insert(key.to_string(), serde_json::to_string(value)?);
    }
    Ok(())
}

fn take<T: DeserializeOwned>(values: &HashMap<String, String>, key: &str) -> Option<T> {
    let raw = values.get(key)?;
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Ignoring malformed stored field '{}': {}", key, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerant_decoding() {
        let values = HashMap::from([
            (KEY_BALANCE.to_string(), "1234.5".to_string()),
            (KEY_STATS.to_string(), "{not json".to_string()),
            (
                KEY_ASSETS.to_string(),
                r#"{"VKoin": 2.5}"#.to_string(),
            ),
            (KEY_TIMEFRAME.to_string(), r#""15m""#.to_string()),
            (KEY_LEVERAGE.to_string(), r#""ten""#.to_string()),
        ]);

        let state = StoredState::from_values(&values);
        assert_eq!(state.balance, Some(1234.5));
        assert_eq!(state.stats, None);
        assert_eq!(state.assets.unwrap()["VKoin"], 2.5);
        assert_eq!(state.timeframe, Some(Timeframe::M15));
        assert_eq!(state.leverage, None);
        assert!(state.positions.is_none());
    }

    #[test]
    fn test_stats_wire_format() {
        let state = StoredState {
            stats: Some(TradeStats {
                total_trades: 3,
                successful_trades: 2,
                total_profit: 42.0,
            }),
            ..StoredState::default()
        };
        let values = state.to_values().unwrap();
        assert_eq!(values.len(), 1);

        let json: serde_json::Value = serde_json::from_str(&values[KEY_STATS]).unwrap();
        assert_eq!(json["totalTrades"], 3);
        assert_eq!(json["successfulTrades"], 2);
        assert_eq!(json["totalProfit"], 42.0);
    }

    #[test]
    fn test_empty_state() {
        assert!(StoredState::default().is_empty());
        assert!(StoredState::from_values(&HashMap::new()).is_empty());
        assert!(StoredState::default().to_values().unwrap().is_empty());
    }
}
