use serde::Serialize;
use std::collections::BTreeMap;

use crate::account::TradeStats;
use crate::execution::Position;
use crate::models::{Candle, Notification};

/// Balances as shown to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSnapshot {
    pub cash: f64,
    pub assets: BTreeMap<String, f64>,
    pub stats: TradeStats,
}

/// Everything the rendering layer reacts to
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SimEvent {
    PriceUpdate {
        asset: String,
        price: f64,
    },
    CandleUpdate {
        asset: String,
        candle: Candle,
        is_new_candle: bool,
    },
    PositionChanged {
        asset: String,
        position: Option<Position>,
    },
    BalanceChanged(BalanceSnapshot),
    Notification(Notification),
}
