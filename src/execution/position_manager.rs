use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use crate::account::AccountLedger;
use crate::error::TradeError;
use crate::models::{ExitReason, OrderSize, Side};

/// Closed trades kept in memory for display
const CLOSED_HISTORY: usize = 100;

/// Denominator used for percent P&L
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PnlBasis {
    /// Percent of posted margin (leveraged view)
    Margin,
    /// Percent of entry notional (unleveraged view)
    Notional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: Uuid,
    pub asset: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub margin_used: f64,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn notional(&self) -> f64 {
        self.entry_price * self.quantity
    }

    /// Long: (price - entry) * qty; Short: (entry - price) * qty
    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        (current_price - self.entry_price) * self.quantity * self.side.sign()
    }

    /// P&L as a percentage of margin or of entry notional
    pub fn pnl_percent(&self, current_price: f64, basis: PnlBasis) -> f64 {
        let denominator = match basis {
            PnlBasis::Margin => self.margin_used,
            PnlBasis::Notional => self.notional(),
        };
        if denominator <= 0.0 {
            return 0.0;
        }
        self.unrealized_pnl(current_price) / denominator * 100.0
    }

    /// Realized P&L at `exit_price`; a loss never exceeds the posted margin
    pub fn settle_pnl(&self, exit_price: f64) -> f64 {
        self.unrealized_pnl(exit_price).max(-self.margin_used)
    }

    /// Margin plus capped P&L: what closing now would return to cash
    pub fn equity(&self, current_price: f64) -> f64 {
        self.margin_used + self.settle_pnl(current_price)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedTrade {
    pub position: Position,
    pub exit_price: f64,
    pub pnl: f64,
    pub reason: ExitReason,
    pub closed_at: DateTime<Utc>,
}

/// Parameters of an open action
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub asset: String,
    pub side: Side,
    pub size: OrderSize,
    pub leverage: f64,
}

impl OpenRequest {
    pub fn new(asset: &str, side: Side, size: OrderSize, leverage: f64) -> Self {
        Self {
            asset: asset.to_string(),
            side,
            size,
            leverage,
        }
    }
}

/// Owns open positions and their Closed -> Open -> Closed transitions
pub struct PositionManager {
    positions: Vec<Position>,
    closed: VecDeque<ClosedTrade>,
    max_leverage: f64,
    /// At most one open position for the whole account
    single_position: bool,
    pnl_basis: PnlBasis,
}

impl PositionManager {
    pub fn new(max_leverage: f64, single_position: bool, pnl_basis: PnlBasis) -> Self {
        Self {
            positions: Vec::new(),
            closed: VecDeque::new(),
            max_leverage: max_leverage.max(1.0),
            single_position,
            pnl_basis,
        }
    }

    pub fn pnl_basis(&self) -> PnlBasis {
        self.pnl_basis
    }

    pub fn max_leverage(&self) -> f64 {
        self.max_leverage
    }

    /// Open a position at `price`, debiting `notional / leverage` from cash
    ///
    /// Nothing is mutated unless every check passes.
    pub fn open(
        &mut self,
        ledger: &mut AccountLedger,
        request: OpenRequest,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<&Position, TradeError> {
        if !(price.is_finite() && price > 0.0) {
            return Err(TradeError::InvalidOrderParameters(format!(
                "entry price must be positive, got {}",
                price
            )));
        }
        if !(request.leverage >= 1.0 && request.leverage <= self.max_leverage) {
            return Err(TradeError::InvalidOrderParameters(format!(
                "leverage must be within 1..={}, got {}",
                self.max_leverage, request.leverage
            )));
        }

        let quantity = request.size.quantity_at(price);
        if !(quantity.is_finite() && quantity > 0.0) {
            return Err(TradeError::InvalidAmount(quantity));
        }

        if let Some(existing) = self.blocking_position(&request.asset) {
            return Err(TradeError::PositionAlreadyOpen {
                asset: existing.asset.clone(),
            });
        }

        let notional = price * quantity;
        let margin = notional / request.leverage;
        ledger.debit(margin)?;

        let position = Position {
            id: Uuid::new_v4(),
            asset: request.asset,
            side: request.side,
            entry_price: price,
            quantity,
            leverage: request.leverage,
            margin_used: margin,
            opened_at: now,
        };

        tracing::info!(
            "Opened {} {} {:.4} @ ${:.4} (x{}, margin ${:.2})",
            position.side,
            position.asset,
            position.quantity,
            position.entry_price,
            position.leverage,
            position.margin_used
        );

        self.positions.push(position);
        let index = self.positions.len() - 1;
        Ok(&self.positions[index])
    }

    /// Close the open position on `asset` at `exit_price`
    ///
    /// Credits margin + P&L, records the trade in the ledger stats.
    pub fn close(
        &mut self,
        ledger: &mut AccountLedger,
        asset: &str,
        exit_price: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<ClosedTrade, TradeError> {
        let index = self
            .positions
            .iter()
            .position(|p| p.asset == asset)
            .ok_or_else(|| TradeError::NoOpenPosition {
                asset: asset.to_string(),
            })?;
        if !(exit_price.is_finite() && exit_price > 0.0) {
            return Err(TradeError::InvalidOrderParameters(format!(
                "exit price must be positive, got {}",
                exit_price
            )));
        }

        let pnl = self.positions[index].settle_pnl(exit_price);
        let payout = self.positions[index].margin_used + pnl;
        ledger.credit(payout.max(0.0))?;
        ledger.record_trade(pnl);

        let position = self.positions.remove(index);
        tracing::info!(
            "Closed {} {} @ ${:.4} ({}): P&L ${:.2}",
            position.side,
            position.asset,
            exit_price,
            reason,
            pnl
        );

        let trade = ClosedTrade {
            position,
            exit_price,
            pnl,
            reason,
            closed_at: now,
        };
        self.closed.push_back(trade.clone());
        while self.closed.len() > CLOSED_HISTORY {
            self.closed.pop_front();
        }
        Ok(trade)
    }

    /// Check if we have open position for asset
    pub fn has_open_position(&self, asset: &str) -> bool {
        self.positions.iter().any(|p| p.asset == asset)
    }

    pub fn position(&self, asset: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.asset == asset)
    }

    pub fn open_positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn closed_trades(&self) -> impl Iterator<Item = &ClosedTrade> {
        self.closed.iter()
    }

    pub fn unrealized_pnl(&self, asset: &str, current_price: f64) -> Result<f64, TradeError> {
        self.position(asset)
            .map(|p| p.unrealized_pnl(current_price))
            .ok_or_else(|| TradeError::NoOpenPosition {
                asset: asset.to_string(),
            })
    }

    pub fn pnl_percent(&self, asset: &str, current_price: f64) -> Result<f64, TradeError> {
        self.position(asset)
            .map(|p| p.pnl_percent(current_price, self.pnl_basis))
            .ok_or_else(|| TradeError::NoOpenPosition {
                asset: asset.to_string(),
            })
    }

    /// Sum of what closing every position at `prices` would return
    pub fn open_equity(&self, prices: &HashMap<String, f64>) -> f64 {
        self.positions
            .iter()
            .map(|p| {
                prices
                    .get(&p.asset)
                    .map(|&price| p.equity(price))
                    .unwrap_or(p.margin_used)
            })
            .sum()
    }

    /// Replace open positions with persisted ones
    ///
    /// Invalid entries and duplicates are skipped.
    pub fn restore(&mut self, positions: Vec<Position>) {
        self.positions.clear();
        for position in positions {
            let valid = position.entry_price > 0.0
                && position.quantity > 0.0
                && position.leverage >= 1.0
                && position.margin_used >= 0.0;
            if !valid || self.blocking_position(&position.asset).is_some() {
                tracing::warn!("Skipping invalid persisted position for {}", position.asset);
                continue;
            }
            self.positions.push(position);
        }

        if !self.positions.is_empty() {
            tracing::info!("Restored {} open positions", self.positions.len());
        }
    }

    fn blocking_position(&self, asset: &str) -> Option<&Position> {
        if self.single_position {
            self.positions.first()
        } else {
            self.position(asset)
        }
    }
}
