use chrono::Utc;
use coinsim::account::{AccountLedger, Holding, SECONDS_PER_YEAR};
use coinsim::execution::{
    OpenRequest, OrderKind, OrderManager, PnlBasis, PositionManager, StopValidation,
};
use coinsim::{Candle, ExitReason, OrderSize, Side, TradeError};

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9 * b.abs().max(1.0)
}

fn desk(cash: f64) -> (PositionManager, OrderManager, AccountLedger) {
    (
        PositionManager::new(100.0, false, PnlBasis::Margin),
        OrderManager::new(StopValidation::Strict, 0.02),
        AccountLedger::new(cash, 0.005),
    )
}

#[test]
fn test_long_round_trip_with_profit() {
    let (mut positions, _, mut ledger) = desk(1000.0);
    let now = Utc::now();

    let position = positions
        .open(
            &mut ledger,
            OpenRequest::new("VKoin", Side::Long, OrderSize::Quantity(10.0), 1.0),
            100.0,
            now,
        )
        .unwrap()
        .clone();
    assert!(approx(ledger.cash(), 0.0));
    assert!(approx(position.unrealized_pnl(110.0), 100.0));

    let trade = positions
        .close(&mut ledger, "VKoin", 110.0, ExitReason::Manual, now)
        .unwrap();
    assert!(approx(trade.pnl, 100.0));
    assert!(approx(ledger.cash(), 1100.0));

    let stats = ledger.stats();
    assert_eq!(stats.total_trades, 1);
    assert_eq!(stats.successful_trades, 1);
    assert!(approx(stats.total_profit, 100.0));
}

#[test]
fn test_short_unrealized_pnl() {
    let (mut positions, _, mut ledger) = desk(10_000.0);
    let position = positions
        .open(
            &mut ledger,
            OpenRequest::new("Memecoin", Side::Short, OrderSize::Quantity(5.0), 1.0),
            200.0,
            Utc::now(),
        )
        .unwrap();
    assert!(approx(position.unrealized_pnl(150.0), 250.0));
    assert!(approx(position.unrealized_pnl(210.0), -50.0));
}

#[test]
fn test_open_close_same_price_is_neutral() {
    let (mut positions, _, mut ledger) = desk(1000.0);
    let now = Utc::now();
    positions
        .open(
            &mut ledger,
            OpenRequest::new("VKoin", Side::Long, OrderSize::Notional(400.0), 4.0),
            100.0,
            now,
        )
        .unwrap();
    assert!(approx(ledger.cash(), 900.0));

    let trade = positions
        .close(&mut ledger, "VKoin", 100.0, ExitReason::Manual, now)
        .unwrap();
    assert_eq!(trade.pnl, 0.0);
    assert!(approx(ledger.cash(), 1000.0));
    assert_eq!(ledger.stats().successful_trades, 0);
}

#[test]
fn test_insufficient_funds_mutates_nothing() {
    let (mut positions, _, mut ledger) = desk(1000.0);
    let before_cash = ledger.cash();
    let before_assets = ledger.asset_balances().clone();

    let err = positions
        .open(
            &mut ledger,
            OpenRequest::new("VKoin", Side::Long, OrderSize::Notional(5000.0), 2.0),
            100.0,
            Utc::now(),
        )
        .unwrap_err();
    assert!(matches!(err, TradeError::InsufficientFunds { .. }));
    assert_eq!(ledger.cash(), before_cash);
    assert_eq!(ledger.asset_balances(), &before_assets);
    assert!(positions.open_positions().is_empty());
    assert_eq!(ledger.stats().total_trades, 0);
}

#[test]
fn test_double_close_is_reported() {
    let (mut positions, _, mut ledger) = desk(1000.0);
    let now = Utc::now();
    positions
        .open(
            &mut ledger,
            OpenRequest::new("VKoin", Side::Long, OrderSize::Quantity(1.0), 1.0),
            100.0,
            now,
        )
        .unwrap();
    positions
        .close(&mut ledger, "VKoin", 100.0, ExitReason::Manual, now)
        .unwrap();

    let again = positions.close(&mut ledger, "VKoin", 100.0, ExitReason::Manual, now);
    assert_eq!(
        again.unwrap_err(),
        TradeError::NoOpenPosition {
            asset: "VKoin".to_string()
        }
    );
    assert_eq!(ledger.stats().total_trades, 1);
}

#[test]
fn test_stop_loss_triggers_exactly_once() {
    let (mut positions, mut orders, mut ledger) = desk(1000.0);
    let now = Utc::now();
    let position = positions
        .open(
            &mut ledger,
            OpenRequest::new("VKoin", Side::Long, OrderSize::Quantity(5.0), 1.0),
            100.0,
            now,
        )
        .unwrap()
        .clone();
    orders.set_stop_loss(&position, 95.0, now).unwrap();

    let crossing = Candle {
        time: 60,
        open: 99.0,
        high: 99.5,
        low: 94.0,
        close: 96.0,
    };
    let triggers = orders.on_candle("VKoin", &crossing);
    assert_eq!(triggers.len(), 1);
    assert!(matches!(triggers[0].order.kind, OrderKind::StopLoss { .. }));
    assert_eq!(triggers[0].fill_price, 95.0);

    positions
        .close(
            &mut ledger,
            "VKoin",
            triggers[0].fill_price,
            ExitReason::StopLoss,
            now,
        )
        .unwrap();
    assert_eq!(ledger.stats().total_trades, 1);
    assert!(approx(ledger.cash(), 975.0));

    // Next candle crosses again but the order is gone
    let again = Candle {
        time: 120,
        open: 96.0,
        high: 96.0,
        low: 90.0,
        close: 91.0,
    };
    assert!(orders.on_candle("VKoin", &again).is_empty());
    assert!(orders.orders().is_empty());
}

#[test]
fn test_short_take_profit_uses_low() {
    let (mut positions, mut orders, mut ledger) = desk(1000.0);
    let now = Utc::now();
    let position = positions
        .open(
            &mut ledger,
            OpenRequest::new("VKoin", Side::Short, OrderSize::Quantity(2.0), 1.0),
            100.0,
            now,
        )
        .unwrap()
        .clone();
    orders.set_take_profit(&position, 90.0, now).unwrap();

    // Close stays above the target; only the wick reaches it
    let wick = Candle {
        time: 60,
        open: 98.0,
        high: 99.0,
        low: 89.5,
        close: 97.0,
    };
    let triggers = orders.on_candle("VKoin", &wick);
    assert_eq!(triggers.len(), 1);
    assert!(matches!(triggers[0].order.kind, OrderKind::TakeProfit { .. }));
}

#[test]
fn test_invalid_stop_strict_vs_clamp() {
    let (mut positions, mut strict, mut ledger) = desk(1000.0);
    let now = Utc::now();
    let position = positions
        .open(
            &mut ledger,
            OpenRequest::new("VKoin", Side::Long, OrderSize::Quantity(1.0), 1.0),
            100.0,
            now,
        )
        .unwrap()
        .clone();

    assert!(matches!(
        strict.set_stop_loss(&position, 105.0, now),
        Err(TradeError::InvalidOrderParameters(_))
    ));

    let mut clamping = OrderManager::new(StopValidation::Clamp, 0.02);
    let order = clamping.set_stop_loss(&position, 105.0, now).unwrap();
    assert!(approx(order.trigger_price, 98.0));
    let order = clamping.set_take_profit(&position, 90.0, now).unwrap();
    assert!(approx(order.trigger_price, 102.0));
}

#[test]
fn test_deposit_one_year_at_twelve_percent() {
    let mut ledger = AccountLedger::new(1000.0, 0.005);
    let id = ledger
        .open_deposit(Holding::Cash, 100.0, 0.12, Utc::now())
        .unwrap();
    assert!(approx(ledger.cash(), 900.0));

    ledger.accrue_deposits(SECONDS_PER_YEAR);
    let principal = ledger.deposits()[0].principal;
    assert!((principal - 112.0).abs() < 1e-6, "principal {}", principal);
    assert!((ledger.cash() - 912.0).abs() < 1e-6);

    let deposit = ledger.withdraw_deposit(id).unwrap();
    assert!((deposit.interest_earned() - 12.0).abs() < 1e-6);
    assert!((ledger.cash() - 1012.0).abs() < 1e-6);
}

#[test]
fn test_limit_buy_fills_at_target() {
    let (_, mut orders, mut ledger) = desk(1000.0);
    let now = Utc::now();
    orders
        .place_limit(
            "VKoin",
            coinsim::TradeSide::Buy,
            OrderSize::Quantity(2.0),
            95.0,
            now,
        )
        .unwrap();

    let miss = Candle {
        time: 60,
        open: 100.0,
        high: 101.0,
        low: 96.0,
        close: 97.0,
    };
    assert!(orders.on_candle("VKoin", &miss).is_empty());

    let hit = Candle {
        time: 120,
        open: 97.0,
        high: 97.5,
        low: 93.0,
        close: 96.0,
    };
    let triggers = orders.on_candle("VKoin", &hit);
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].fill_price, 95.0);

    let conversion = ledger.settle_buy("VKoin", 2.0, triggers[0].fill_price).unwrap();
    assert_eq!(conversion.fee, 0.0);
    assert!(approx(ledger.cash(), 810.0));
    assert!(approx(ledger.asset_balance("VKoin"), 2.0));
}
