use coinsim::account::Holding;
use coinsim::persistence::{FileStore, KeyValueStore};
use coinsim::{OrderSize, Settings, Side, SimEvent, Simulator, SimulatorError, TradeError, TradingSession};
use std::sync::Arc;
use std::time::Duration;

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.market.seed = Some(5);
    settings.market.tick_interval_ms = 20;
    settings
}

fn simulator(store: Arc<dyn KeyValueStore>) -> Simulator {
    let settings = settings();
    Simulator::new(
        TradingSession::from_settings(&settings),
        store,
        settings.tick_interval(),
    )
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let (cash, vkoin, deposit_id) = {
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&path));
        let (handle, task) = simulator(store).spawn();

        handle.buy_asset("VKoin", 200.0).await.unwrap();
        let deposit_id = handle
            .open_deposit(Holding::Cash, 100.0, Some(0.12))
            .await
            .unwrap();
        handle.set_leverage(5.0).await.unwrap();

        let summary = handle.summary().await.unwrap();
        handle.shutdown();
        task.await.unwrap();
        (summary.cash, summary.assets["VKoin"], deposit_id)
    };

    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&path));
    let mut restarted = simulator(store);
    restarted.restore().await;

    let ledger = restarted.session().ledger();
    // Ticks between the summary and shutdown may still pay a little interest
    assert!(ledger.cash() >= cash - 1e-9);
    assert!((ledger.cash() - cash).abs() < 1e-3);
    assert!((ledger.asset_balance("VKoin") - vkoin).abs() < 1e-9);
    assert_eq!(ledger.deposits().len(), 1);
    assert_eq!(ledger.deposits()[0].id, deposit_id);
    assert!(ledger.deposits()[0].principal >= 100.0);
    assert_eq!(restarted.session().default_leverage(), 5.0);
}

#[tokio::test]
async fn test_events_reach_subscribers() {
    let store: Arc<dyn KeyValueStore> = Arc::new(coinsim::persistence::MemoryStore::new());
    let (handle, task) = simulator(store).spawn();
    let mut events = handle.subscribe();

    handle
        .open_position("Memecoin", Side::Short, OrderSize::Notional(100.0), Some(2.0))
        .await
        .unwrap();

    let mut saw_position = false;
    let mut saw_candle = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !(saw_position && saw_candle) && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Ok(SimEvent::PositionChanged { asset, position })) => {
                assert_eq!(asset, "Memecoin");
                saw_position |= position.is_some();
            }
            Ok(Ok(SimEvent::CandleUpdate { .. })) => saw_candle = true,
            _ => {}
        }
    }
    assert!(saw_position, "no PositionChanged event");
    assert!(saw_candle, "no CandleUpdate event");

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_rejections_leave_state_untouched() {
    let store: Arc<dyn KeyValueStore> = Arc::new(coinsim::persistence::MemoryStore::new());
    let (handle, task) = simulator(store).spawn();
    let before = handle.summary().await.unwrap();

    let err = handle
        .open_position("VKoin", Side::Long, OrderSize::Notional(50_000.0), Some(1.0))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SimulatorError::Trade(TradeError::InsufficientFunds { .. })
    ));

    let err = handle.close_position("VKoin").await.unwrap_err();
    assert!(matches!(
        err,
        SimulatorError::Trade(TradeError::NoOpenPosition { .. })
    ));

    let err = handle.buy_asset("Dogecoin", 10.0).await.unwrap_err();
    assert_eq!(
        err,
        SimulatorError::Trade(TradeError::UnknownAsset("Dogecoin".to_string()))
    );

    let after = handle.summary().await.unwrap();
    assert_eq!(after.cash, before.cash);
    assert!(after.positions.is_empty());
    assert_eq!(after.stats.total_trades, 0);

    handle.shutdown();
    task.await.unwrap();
}
