// Integration tests for the risk gate working against the order coordinator

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use fx_trading_bot::{
    AccountSnapshot, CoordinatorLimits, CorrelationTable, OrderCoordinator, OrderRequest,
    PlaceOutcome, RiskManager, SimBroker, SymbolSpec, TradeDirection, TradingState,
};
use uuid::Uuid;

fn account(equity: f64) -> AccountSnapshot {
    AccountSnapshot {
        balance: equity,
        equity,
        margin: 0.0,
        free_margin: equity,
    }
}

fn eurusd_spec() -> SymbolSpec {
    SymbolSpec {
        symbol: "EURUSD".to_string(),
        point: 0.00001,
        digits: 5,
        contract_size: 100_000.0,
        volume_min: 0.01,
        volume_max: 100.0,
        volume_step: 0.01,
        tick_value: 1.0,
    }
}

fn order(volume: f64) -> OrderRequest {
    OrderRequest {
        client_id: Uuid::new_v4(),
        symbol: "EURUSD".to_string(),
        direction: TradeDirection::Long,
        volume,
        entry_price: 1.1000,
        stop_loss: 1.0950,
        take_profit: 1.1100,
        strategy_tag: "swing".to_string(),
        signal_strength: 0.8,
    }
}

/// N concurrent admissions whose combined risk exceeds the daily cap must
/// admit exactly the subset that fits, then every admitted reservation must
/// survive a real submission round-trip.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admissions_then_submission() {
    let risk = Arc::new(RiskManager::new(
        Default::default(),
        CorrelationTable::default(),
    ));
    risk.refresh(&account(10_000.0), Vec::new(), Utc::now());

    // Daily budget 500; ten tasks racing for 150 each: exactly 3 fit.
    let mut handles = Vec::new();
    for i in 0..10 {
        let risk = Arc::clone(&risk);
        handles.push(tokio::task::spawn_blocking(move || {
            risk.admit(&format!("SYM{}", i), 150.0).ok()
        }));
    }

    let mut reservations = Vec::new();
    for handle in handles {
        if let Some(reservation) = handle.await.unwrap() {
            reservations.push(reservation);
        }
    }
    assert_eq!(reservations.len(), 3);
    assert!((risk.snapshot().daily_risk_used - 450.0).abs() < 1e-9);

    // Submit through the coordinator with a live broker; the budget stays
    // spent for fills
    let broker: Arc<SimBroker> = Arc::new(
        SimBroker::builder()
            .with_account(10_000.0, 10_000.0)
            .with_default_spec("EURUSD")
            .build(),
    );
    let coordinator = OrderCoordinator::new(
        broker.clone(),
        risk.clone(),
        CoordinatorLimits {
            max_active_orders: 10,
            max_daily_trades: 10,
            strategy_caps: HashMap::new(),
        },
    );

    for reservation in reservations {
        let outcome = coordinator
            .place(&eurusd_spec(), order(0.1), reservation)
            .await
            .unwrap();
        assert!(matches!(outcome, PlaceOutcome::Placed(_)));
    }
    assert_eq!(broker.open_position_count(), 3);
    assert!((risk.snapshot().daily_risk_used - 450.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_emergency_scenario_from_spec() {
    // peak 10_000, current 8_000, threshold 20% -> EMERGENCY_STOPPED;
    // recovery to 9_500 does not restore admission
    let config = fx_trading_bot::RiskConfig {
        emergency_stop_drawdown: 20.0,
        ..Default::default()
    };
    let risk = RiskManager::new(config, CorrelationTable::default());
    let now = Utc::now();

    risk.refresh(&account(10_000.0), Vec::new(), now);
    assert!(risk.admit("EURUSD", 100.0).is_ok());

    risk.refresh(&account(8_000.0), Vec::new(), now);
    assert_eq!(risk.state(), TradingState::EmergencyStopped);
    assert!(risk.admit("EURUSD", 100.0).is_err());

    risk.refresh(&account(9_500.0), Vec::new(), now);
    assert!(risk.admit("EURUSD", 100.0).is_err());
}

#[tokio::test]
async fn test_rejected_submission_frees_budget_for_next_candidate() {
    let risk = Arc::new(RiskManager::new(
        Default::default(),
        CorrelationTable::default(),
    ));
    risk.refresh(&account(10_000.0), Vec::new(), Utc::now());

    let broker: Arc<SimBroker> = Arc::new(
        SimBroker::builder()
            .with_account(10_000.0, 10_000.0)
            .with_default_spec("EURUSD")
            .build(),
    );
    let coordinator = OrderCoordinator::new(
        broker.clone(),
        risk.clone(),
        CoordinatorLimits {
            max_active_orders: 10,
            max_daily_trades: 10,
            strategy_caps: HashMap::new(),
        },
    );

    // Broker rejects the first submission; its reservation must roll back
    broker.fail_next_order();
    let reservation = risk.admit("EURUSD", 450.0).unwrap();
    assert!(coordinator
        .place(&eurusd_spec(), order(0.1), reservation)
        .await
        .is_err());
    assert!(risk.snapshot().daily_risk_used.abs() < 1e-9);

    // The freed budget admits the next candidate (budget 500)
    let reservation = risk.admit("EURUSD", 450.0).unwrap();
    let outcome = coordinator
        .place(&eurusd_spec(), order(0.1), reservation)
        .await
        .unwrap();
    assert!(matches!(outcome, PlaceOutcome::Placed(_)));
}
