// Shared helpers for integration tests

use chrono::{Duration, Utc};
use fx_trading_bot::{Candle, Config, SimBroker, Timeframe};

/// Candles with a constant per-bar drift, newest last
pub fn generate_trend_candles(count: usize, start_price: f64, step: f64) -> Vec<Candle> {
    let base = Utc::now();
    (0..count)
        .map(|i| {
            let open = start_price + step * i as f64;
            let close = open + step;
            Candle {
                time: base - Duration::minutes(((count - i) * 5) as i64),
                open,
                high: open.max(close) + step.abs() * 0.25,
                low: open.min(close) - step.abs() * 0.25,
                close,
                volume: 100.0,
            }
        })
        .collect()
}

/// Single-strategy configuration trading EURUSD on M5
pub fn create_test_config() -> Config {
    let mut config = Config::default();
    config.strategies.clear();
    config.strategies.insert(
        "swing".to_string(),
        fx_trading_bot::StrategyConfig {
            enabled: true,
            weight: 1.0,
            max_positions: 2,
            min_signal_strength: 0.3,
            symbols: vec!["EURUSD".to_string()],
            timeframes: vec![Timeframe::M5],
            max_hold_hours: None,
        },
    );
    config
}

/// Sim broker primed with a strong EURUSD uptrend
pub fn uptrend_broker(equity: f64) -> SimBroker {
    let candles = generate_trend_candles(80, 1.10, 0.0008);
    let last_close = candles.last().unwrap().close;
    SimBroker::builder()
        .with_account(equity, equity)
        .with_default_spec("EURUSD")
        .with_candles("EURUSD", Timeframe::M5, candles)
        .with_tick("EURUSD", last_close - 0.0001, last_close + 0.0001)
        .build()
}
