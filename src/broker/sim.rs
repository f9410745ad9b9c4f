// Simulated broker for tests and paper trading
//
// Deterministic by default: orders fill at the requested price unless a
// slippage band is configured. State lives behind one mutex; broker truth
// (positions, tickets) is owned here exactly like a real terminal would.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rand::{thread_rng, Rng};

use super::{
    AccountSnapshot, Broker, BrokerPosition, Candle, OrderFill, OrderRequest, SymbolSpec, Tick,
    TradeDirection, Timeframe,
};
use crate::error::{TradingError, TradingResult};

#[derive(Debug, Default)]
struct SimState {
    account: Option<AccountSnapshot>,
    specs: HashMap<String, SymbolSpec>,
    candles: HashMap<(String, Timeframe), Vec<Candle>>,
    ticks: HashMap<String, Tick>,
    positions: HashMap<u64, BrokerPosition>,
    next_ticket: u64,
    slippage_pips: f64,
    fail_next_order: bool,
    fail_account_calls: bool,
}

pub struct SimBroker {
    state: Mutex<SimState>,
}

pub struct SimBrokerBuilder {
    state: SimState,
}

impl SimBrokerBuilder {
    pub fn with_account(mut self, balance: f64, equity: f64) -> Self {
        self.state.account = Some(AccountSnapshot {
            balance,
            equity,
            margin: 0.0,
            free_margin: equity,
        });
        self
    }

    pub fn with_spec(mut self, spec: SymbolSpec) -> Self {
        self.state.specs.insert(spec.symbol.clone(), spec);
        self
    }

    /// Standard 5-digit FX symbol spec
    pub fn with_default_spec(self, symbol: &str) -> Self {
        self.with_spec(SymbolSpec {
            symbol: symbol.to_string(),
            point: 0.00001,
            digits: 5,
            contract_size: 100_000.0,
            volume_min: 0.01,
            volume_max: 100.0,
            volume_step: 0.01,
            tick_value: 1.0,
        })
    }

    pub fn with_candles(mut self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) -> Self {
        self.state
            .candles
            .insert((symbol.to_string(), timeframe), candles);
        self
    }

    pub fn with_tick(mut self, symbol: &str, bid: f64, ask: f64) -> Self {
        self.state.ticks.insert(
            symbol.to_string(),
            Tick {
                bid,
                ask,
                time: Utc::now(),
            },
        );
        self
    }

    pub fn with_slippage_pips(mut self, pips: f64) -> Self {
        self.state.slippage_pips = pips;
        self
    }

    pub fn build(mut self) -> SimBroker {
        self.state.next_ticket = 1000;
        SimBroker {
            state: Mutex::new(self.state),
        }
    }
}

impl SimBroker {
    pub fn builder() -> SimBrokerBuilder {
        SimBrokerBuilder {
            state: SimState::default(),
        }
    }

    /// Paper-trading instance: synthetic random-walk history for each symbol
    pub fn paper(symbols: &[String], balance: f64) -> Self {
        let mut builder = Self::builder().with_account(balance, balance);
        let mut rng = thread_rng();

        for symbol in symbols {
            builder = builder.with_default_spec(symbol);
            let mut price: f64 = rng.gen_range(0.8..1.5);

            for tf in [Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::H1] {
                let mut candles = Vec::with_capacity(240);
                let now = Utc::now();
                for i in 0..240i64 {
                    let drift: f64 = rng.gen_range(-0.0008..0.0008);
                    let open = price;
                    let close = open * (1.0 + drift);
                    let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.0004));
                    let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.0004));
                    candles.push(Candle {
                        time: now - Duration::minutes((240 - i) * tf.minutes() as i64),
                        open,
                        high,
                        low,
                        close,
                        volume: rng.gen_range(50.0..500.0),
                    });
                    price = close;
                }
                builder = builder.with_candles(symbol, tf, candles);
            }

            let spread = 0.00015;
            builder = builder.with_tick(symbol, price - spread / 2.0, price + spread / 2.0);
        }

        builder.with_slippage_pips(0.5).build()
    }

    // Test hooks

    pub fn set_equity(&self, equity: f64) {
        let mut state = self.lock();
        if let Some(account) = state.account.as_mut() {
            account.equity = equity;
            account.free_margin = equity;
        }
    }

    pub fn set_tick(&self, symbol: &str, bid: f64, ask: f64) {
        let mut state = self.lock();
        state.ticks.insert(
            symbol.to_string(),
            Tick {
                bid,
                ask,
                time: Utc::now(),
            },
        );
    }

    pub fn fail_next_order(&self) {
        self.lock().fail_next_order = true;
    }

    pub fn fail_account_calls(&self, fail: bool) {
        self.lock().fail_account_calls = fail;
    }

    pub fn open_position_count(&self) -> usize {
        self.lock().positions.len()
    }

    /// Remove a position out from under the engine, as a terminal-side close
    pub fn drop_position(&self, ticket: u64) -> Option<BrokerPosition> {
        self.lock().positions.remove(&ticket)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Broker for SimBroker {
    async fn account_info(&self) -> TradingResult<AccountSnapshot> {
        let state = self.lock();
        if state.fail_account_calls {
            return Err(TradingError::ConnectionLost("simulated outage".to_string()));
        }
        state
            .account
            .ok_or_else(|| TradingError::ConnectionLost("no account configured".to_string()))
    }

    async fn symbol_spec(&self, symbol: &str) -> TradingResult<SymbolSpec> {
        self.lock()
            .specs
            .get(symbol)
            .cloned()
            .ok_or_else(|| TradingError::data_unavailable(symbol, "unknown symbol"))
    }

    async fn positions(&self) -> TradingResult<Vec<BrokerPosition>> {
        let state = self.lock();
        if state.fail_account_calls {
            return Err(TradingError::ConnectionLost("simulated outage".to_string()));
        }
        let mut positions: Vec<BrokerPosition> = state.positions.values().cloned().collect();
        positions.sort_by_key(|p| p.ticket);
        Ok(positions)
    }

    async fn rates(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> TradingResult<Vec<Candle>> {
        let state = self.lock();
        let candles = state
            .candles
            .get(&(symbol.to_string(), timeframe))
            .ok_or_else(|| TradingError::data_unavailable(symbol, format!("no {} history", timeframe)))?;
        let start = candles.len().saturating_sub(count);
        Ok(candles[start..].to_vec())
    }

    async fn tick(&self, symbol: &str) -> TradingResult<Tick> {
        self.lock()
            .ticks
            .get(symbol)
            .copied()
            .ok_or_else(|| TradingError::data_unavailable(symbol, "no tick"))
    }

    async fn send_order(&self, request: &OrderRequest) -> TradingResult<OrderFill> {
        let mut state = self.lock();

        if state.fail_next_order {
            state.fail_next_order = false;
            return Err(TradingError::BrokerRejection("forced failure".to_string()));
        }

        let spec = state
            .specs
            .get(&request.symbol)
            .cloned()
            .ok_or_else(|| TradingError::BrokerRejection(format!("unknown symbol {}", request.symbol)))?;

        if request.volume < spec.volume_min || request.volume > spec.volume_max {
            return Err(TradingError::BrokerRejection(format!(
                "volume {} outside [{}, {}]",
                request.volume, spec.volume_min, spec.volume_max
            )));
        }

        let slippage = if state.slippage_pips > 0.0 {
            let band = state.slippage_pips * spec.pip_size();
            thread_rng().gen_range(0.0..band)
        } else {
            0.0
        };
        let executed_price = match request.direction {
            TradeDirection::Long => request.entry_price + slippage,
            TradeDirection::Short => request.entry_price - slippage,
        };

        state.next_ticket += 1;
        let ticket = state.next_ticket;
        state.positions.insert(
            ticket,
            BrokerPosition {
                ticket,
                symbol: request.symbol.clone(),
                direction: request.direction,
                volume: request.volume,
                entry_price: executed_price,
                stop_loss: Some(request.stop_loss),
                take_profit: Some(request.take_profit),
                open_time: Utc::now(),
                strategy_tag: request.strategy_tag.clone(),
                unrealized_pnl: 0.0,
            },
        );

        Ok(OrderFill {
            ticket,
            executed_price,
            executed_volume: request.volume,
        })
    }

    async fn modify_position(
        &self,
        ticket: u64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> TradingResult<()> {
        let mut state = self.lock();
        let position = state
            .positions
            .get_mut(&ticket)
            .ok_or_else(|| TradingError::BrokerRejection(format!("unknown ticket {}", ticket)))?;
        if stop_loss.is_some() {
            position.stop_loss = stop_loss;
        }
        if take_profit.is_some() {
            position.take_profit = take_profit;
        }
        Ok(())
    }

    async fn close_position(&self, ticket: u64) -> TradingResult<()> {
        let mut state = self.lock();
        state
            .positions
            .remove(&ticket)
            .map(|_| ())
            .ok_or_else(|| TradingError::BrokerRejection(format!("unknown ticket {}", ticket)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn order(symbol: &str, volume: f64) -> OrderRequest {
        OrderRequest {
            client_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            direction: TradeDirection::Long,
            volume,
            entry_price: 1.1000,
            stop_loss: 1.0950,
            take_profit: 1.1100,
            strategy_tag: "swing".to_string(),
            signal_strength: 0.8,
        }
    }

    #[tokio::test]
    async fn test_fill_creates_position() {
        let broker = SimBroker::builder()
            .with_account(10_000.0, 10_000.0)
            .with_default_spec("EURUSD")
            .build();

        let fill = broker.send_order(&order("EURUSD", 0.2)).await.unwrap();
        assert!(fill.ticket > 0);
        assert_eq!(fill.executed_price, 1.1000);

        let positions = broker.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].ticket, fill.ticket);
    }

    #[tokio::test]
    async fn test_volume_outside_bounds_rejected() {
        let broker = SimBroker::builder().with_default_spec("EURUSD").build();
        let err = broker.send_order(&order("EURUSD", 0.001)).await.unwrap_err();
        assert!(matches!(err, TradingError::BrokerRejection(_)));
    }

    #[tokio::test]
    async fn test_forced_failure_fires_once() {
        let broker = SimBroker::builder()
            .with_account(10_000.0, 10_000.0)
            .with_default_spec("EURUSD")
            .build();
        broker.fail_next_order();

        assert!(broker.send_order(&order("EURUSD", 0.1)).await.is_err());
        assert!(broker.send_order(&order("EURUSD", 0.1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_unknown_ticket() {
        let broker = SimBroker::builder().build();
        assert!(broker.close_position(42).await.is_err());
    }

    #[tokio::test]
    async fn test_paper_broker_has_history() {
        let broker = SimBroker::paper(&["EURUSD".to_string()], 10_000.0);
        let candles = broker.rates("EURUSD", Timeframe::M5, 100).await.unwrap();
        assert_eq!(candles.len(), 100);
        assert!(broker.tick("EURUSD").await.is_ok());
    }
}
