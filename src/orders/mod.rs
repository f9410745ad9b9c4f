// Order coordination
//
// Owns the local order/position bookkeeping: the active map keyed by broker
// ticket and a bounded append-only history. All pre-submission validation
// happens here, before any broker contact. A place() call requires the risk
// gate's reservation token; the reservation is rolled back whenever the
// submission does not result in a fill.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};

use crate::broker::{Broker, BrokerPosition, OrderFill, OrderRequest, SymbolSpec};
use crate::error::{TradingError, TradingResult};
use crate::risk::{RiskManager, RiskReservation};

const HISTORY_LIMIT: usize = 500;

/// Limits enforced by the coordinator, derived from configuration
#[derive(Debug, Clone)]
pub struct CoordinatorLimits {
    pub max_active_orders: usize,
    pub max_daily_trades: u32,
    /// Per strategy tag position caps
    pub strategy_caps: HashMap<String, usize>,
}

/// A tracked live order/position
#[derive(Debug, Clone)]
pub struct OrderInfo {
    pub ticket: u64,
    pub request: OrderRequest,
    pub executed_price: f64,
    pub opened_at: DateTime<Utc>,
    /// Last floating PnL seen for this ticket during sync
    pub last_pnl: f64,
}

/// Terminal record kept in bounded history
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub ticket: u64,
    pub symbol: String,
    pub strategy_tag: String,
    pub volume: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
    pub last_known_pnl: f64,
}

/// Result of a place() call. A rejection is a value, not an error: the
/// daily ceiling and cap checks produce rejections as part of normal
/// operation.
#[derive(Debug)]
pub enum PlaceOutcome {
    Placed(OrderInfo),
    Rejected { check: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseFilter {
    All,
    Symbol(String),
    Strategy(String),
}

#[derive(Debug, Default)]
struct CoordinatorState {
    active: HashMap<u64, OrderInfo>,
    history: VecDeque<OrderRecord>,
    daily_trades: u32,
    trade_day: Option<NaiveDate>,
}

pub struct OrderCoordinator {
    broker: Arc<dyn Broker>,
    risk: Arc<RiskManager>,
    limits: Mutex<CoordinatorLimits>,
    state: Mutex<CoordinatorState>,
}

impl OrderCoordinator {
    pub fn new(broker: Arc<dyn Broker>, risk: Arc<RiskManager>, limits: CoordinatorLimits) -> Self {
        Self {
            broker,
            risk,
            limits: Mutex::new(limits),
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CoordinatorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn limits(&self) -> CoordinatorLimits {
        self.limits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Swap in new caps between cycles
    pub fn update_limits(&self, limits: CoordinatorLimits) {
        *self
            .limits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = limits;
    }

    /// Validate against local caps without touching the broker. Returns the
    /// failed check, if any.
    fn precheck(&self, spec: &SymbolSpec, request: &OrderRequest) -> Option<(&'static str, String)> {
        if request.volume < spec.volume_min || request.volume > spec.volume_max {
            return Some((
                "volume_bounds",
                format!(
                    "volume {} outside [{}, {}] for {}",
                    request.volume, spec.volume_min, spec.volume_max, request.symbol
                ),
            ));
        }
        if request.stop_loss <= 0.0 || request.entry_price <= 0.0 {
            return Some((
                "order_params",
                format!(
                    "invalid entry {} / stop {}",
                    request.entry_price, request.stop_loss
                ),
            ));
        }

        let limits = self.limits();
        let state = self.lock();
        let today = Utc::now().date_naive();
        let daily_trades = if state.trade_day == Some(today) {
            state.daily_trades
        } else {
            0
        };
        if daily_trades >= limits.max_daily_trades {
            return Some((
                "daily_trades",
                format!("daily trade ceiling {} reached", limits.max_daily_trades),
            ));
        }

        if state.active.len() >= limits.max_active_orders {
            return Some((
                "active_orders",
                format!("{} active orders (cap {})", state.active.len(), limits.max_active_orders),
            ));
        }

        if let Some(&cap) = limits.strategy_caps.get(&request.strategy_tag) {
            let held = state
                .active
                .values()
                .filter(|o| o.request.strategy_tag == request.strategy_tag)
                .count();
            if held >= cap {
                return Some((
                    "strategy_positions",
                    format!("strategy '{}' holds {} positions (cap {})", request.strategy_tag, held, cap),
                ));
            }
        }

        None
    }

    /// Submit an admitted, sized order. The reservation proves the risk
    /// gate passed; it is released on any path that does not end in a fill.
    pub async fn place(
        &self,
        spec: &SymbolSpec,
        request: OrderRequest,
        reservation: RiskReservation,
    ) -> TradingResult<PlaceOutcome> {
        if let Some((check, reason)) = self.precheck(spec, &request) {
            self.risk.release(reservation);
            warn!("📋 Order rejected pre-submission [{}]: {}", check, reason);
            return Ok(PlaceOutcome::Rejected { check, reason });
        }

        let fill = match self.broker.send_order(&request).await {
            Ok(fill) => fill,
            Err(e) => {
                self.risk.release(reservation);
                return Err(e);
            }
        };

        let info = self.record_fill(&request, &fill);
        self.risk.record_trade_open();
        info!(
            "✅ {} {} {:.2} {} @ {:.5} (ticket {})",
            request.strategy_tag,
            request.direction,
            fill.executed_volume,
            request.symbol,
            fill.executed_price,
            fill.ticket
        );

        Ok(PlaceOutcome::Placed(info))
    }

    fn record_fill(&self, request: &OrderRequest, fill: &OrderFill) -> OrderInfo {
        let info = OrderInfo {
            ticket: fill.ticket,
            request: request.clone(),
            executed_price: fill.executed_price,
            opened_at: Utc::now(),
            last_pnl: 0.0,
        };

        let mut state = self.lock();
        let today = Utc::now().date_naive();
        if state.trade_day != Some(today) {
            state.trade_day = Some(today);
            state.daily_trades = 0;
        }
        state.daily_trades += 1;
        state.active.insert(fill.ticket, info.clone());
        info
    }

    /// Adjust SL/TP on a live position
    pub async fn modify(
        &self,
        ticket: u64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> TradingResult<()> {
        self.broker.modify_position(ticket, stop_loss, take_profit).await
    }

    /// Close one position, recording the reason in history
    pub async fn close(&self, ticket: u64, reason: &str) -> TradingResult<()> {
        self.broker.close_position(ticket).await?;

        let mut state = self.lock();
        if let Some(info) = state.active.remove(&ticket) {
            let record = OrderRecord {
                ticket,
                symbol: info.request.symbol.clone(),
                strategy_tag: info.request.strategy_tag.clone(),
                volume: info.request.volume,
                opened_at: info.opened_at,
                closed_at: Some(Utc::now()),
                close_reason: Some(reason.to_string()),
                last_known_pnl: info.last_pnl,
            };
            Self::push_history(&mut state, record);
        }
        info!("🔒 Closed ticket {} ({})", ticket, reason);
        Ok(())
    }

    /// Close every position matching the filter. Per-position failures are
    /// logged and do not abort the sweep; returns the number closed.
    pub async fn close_all(&self, positions: &[BrokerPosition], filter: CloseFilter, reason: &str) -> usize {
        let mut closed = 0;
        for position in positions {
            let matches = match &filter {
                CloseFilter::All => true,
                CloseFilter::Symbol(symbol) => &position.symbol == symbol,
                CloseFilter::Strategy(tag) => &position.strategy_tag == tag,
            };
            if !matches {
                continue;
            }
            match self.close(position.ticket, reason).await {
                Ok(()) => closed += 1,
                Err(e) => warn!("close failed for ticket {}: {}", position.ticket, e),
            }
        }
        closed
    }

    /// Reconcile the active map against broker truth. Positions the broker
    /// no longer reports are moved to history; returns those records so the
    /// engine can account for the outcomes.
    pub fn sync_positions(&self, live: &[BrokerPosition]) -> Vec<OrderRecord> {
        let live_pnl: HashMap<u64, f64> = live
            .iter()
            .map(|p| (p.ticket, p.unrealized_pnl))
            .collect();

        let mut state = self.lock();
        let vanished: Vec<u64> = state
            .active
            .keys()
            .filter(|ticket| !live_pnl.contains_key(ticket))
            .copied()
            .collect();

        let mut closed = Vec::new();
        for ticket in vanished {
            if let Some(info) = state.active.remove(&ticket) {
                let record = OrderRecord {
                    ticket,
                    symbol: info.request.symbol.clone(),
                    strategy_tag: info.request.strategy_tag.clone(),
                    volume: info.request.volume,
                    opened_at: info.opened_at,
                    closed_at: Some(Utc::now()),
                    close_reason: Some("closed by broker".to_string()),
                    last_known_pnl: info.last_pnl,
                };
                closed.push(record.clone());
                Self::push_history(&mut state, record);
            }
        }

        // Track floating PnL so a later broker-side close can report an
        // approximate realized outcome
        for info in state.active.values_mut() {
            if let Some(&pnl) = live_pnl.get(&info.ticket) {
                info.last_pnl = pnl;
            }
        }

        closed
    }

    fn push_history(state: &mut CoordinatorState, record: OrderRecord) {
        if state.history.len() >= HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(record);
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn active_tickets(&self) -> Vec<u64> {
        self.lock().active.keys().copied().collect()
    }

    pub fn daily_trades(&self) -> u32 {
        let state = self.lock();
        if state.trade_day == Some(Utc::now().date_naive()) {
            state.daily_trades
        } else {
            0
        }
    }

    pub fn history(&self) -> Vec<OrderRecord> {
        self.lock().history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{SimBroker, TradeDirection};
    use crate::config::RiskConfig;
    use crate::risk::CorrelationTable;
    use crate::broker::AccountSnapshot;
    use uuid::Uuid;

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

    fn request(volume: f64) -> OrderRequest {
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

    fn setup(limits: CoordinatorLimits) -> (Arc<SimBroker>, Arc<RiskManager>, OrderCoordinator) {
        let broker = Arc::new(
            SimBroker::builder()
                .with_account(10_000.0, 10_000.0)
                .with_default_spec("EURUSD")
                .build(),
        );
        let risk = Arc::new(RiskManager::new(
            RiskConfig::default(),
            CorrelationTable::default(),
        ));
        risk.refresh(
            &AccountSnapshot {
                balance: 10_000.0,
                equity: 10_000.0,
                margin: 0.0,
                free_margin: 10_000.0,
            },
            Vec::new(),
            Utc::now(),
        );
        let coordinator = OrderCoordinator::new(broker.clone(), risk.clone(), limits);
        (broker, risk, coordinator)
    }

    fn default_limits() -> CoordinatorLimits {
        CoordinatorLimits {
            max_active_orders: 10,
            max_daily_trades: 40,
            strategy_caps: HashMap::from([("swing".to_string(), 2)]),
        }
    }

    #[tokio::test]
    async fn test_place_records_active_order() {
        let (_, risk, coordinator) = setup(default_limits());
        let reservation = risk.admit("EURUSD", 100.0).unwrap();

        let outcome = coordinator
            .place(&eurusd_spec(), request(0.2), reservation)
            .await
            .unwrap();
        assert!(matches!(outcome, PlaceOutcome::Placed(_)));
        assert_eq!(coordinator.active_count(), 1);
        assert_eq!(coordinator.daily_trades(), 1);
    }

    #[tokio::test]
    async fn test_broker_failure_rolls_back_reservation() {
        let (broker, risk, coordinator) = setup(default_limits());
        broker.fail_next_order();

        let reservation = risk.admit("EURUSD", 100.0).unwrap();
        assert!((risk.snapshot().daily_risk_used - 100.0).abs() < 1e-9);

        let result = coordinator
            .place(&eurusd_spec(), request(0.2), reservation)
            .await;
        assert!(result.is_err());
        assert!(risk.snapshot().daily_risk_used.abs() < 1e-9);
        assert_eq!(coordinator.active_count(), 0);
    }

    #[tokio::test]
    async fn test_daily_ceiling_returns_rejection_not_error() {
        let limits = CoordinatorLimits {
            max_daily_trades: 1,
            ..default_limits()
        };
        let (_, risk, coordinator) = setup(limits);

        let reservation = risk.admit("EURUSD", 100.0).unwrap();
        coordinator
            .place(&eurusd_spec(), request(0.1), reservation)
            .await
            .unwrap();

        let reservation = risk.admit("EURUSD", 100.0).unwrap();
        let outcome = coordinator
            .place(&eurusd_spec(), request(0.1), reservation)
            .await
            .unwrap();
        match outcome {
            PlaceOutcome::Rejected { check, .. } => assert_eq!(check, "daily_trades"),
            other => panic!("expected rejection, got {:?}", other),
        }
        // The rejected attempt released its reservation
        assert!((risk.snapshot().daily_risk_used - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_strategy_cap_enforced() {
        let (_, risk, coordinator) = setup(default_limits());

        for _ in 0..2 {
            let reservation = risk.admit("EURUSD", 50.0).unwrap();
            coordinator
                .place(&eurusd_spec(), request(0.1), reservation)
                .await
                .unwrap();
        }

        let reservation = risk.admit("EURUSD", 50.0).unwrap();
        let outcome = coordinator
            .place(&eurusd_spec(), request(0.1), reservation)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            PlaceOutcome::Rejected { check: "strategy_positions", .. }
        ));
    }

    #[tokio::test]
    async fn test_sync_moves_vanished_positions_to_history() {
        let (broker, risk, coordinator) = setup(default_limits());

        let reservation = risk.admit("EURUSD", 100.0).unwrap();
        let outcome = coordinator
            .place(&eurusd_spec(), request(0.1), reservation)
            .await
            .unwrap();
        let ticket = match outcome {
            PlaceOutcome::Placed(info) => info.ticket,
            _ => panic!("expected placement"),
        };

        // Broker closes the position out-of-band
        broker.drop_position(ticket);
        let live = broker.positions().await.unwrap();
        let closed = coordinator.sync_positions(&live);

        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].ticket, ticket);
        assert_eq!(coordinator.active_count(), 0);
        assert_eq!(coordinator.history().len(), 1);
    }

    #[tokio::test]
    async fn test_close_all_with_filter() {
        let (broker, risk, coordinator) = setup(CoordinatorLimits {
            strategy_caps: HashMap::new(),
            ..default_limits()
        });

        for tag in ["swing", "swing", "scalping"] {
            let reservation = risk.admit("EURUSD", 50.0).unwrap();
            let mut req = request(0.1);
            req.strategy_tag = tag.to_string();
            coordinator
                .place(&eurusd_spec(), req, reservation)
                .await
                .unwrap();
        }

        let live = broker.positions().await.unwrap();
        let closed = coordinator
            .close_all(&live, CloseFilter::Strategy("swing".to_string()), "test sweep")
            .await;
        assert_eq!(closed, 2);
        assert_eq!(broker.open_position_count(), 1);
    }
}
