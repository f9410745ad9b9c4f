// Risk management
//
// One RiskManager per account. All mutable risk state lives behind a single
// mutex and admission is a check-and-reserve operation inside that lock, so
// two symbols evaluated in parallel can never jointly overspend the daily
// budget. The admission token (RiskReservation) is required by the order
// coordinator, which makes the gate the only path to a submission.

pub mod sizing;

use std::collections::HashSet;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};

use crate::broker::{AccountSnapshot, BrokerPosition, SymbolSpec, Tick, TradeDirection};
use crate::config::{CorrelationPair, RiskConfig};
use crate::error::{TradingError, TradingResult};

pub use sizing::{PositionSizer, SizeInputs};

/// Account-level trading state.
///
/// Normal -> DailyLimitReached clears on the next trading day.
/// Normal -> EmergencyStopped is terminal until an explicit manual reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingState {
    Normal,
    DailyLimitReached,
    EmergencyStopped,
}

/// Open-position exposure as seen at refresh time
#[derive(Debug, Clone)]
pub struct OpenExposure {
    pub symbol: String,
    pub notional: f64,
}

/// Token proving a candidate trade passed the gate and its risk amount is
/// reserved against the daily budget. Consumed by the order coordinator;
/// released if the submission does not go through.
#[derive(Debug)]
pub struct RiskReservation {
    symbol: String,
    amount: f64,
}

impl RiskReservation {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }
}

/// A gate denial: which check failed and why. Expected and frequent, not an
/// error.
#[derive(Debug, Clone)]
pub struct RiskDenial {
    pub check: &'static str,
    pub reason: String,
}

impl std::fmt::Display for RiskDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.check, self.reason)
    }
}

impl From<RiskDenial> for TradingError {
    fn from(denial: RiskDenial) -> Self {
        TradingError::RiskGateDenied {
            check: denial.check.to_string(),
            reason: denial.reason,
        }
    }
}

/// State transition produced by a refresh
#[derive(Debug, Clone, PartialEq)]
pub enum RiskEvent {
    EmergencyStopTriggered { drawdown_pct: f64 },
    DailyLimitReached { reason: String },
    NewTradingDay,
}

/// Read-only view of the current risk state
#[derive(Debug, Clone)]
pub struct RiskSnapshot {
    pub state: TradingState,
    pub equity: f64,
    pub balance: f64,
    pub peak_equity: f64,
    pub current_drawdown_pct: f64,
    pub daily_risk_used: f64,
    pub daily_trade_count: u32,
    pub consecutive_losses: u32,
    pub exposure_ratio: f64,
}

/// Stop-loss / take-profit levels with their pip distances
#[derive(Debug, Clone, Copy)]
pub struct StopTake {
    pub stop_loss: f64,
    pub take_profit: f64,
    pub sl_distance_pips: f64,
    pub tp_distance_pips: f64,
}

/// Static correlation estimates, symmetric lookup
#[derive(Debug, Clone, Default)]
pub struct CorrelationTable {
    pairs: Vec<CorrelationPair>,
}

impl CorrelationTable {
    pub fn new(pairs: Vec<CorrelationPair>) -> Self {
        Self { pairs }
    }

    pub fn coefficient(&self, a: &str, b: &str) -> Option<f64> {
        self.pairs
            .iter()
            .find(|p| (p.a == a && p.b == b) || (p.a == b && p.b == a))
            .map(|p| p.coefficient)
    }
}

#[derive(Debug)]
struct RiskState {
    state: TradingState,
    refreshed: bool,
    equity: f64,
    balance: f64,
    day_start_equity: f64,
    current_day: Option<NaiveDate>,
    peak_equity: f64,
    current_drawdown: f64,
    daily_risk_used: f64,
    daily_trade_count: u32,
    consecutive_losses: u32,
    exposure_ratio: f64,
    open_exposures: Vec<OpenExposure>,
}

impl Default for RiskState {
    fn default() -> Self {
        Self {
            state: TradingState::Normal,
            refreshed: false,
            equity: 0.0,
            balance: 0.0,
            day_start_equity: 0.0,
            current_day: None,
            peak_equity: 0.0,
            current_drawdown: 0.0,
            daily_risk_used: 0.0,
            daily_trade_count: 0,
            consecutive_losses: 0,
            exposure_ratio: 0.0,
            open_exposures: Vec::new(),
        }
    }
}

pub struct RiskManager {
    config: RwLock<RiskConfig>,
    correlations: CorrelationTable,
    state: Mutex<RiskState>,
}

impl RiskManager {
    pub fn new(config: RiskConfig, correlations: CorrelationTable) -> Self {
        Self {
            config: RwLock::new(config),
            correlations,
            state: Mutex::new(RiskState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RiskState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cfg(&self) -> RiskConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Swap in new limits between cycles; accumulated state is untouched
    pub fn update_config(&self, config: RiskConfig) {
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
    }

    /// Recompute drawdown, exposure and state transitions from a fresh
    /// account snapshot. Must run at cycle start, before any admission
    /// decision for that cycle.
    pub fn refresh(
        &self,
        account: &AccountSnapshot,
        open: Vec<OpenExposure>,
        now: DateTime<Utc>,
    ) -> Vec<RiskEvent> {
        let config = self.cfg();
        let mut events = Vec::new();
        let mut state = self.lock();

        let today = now.date_naive();
        match state.current_day {
            Some(day) if day == today => {}
            Some(_) => {
                Self::reset_daily_locked(&mut state, account.equity, today);
                events.push(RiskEvent::NewTradingDay);
                info!("🌅 New trading day, daily risk counters reset");
            }
            None => {
                Self::reset_daily_locked(&mut state, account.equity, today);
            }
        }

        state.equity = account.equity;
        state.balance = account.balance;

        if account.equity > state.peak_equity {
            state.peak_equity = account.equity;
        }
        state.current_drawdown = if state.peak_equity > 0.0 {
            ((state.peak_equity - account.equity) / state.peak_equity).max(0.0)
        } else {
            0.0
        };

        state.exposure_ratio = if account.equity > 0.0 {
            open.iter().map(|e| e.notional).sum::<f64>() / account.equity
        } else {
            0.0
        };
        state.open_exposures = open;

        let drawdown_pct = state.current_drawdown * 100.0;
        if state.state != TradingState::EmergencyStopped
            && drawdown_pct >= config.emergency_stop_drawdown
        {
            warn!(
                "🚨 Emergency stop: drawdown {:.2}% >= {:.2}%",
                drawdown_pct, config.emergency_stop_drawdown
            );
            state.state = TradingState::EmergencyStopped;
            events.push(RiskEvent::EmergencyStopTriggered { drawdown_pct });
        }

        if state.state == TradingState::Normal {
            if let Some(reason) = Self::daily_limit_reason(&config, &state) {
                warn!("⛔ Daily limit reached: {}", reason);
                state.state = TradingState::DailyLimitReached;
                events.push(RiskEvent::DailyLimitReached { reason });
            }
        }

        state.refreshed = true;
        events
    }

    fn daily_limit_reason(config: &RiskConfig, state: &RiskState) -> Option<String> {
        if state.day_start_equity > 0.0 {
            let daily_pnl_pct =
                (state.equity - state.day_start_equity) / state.day_start_equity * 100.0;
            if daily_pnl_pct <= -config.daily_loss_limit_pct {
                return Some(format!(
                    "daily loss {:.2}% breached limit {:.2}%",
                    daily_pnl_pct.abs(),
                    config.daily_loss_limit_pct
                ));
            }
        }

        let daily_budget = state.equity * config.max_daily_risk / 100.0;
        if daily_budget > 0.0 && state.daily_risk_used >= daily_budget {
            return Some(format!(
                "daily risk used {:.2} >= budget {:.2}",
                state.daily_risk_used, daily_budget
            ));
        }

        if state.consecutive_losses >= config.max_consecutive_losses {
            return Some(format!(
                "{} consecutive losses",
                state.consecutive_losses
            ));
        }

        None
    }

    fn reset_daily_locked(state: &mut RiskState, equity: f64, today: NaiveDate) {
        state.current_day = Some(today);
        state.day_start_equity = equity;
        state.peak_equity = equity;
        state.daily_risk_used = 0.0;
        state.daily_trade_count = 0;
        state.consecutive_losses = 0;
        if state.state == TradingState::DailyLimitReached {
            state.state = TradingState::Normal;
        }
    }

    /// The single admission gate: checks every limit and reserves the risk
    /// amount atomically. No order may be submitted without the returned
    /// reservation.
    pub fn admit(&self, symbol: &str, candidate_risk: f64) -> Result<RiskReservation, RiskDenial> {
        let config = self.cfg();
        let mut state = self.lock();

        if !state.refreshed {
            return Err(RiskDenial {
                check: "account_data",
                reason: "no account snapshot yet".to_string(),
            });
        }

        if candidate_risk <= 0.0 || !candidate_risk.is_finite() {
            return Err(RiskDenial {
                check: "risk_amount",
                reason: format!("non-positive candidate risk {}", candidate_risk),
            });
        }

        match state.state {
            TradingState::EmergencyStopped => {
                return Err(RiskDenial {
                    check: "emergency_stop",
                    reason: "emergency stop active".to_string(),
                });
            }
            TradingState::DailyLimitReached => {
                return Err(RiskDenial {
                    check: "daily_limit",
                    reason: "daily limit reached".to_string(),
                });
            }
            TradingState::Normal => {}
        }

        let drawdown_pct = state.current_drawdown * 100.0;
        if drawdown_pct >= config.max_drawdown {
            return Err(RiskDenial {
                check: "drawdown",
                reason: format!(
                    "drawdown {:.2}% >= limit {:.2}%",
                    drawdown_pct, config.max_drawdown
                ),
            });
        }

        if state.exposure_ratio >= config.max_total_exposure {
            return Err(RiskDenial {
                check: "exposure",
                reason: format!(
                    "exposure {:.2}x >= limit {:.2}x of equity",
                    state.exposure_ratio, config.max_total_exposure
                ),
            });
        }

        let symbol_positions = state
            .open_exposures
            .iter()
            .filter(|e| e.symbol == symbol)
            .count();
        if symbol_positions >= config.max_positions_per_symbol {
            return Err(RiskDenial {
                check: "symbol_positions",
                reason: format!(
                    "{} already holds {} positions (cap {})",
                    symbol, symbol_positions, config.max_positions_per_symbol
                ),
            });
        }

        let open_symbols: HashSet<&str> = state
            .open_exposures
            .iter()
            .map(|e| e.symbol.as_str())
            .collect();
        for other in open_symbols {
            if other == symbol {
                continue;
            }
            if let Some(coefficient) = self.correlations.coefficient(symbol, other) {
                if coefficient.abs() >= config.correlation_threshold {
                    return Err(RiskDenial {
                        check: "correlation",
                        reason: format!(
                            "open position in {} correlated {:.2} with {}",
                            other, coefficient, symbol
                        ),
                    });
                }
            }
        }

        let daily_budget = state.equity * config.max_daily_risk / 100.0;
        if state.daily_risk_used + candidate_risk > daily_budget {
            return Err(RiskDenial {
                check: "daily_budget",
                reason: format!(
                    "risk {:.2} + used {:.2} exceeds daily budget {:.2}",
                    candidate_risk, state.daily_risk_used, daily_budget
                ),
            });
        }

        state.daily_risk_used += candidate_risk;
        Ok(RiskReservation {
            symbol: symbol.to_string(),
            amount: candidate_risk,
        })
    }

    /// Roll back a reservation whose submission did not complete
    pub fn release(&self, reservation: RiskReservation) {
        let mut state = self.lock();
        state.daily_risk_used = (state.daily_risk_used - reservation.amount).max(0.0);
    }

    /// Per-trade risk budget under the current policy: a percentage of
    /// equity, capped by what is left of the daily budget.
    pub fn current_risk_amount(&self) -> f64 {
        let config = self.cfg();
        let state = self.lock();
        if !state.refreshed || state.equity <= 0.0 {
            return 0.0;
        }
        let base = state.equity * config.max_risk_per_trade / 100.0;
        let remaining =
            (state.equity * config.max_daily_risk / 100.0 - state.daily_risk_used).max(0.0);
        base.min(remaining)
    }

    /// Derive SL/TP from the configured equity percentages through the pip
    /// value of the actual position size. Prices are rounded to the symbol's
    /// precision.
    pub fn compute_stop_take(
        &self,
        spec: &SymbolSpec,
        entry_price: f64,
        direction: TradeDirection,
        volume: f64,
    ) -> TradingResult<StopTake> {
        let equity = {
            let state = self.lock();
            if !state.refreshed {
                return Err(TradingError::data_unavailable(
                    &spec.symbol,
                    "no account snapshot for SL/TP",
                ));
            }
            state.equity
        };

        if volume <= 0.0 || entry_price <= 0.0 {
            return Err(TradingError::ValidationFailure(format!(
                "cannot derive SL/TP for volume {} at price {}",
                volume, entry_price
            )));
        }

        let pip_value = spec.pip_value_per_lot();
        if pip_value <= 0.0 {
            return Err(TradingError::data_unavailable(
                &spec.symbol,
                "non-positive pip value",
            ));
        }

        let config = self.cfg();
        let sl_amount = equity * config.default_sl_pct / 100.0;
        let tp_amount = equity * config.default_tp_pct / 100.0;

        let sl_distance_pips = sl_amount / (volume * pip_value);
        let tp_distance_pips = tp_amount / (volume * pip_value);

        let sl_distance = sl_distance_pips * spec.pip_size();
        let tp_distance = tp_distance_pips * spec.pip_size();

        let (stop_loss, take_profit) = match direction {
            TradeDirection::Long => (entry_price - sl_distance, entry_price + tp_distance),
            TradeDirection::Short => (entry_price + sl_distance, entry_price - tp_distance),
        };

        if stop_loss <= 0.0 {
            return Err(TradingError::ValidationFailure(format!(
                "stop loss {:.5} below zero for {}",
                stop_loss, spec.symbol
            )));
        }

        Ok(StopTake {
            stop_loss: spec.round_price(stop_loss),
            take_profit: spec.round_price(take_profit),
            sl_distance_pips,
            tp_distance_pips,
        })
    }

    /// Trailing stop candidate for an open position. Moves only in the
    /// favorable direction and only by at least one pip; None means leave
    /// the stop alone.
    pub fn trailing_stop(
        &self,
        position: &BrokerPosition,
        tick: &Tick,
        pip_size: f64,
    ) -> Option<f64> {
        let config = self.cfg();
        if !config.trailing_stop_enabled {
            return None;
        }
        let distance = config.trailing_distance_pips * pip_size;

        match position.direction {
            TradeDirection::Long => {
                let candidate = tick.bid - distance;
                match position.stop_loss {
                    Some(current) if candidate - current < pip_size => None,
                    _ => Some(candidate),
                }
            }
            TradeDirection::Short => {
                let candidate = tick.ask + distance;
                match position.stop_loss {
                    Some(current) if current - candidate < pip_size => None,
                    _ => Some(candidate),
                }
            }
        }
    }

    pub fn record_trade_open(&self) {
        self.lock().daily_trade_count += 1;
    }

    /// Track a closed trade's outcome for the consecutive-loss limit
    pub fn record_trade_result(&self, pnl: f64) {
        let mut state = self.lock();
        if pnl < 0.0 {
            state.consecutive_losses += 1;
        } else {
            state.consecutive_losses = 0;
        }
    }

    pub fn state(&self) -> TradingState {
        self.lock().state
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        let state = self.lock();
        RiskSnapshot {
            state: state.state,
            equity: state.equity,
            balance: state.balance,
            peak_equity: state.peak_equity,
            current_drawdown_pct: state.current_drawdown * 100.0,
            daily_risk_used: state.daily_risk_used,
            daily_trade_count: state.daily_trade_count,
            consecutive_losses: state.consecutive_losses,
            exposure_ratio: state.exposure_ratio,
        }
    }

    /// Manual override clearing the terminal emergency state. Re-bases the
    /// equity peak so the very next refresh does not re-trigger on the same
    /// drawdown.
    pub fn reset_emergency_stop(&self) {
        let mut state = self.lock();
        if state.state == TradingState::EmergencyStopped {
            warn!("Emergency stop manually reset");
            state.state = TradingState::Normal;
            state.peak_equity = state.equity;
            state.current_drawdown = 0.0;
        }
    }
}
