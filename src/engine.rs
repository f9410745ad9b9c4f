// Trading engine
//
// The orchestrator runs two flows per cycle over one refreshed view of the
// account: signal-to-order (data -> providers -> aggregate -> risk gate ->
// size -> place) and position monitoring (trailing stop, hold-time exit,
// loss cutoff). Provider evaluation is CPU-bound and fans out across a
// rayon pool; admission and submission stay strictly serialized so the risk
// budget can never be double-spent. Risk state is recomputed before either
// flow, so every decision in a cycle sees that cycle's numbers.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::Utc;
use rayon::prelude::*;
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{
    AccountSnapshot, Broker, BrokerPosition, OrderRequest, SymbolSpec, Timeframe, TradeDirection,
};
use crate::config::Config;
use crate::data::{MarketDataCache, SymbolSnapshot};
use crate::error::{TradingError, TradingResult};
use crate::notify::{Notifier, TradeEvent};
use crate::orders::{CloseFilter, CoordinatorLimits, OrderCoordinator, PlaceOutcome};
use crate::risk::{OpenExposure, PositionSizer, RiskEvent, RiskManager, SizeInputs, TradingState};
use crate::signals::technical::atr_ratio;
use crate::signals::{
    AggregatedDecision, MlSignalProvider, PatternSignalProvider, SentimentSignalProvider, Signal,
    SignalAggregator, SignalProvider, TechnicalSignalProvider,
};
use crate::risk::CorrelationTable;

const DEFAULT_CONTRACT_SIZE: f64 = 100_000.0;
const ATR_RATIO_MIN_CANDLES: usize = 42;

/// Per-cycle outcome counters, mainly for logging and tests
#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    pub evaluated_symbols: usize,
    pub trades_opened: usize,
    pub denials: usize,
    pub rejections: usize,
    pub positions_monitored: usize,
    pub positions_closed: usize,
    pub emergency_stop: bool,
    pub signal_flow_paused: bool,
}

pub struct TradingEngine {
    broker: Arc<dyn Broker>,
    cache: Arc<MarketDataCache>,
    providers: Vec<Arc<dyn SignalProvider>>,
    aggregator: SignalAggregator,
    risk: Arc<RiskManager>,
    sizer: Arc<PositionSizer>,
    orders: Arc<OrderCoordinator>,
    notifier: Arc<dyn Notifier>,
    config: Config,
    config_path: Option<PathBuf>,
    config_mtime: Option<SystemTime>,
    specs: HashMap<String, SymbolSpec>,
    connectivity_failures: u32,
    signal_flow_paused: bool,
    cached_positions: Vec<BrokerPosition>,
    stop: Arc<AtomicBool>,
}

impl TradingEngine {
    pub fn new(
        broker: Arc<dyn Broker>,
        config: Config,
        notifier: Arc<dyn Notifier>,
    ) -> TradingResult<Self> {
        config.validate()?;

        let correlations = CorrelationTable::new(config.correlations.clone());
        let risk = Arc::new(RiskManager::new(config.risk.clone(), correlations.clone()));
        let sizer = Arc::new(PositionSizer::new(
            config.sizing.clone(),
            correlations,
            config.risk.correlation_threshold,
        ));
        let orders = Arc::new(OrderCoordinator::new(
            broker.clone(),
            risk.clone(),
            Self::limits_from(&config),
        ));
        let cache = Arc::new(MarketDataCache::new(config.engine.staleness_factor));
        let aggregator = SignalAggregator::new(config.signal_weights)?;

        let providers: Vec<Arc<dyn SignalProvider>> = vec![
            Arc::new(TechnicalSignalProvider::new()),
            Arc::new(PatternSignalProvider::new()),
            Arc::new(SentimentSignalProvider::new()),
            Arc::new(MlSignalProvider::disabled()),
        ];

        Ok(Self {
            broker,
            cache,
            providers,
            aggregator,
            risk,
            sizer,
            orders,
            notifier,
            config,
            config_path: None,
            config_mtime: None,
            specs: HashMap::new(),
            connectivity_failures: 0,
            signal_flow_paused: false,
            cached_positions: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Replace the default provider set (tests, custom ML wiring)
    pub fn with_providers(mut self, providers: Vec<Arc<dyn SignalProvider>>) -> Self {
        self.providers = providers;
        self
    }

    /// Watch a config file for hot reload between cycles
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        self.config_path = Some(path);
        self
    }

    fn limits_from(config: &Config) -> CoordinatorLimits {
        CoordinatorLimits {
            max_active_orders: config.engine.max_active_orders,
            max_daily_trades: config.engine.max_daily_trades,
            strategy_caps: config
                .strategies
                .iter()
                .map(|(name, s)| (name.clone(), s.max_positions))
                .collect(),
        }
    }

    /// Flag the run loop to stop after the current cycle
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn orders(&self) -> &OrderCoordinator {
        &self.orders
    }

    /// Run the periodic loop until stopped or the optional duration elapses
    pub async fn run(&mut self, duration: Option<Duration>) -> TradingResult<()> {
        info!(
            "🚀 Trading engine started: {} strategies, cycle {}ms",
            self.config.enabled_strategies().count(),
            self.config.engine.cycle_interval_ms
        );

        let started = tokio::time::Instant::now();
        let mut ticker = interval(Duration::from_millis(self.config.engine.cycle_interval_ms));

        loop {
            if self.stop.load(Ordering::Relaxed) {
                info!("Stop requested, shutting down engine loop");
                break;
            }
            if let Some(limit) = duration {
                if started.elapsed() >= limit {
                    info!("⏰ Session duration reached");
                    break;
                }
            }

            ticker.tick().await;

            match self.run_cycle().await {
                Ok(report) => {
                    if report.trades_opened > 0 || report.positions_closed > 0 {
                        info!(
                            "cycle: {} opened, {} closed, {} denied, {} monitored",
                            report.trades_opened,
                            report.positions_closed,
                            report.denials,
                            report.positions_monitored
                        );
                    }
                }
                Err(e) => error!("cycle failed: {}", e),
            }
        }

        Ok(())
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = TradingResult<T>>,
    ) -> TradingResult<T> {
        let limit = Duration::from_millis(self.config.engine.broker_timeout_ms);
        match timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(TradingError::BrokerTimeout(format!(
                "broker call exceeded {}ms",
                limit.as_millis()
            ))),
        }
    }

    /// One full evaluation cycle
    pub async fn run_cycle(&mut self) -> TradingResult<CycleReport> {
        let mut report = CycleReport::default();

        self.maybe_reload_config();

        // Refresh broker truth first; everything downstream works off this
        // one view.
        let refreshed = {
            let account = self.bounded(self.broker.account_info()).await;
            match account {
                Ok(account) => match self.bounded(self.broker.positions()).await {
                    Ok(positions) => Ok((account, positions)),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            }
        };

        let (account, positions) = match refreshed {
            Ok(ok) => {
                if self.signal_flow_paused {
                    info!("🔌 Broker connectivity restored, resuming signal flow");
                }
                self.connectivity_failures = 0;
                self.signal_flow_paused = false;
                ok
            }
            Err(e) => {
                self.connectivity_failures += 1;
                warn!(
                    "broker refresh failed ({} consecutive): {}",
                    self.connectivity_failures, e
                );
                if self.connectivity_failures >= self.config.engine.max_connectivity_failures {
                    if !self.signal_flow_paused {
                        warn!("🔌 Pausing signal flow after repeated connectivity failures");
                    }
                    self.signal_flow_paused = true;
                }
                report.signal_flow_paused = self.signal_flow_paused;
                // Monitoring still runs on the cached mirror, best effort
                let cached = self.cached_positions.clone();
                let monitored = self.monitor_positions(&cached, None, &mut report).await;
                report.positions_monitored = monitored;
                return Ok(report);
            }
        };
        self.cached_positions = positions.clone();

        self.ensure_specs(&positions).await;

        // Account for trades the broker closed since last cycle
        for record in self.orders.sync_positions(&positions) {
            let pnl = record.last_known_pnl;
            self.sizer.record_trade(&record.symbol, pnl);
            self.risk.record_trade_result(pnl);
            self.notifier.notify(&TradeEvent::TradeClosed {
                timestamp: Utc::now(),
                symbol: record.symbol.clone(),
                ticket: record.ticket,
                reason: record
                    .close_reason
                    .unwrap_or_else(|| "closed by broker".to_string()),
                pnl,
            });
            report.positions_closed += 1;
        }

        // Risk state recomputation precedes both flows
        let exposures = positions
            .iter()
            .map(|p| OpenExposure {
                symbol: p.symbol.clone(),
                notional: p.notional(
                    self.specs
                        .get(&p.symbol)
                        .map(|s| s.contract_size)
                        .unwrap_or(DEFAULT_CONTRACT_SIZE),
                ),
            })
            .collect();
        let events = self.risk.refresh(&account, exposures, Utc::now());

        for event in &events {
            match event {
                RiskEvent::EmergencyStopTriggered { drawdown_pct } => {
                    report.emergency_stop = true;
                    let closed = self
                        .orders
                        .close_all(&positions, CloseFilter::All, "emergency stop")
                        .await;
                    report.positions_closed += closed;
                    self.notifier.notify(&TradeEvent::EmergencyStop {
                        timestamp: Utc::now(),
                        drawdown_pct: *drawdown_pct,
                        positions_closed: closed,
                    });
                }
                RiskEvent::DailyLimitReached { reason } => {
                    self.notifier.notify(&TradeEvent::DailyLimitReached {
                        timestamp: Utc::now(),
                        reason: reason.clone(),
                    });
                }
                RiskEvent::NewTradingDay => {}
            }
        }

        if self.risk.state() == TradingState::EmergencyStopped {
            // While stopped, every cycle keeps flagging whatever is still
            // open for closure; trading does not resume silently.
            if !report.emergency_stop {
                let live = match self.bounded(self.broker.positions()).await {
                    Ok(live) => live,
                    Err(_) => Vec::new(),
                };
                if !live.is_empty() {
                    report.positions_closed += self
                        .orders
                        .close_all(&live, CloseFilter::All, "emergency stop")
                        .await;
                }
            }
            return Ok(report);
        }

        if !self.signal_flow_paused {
            self.signal_to_order_flow(&account, &positions, &mut report)
                .await?;
        }

        let monitored = self
            .monitor_positions(&positions, Some(account.equity), &mut report)
            .await;
        report.positions_monitored = monitored;

        Ok(report)
    }

    /// Resolve and cache symbol specs for configured symbols and any symbol
    /// with an open position. Missing specs fail closed downstream.
    async fn ensure_specs(&mut self, positions: &[BrokerPosition]) {
        let mut wanted: Vec<String> = self
            .config
            .enabled_strategies()
            .flat_map(|(_, s)| s.symbols.iter().cloned())
            .collect();
        wanted.extend(positions.iter().map(|p| p.symbol.clone()));
        wanted.sort();
        wanted.dedup();

        for symbol in wanted {
            if self.specs.contains_key(&symbol) {
                continue;
            }
            match self.bounded(self.broker.symbol_spec(&symbol)).await {
                Ok(spec) => {
                    self.specs.insert(symbol, spec);
                }
                Err(e) => warn!("symbol spec fetch failed for {}: {}", symbol, e),
            }
        }
    }

    /// Data refresh, parallel provider evaluation, then serialized
    /// admission and submission. Per-symbol failures never abort the rest
    /// of the cycle.
    async fn signal_to_order_flow(
        &mut self,
        account: &AccountSnapshot,
        positions: &[BrokerPosition],
        report: &mut CycleReport,
    ) -> TradingResult<()> {
        // Union of timeframes per symbol across enabled strategies
        let mut symbol_frames: HashMap<String, Vec<Timeframe>> = HashMap::new();
        for (_, strategy) in self.config.enabled_strategies() {
            for symbol in &strategy.symbols {
                let frames = symbol_frames.entry(symbol.clone()).or_default();
                for tf in &strategy.timeframes {
                    if !frames.contains(tf) {
                        frames.push(*tf);
                    }
                }
            }
        }

        let count = self.config.engine.candle_history;
        let mut work: Vec<(String, SymbolSnapshot)> = Vec::new();
        let now = Utc::now();

        for (symbol, frames) in &symbol_frames {
            let refresh = self
                .bounded(self.cache.refresh_symbol(self.broker.as_ref(), symbol, frames, count))
                .await;
            if let Err(e) = refresh {
                debug!("skipping {} this cycle: {}", symbol, e);
                continue;
            }
            match self.cache.snapshot(symbol, now) {
                Some(snapshot) => work.push((symbol.clone(), snapshot)),
                None => debug!("no fresh data for {}", symbol),
            }
        }

        report.evaluated_symbols = work.len();
        if work.is_empty() {
            return Ok(());
        }

        // CPU-bound provider evaluation fans out on the rayon pool; this is
        // read-only over the snapshots and safe to run fully in parallel.
        let providers = self.providers.clone();
        let evaluated: Vec<(String, Vec<Signal>, Option<f64>)> =
            tokio::task::spawn_blocking(move || {
                work.into_par_iter()
                    .map(|(symbol, snapshot)| {
                        let mut signals = Vec::new();
                        for provider in &providers {
                            match provider.evaluate(&symbol, &snapshot) {
                                Ok(Some(signal)) => signals.push(signal),
                                Ok(None) => {}
                                Err(e) => {
                                    debug!("{} provider failed for {}: {}", provider.category(), symbol, e)
                                }
                            }
                        }
                        let ratio = snapshot
                            .any_window(ATR_RATIO_MIN_CANDLES)
                            .and_then(|candles| atr_ratio(candles, 14));
                        (symbol, signals, ratio)
                    })
                    .collect()
            })
            .await
            .map_err(|e| TradingError::Internal(format!("evaluation pool failed: {}", e)))?;

        let mut decisions: HashMap<String, (AggregatedDecision, Option<f64>)> = HashMap::new();
        for (symbol, signals, ratio) in evaluated {
            let decision = self.aggregator.aggregate(&symbol, &signals);
            decisions.insert(symbol, (decision, ratio));
        }

        // Admission and submission are serialized: one candidate at a time
        // goes through the gate, and its submission is acknowledged before
        // the next candidate is considered.
        let strategy_list: Vec<(String, crate::config::StrategyConfig)> = self
            .config
            .enabled_strategies()
            .map(|(name, s)| (name.clone(), s.clone()))
            .collect();

        for (strategy_name, strategy) in strategy_list {
            for symbol in &strategy.symbols {
                let Some((decision, ratio)) = decisions.get(symbol) else {
                    continue;
                };
                if decision.is_neutral() || decision.strength < strategy.min_signal_strength {
                    continue;
                }
                let Some(direction) = TradeDirection::from_sign(decision.direction) else {
                    continue;
                };

                let opened = self
                    .try_open(
                        &strategy_name,
                        &strategy,
                        symbol,
                        direction,
                        decision,
                        *ratio,
                        account,
                        positions,
                        report,
                    )
                    .await;
                if let Err(e) = opened {
                    if e.is_denial() {
                        report.denials += 1;
                    } else {
                        warn!("order attempt failed for {} [{}]: {}", symbol, strategy_name, e);
                    }
                }
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_open(
        &self,
        strategy_name: &str,
        strategy: &crate::config::StrategyConfig,
        symbol: &str,
        direction: TradeDirection,
        decision: &AggregatedDecision,
        atr_ratio: Option<f64>,
        account: &AccountSnapshot,
        positions: &[BrokerPosition],
        report: &mut CycleReport,
    ) -> TradingResult<()> {
        let risk_amount = self.risk.current_risk_amount() * strategy.weight;
        if risk_amount <= 0.0 {
            return Err(TradingError::RiskGateDenied {
                check: "risk_amount".to_string(),
                reason: "no risk budget available".to_string(),
            });
        }

        // The gate reserves the budget here; every failure path below must
        // release it.
        let reservation = match self.risk.admit(symbol, risk_amount) {
            Ok(reservation) => reservation,
            Err(denial) => {
                info!("🚫 {} [{}] denied by {}: {}", symbol, strategy_name, denial.check, denial.reason);
                return Err(denial.into());
            }
        };

        let Some(spec) = self.specs.get(symbol).cloned() else {
            self.risk.release(reservation);
            return Err(TradingError::data_unavailable(symbol, "no symbol spec"));
        };

        let tick = match self.bounded(self.broker.tick(symbol)).await {
            Ok(tick) => tick,
            Err(e) => {
                self.risk.release(reservation);
                return Err(e);
            }
        };
        let entry_price = tick.entry_price(direction);

        // Sizing stop: signal hint when it sits on the protective side,
        // otherwise the configured default distance.
        let default_stop = match direction {
            TradeDirection::Long => {
                entry_price - self.config.risk.default_stop_pips * spec.pip_size()
            }
            TradeDirection::Short => {
                entry_price + self.config.risk.default_stop_pips * spec.pip_size()
            }
        };
        let sizing_stop = decision
            .stop_hint()
            .filter(|&stop| match direction {
                TradeDirection::Long => stop < entry_price,
                TradeDirection::Short => stop > entry_price,
            })
            .unwrap_or(default_stop);

        let inputs = SizeInputs {
            entry_price,
            stop_loss: sizing_stop,
            risk_amount,
            equity: account.equity,
            atr_ratio,
            open_positions: positions,
        };
        let volume = self
            .sizer
            .size(Some(&spec), self.config.sizing.method, &inputs);
        if volume <= 0.0 {
            self.risk.release(reservation);
            debug!("{} [{}]: sizer returned zero volume", symbol, strategy_name);
            return Ok(());
        }

        let stop_take = match self.risk.compute_stop_take(&spec, entry_price, direction, volume) {
            Ok(stop_take) => stop_take,
            Err(e) => {
                self.risk.release(reservation);
                return Err(e);
            }
        };

        let request = OrderRequest {
            client_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            direction,
            volume,
            entry_price,
            stop_loss: stop_take.stop_loss,
            take_profit: stop_take.take_profit,
            strategy_tag: strategy_name.to_string(),
            signal_strength: decision.strength,
        };

        match self.orders.place(&spec, request, reservation).await? {
            PlaceOutcome::Placed(info) => {
                report.trades_opened += 1;
                self.notifier.notify(&TradeEvent::TradeOpened {
                    timestamp: Utc::now(),
                    symbol: symbol.to_string(),
                    direction,
                    volume: info.request.volume,
                    entry_price: info.executed_price,
                    stop_loss: info.request.stop_loss,
                    take_profit: info.request.take_profit,
                    strategy: strategy_name.to_string(),
                    ticket: info.ticket,
                    signal_strength: decision.strength,
                });
            }
            PlaceOutcome::Rejected { .. } => {
                report.rejections += 1;
            }
        }

        Ok(())
    }

    /// Position monitoring flow. Failures are contained per position.
    async fn monitor_positions(
        &self,
        positions: &[BrokerPosition],
        equity: Option<f64>,
        report: &mut CycleReport,
    ) -> usize {
        let now = Utc::now();
        let mut monitored = 0;

        for position in positions {
            monitored += 1;

            let Some(spec) = self.specs.get(&position.symbol) else {
                continue;
            };

            // Strategy-specific hold limit when the tag is recognized
            let hold_limit = self
                .config
                .strategies
                .get(&position.strategy_tag)
                .and_then(|s| s.max_hold_hours)
                .unwrap_or(self.config.engine.max_hold_hours);

            if position.age_hours(now) >= hold_limit {
                if let Err(e) = self.orders.close(position.ticket, "time-based exit").await {
                    warn!("time-based close failed for {}: {}", position.ticket, e);
                } else {
                    self.notifier.notify(&TradeEvent::TradeClosed {
                        timestamp: now,
                        symbol: position.symbol.clone(),
                        ticket: position.ticket,
                        reason: "time-based exit".to_string(),
                        pnl: position.unrealized_pnl,
                    });
                    report.positions_closed += 1;
                }
                continue;
            }

            // Per-position emergency loss cutoff
            if let Some(equity) = equity {
                let cutoff = equity * self.config.engine.position_loss_cutoff_pct / 100.0;
                if position.unrealized_pnl <= -cutoff {
                    if let Err(e) = self.orders.close(position.ticket, "loss cutoff").await {
                        warn!("loss-cutoff close failed for {}: {}", position.ticket, e);
                    } else {
                        self.notifier.notify(&TradeEvent::TradeClosed {
                            timestamp: now,
                            symbol: position.symbol.clone(),
                            ticket: position.ticket,
                            reason: "loss cutoff".to_string(),
                            pnl: position.unrealized_pnl,
                        });
                        report.positions_closed += 1;
                    }
                    continue;
                }
            }

            // Trailing stop moves only in the favorable direction
            let tick = match self.bounded(self.broker.tick(&position.symbol)).await {
                Ok(tick) => tick,
                Err(e) => {
                    debug!("tick unavailable for {}: {}", position.symbol, e);
                    continue;
                }
            };
            if let Some(new_sl) = self.risk.trailing_stop(position, &tick, spec.pip_size()) {
                let rounded = spec.round_price(new_sl);
                match self.orders.modify(position.ticket, Some(rounded), None).await {
                    Ok(()) => debug!(
                        "🔃 trailed stop for {} to {:.5}",
                        position.ticket, rounded
                    ),
                    Err(e) => warn!("trailing modify failed for {}: {}", position.ticket, e),
                }
            }
        }

        monitored
    }

    /// Pick up config file changes between cycles, never mid-cycle
    fn maybe_reload_config(&mut self) {
        let Some(path) = self.config_path.clone() else {
            return;
        };
        match Config::reload_if_changed(&path, &mut self.config_mtime) {
            Ok(Some(fresh)) => {
                match SignalAggregator::new(fresh.signal_weights) {
                    Ok(aggregator) => self.aggregator = aggregator,
                    Err(e) => {
                        warn!("config reload kept old signal weights: {}", e);
                        return;
                    }
                }
                self.risk.update_config(fresh.risk.clone());
                self.sizer
                    .update_config(fresh.sizing.clone(), fresh.risk.correlation_threshold);
                self.orders.update_limits(Self::limits_from(&fresh));
                self.config = fresh;
                info!("🔄 Configuration reloaded from {}", path.display());
            }
            Ok(None) => {}
            Err(e) => warn!("config reload failed, keeping previous: {}", e),
        }
    }
}
