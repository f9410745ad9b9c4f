// Position sizing
//
// Converts a risk budget plus a stop distance into a broker-valid lot size.
// Every method fails closed: missing symbol data means a zero volume, never
// a guessed size. All methods share the same finishing pass — floor to the
// lot step, clamp to the symbol's bounds and the global ceiling, round to
// two decimals.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use tracing::debug;

use crate::broker::{BrokerPosition, SymbolSpec};
use crate::config::{SizingConfig, SizingMethod};
use crate::risk::CorrelationTable;

const ATR_HOT_RATIO: f64 = 1.5;
const ATR_COLD_RATIO: f64 = 0.5;
const ATR_HOT_SCALE: f64 = 0.7;
const ATR_COLD_SCALE: f64 = 1.3;

/// Inputs for one sizing decision
#[derive(Debug, Clone)]
pub struct SizeInputs<'a> {
    pub entry_price: f64,
    pub stop_loss: f64,
    pub risk_amount: f64,
    pub equity: f64,
    /// Current ATR over its trailing average, when known
    pub atr_ratio: Option<f64>,
    pub open_positions: &'a [BrokerPosition],
}

/// Win/loss record per symbol, feeding the Kelly fraction
#[derive(Debug, Clone, Default)]
struct SymbolStats {
    wins: u32,
    losses: u32,
    total_win: f64,
    total_loss: f64,
}

impl SymbolStats {
    fn trades(&self) -> u32 {
        self.wins + self.losses
    }

    fn win_rate(&self) -> f64 {
        if self.trades() == 0 {
            return 0.0;
        }
        self.wins as f64 / self.trades() as f64
    }

    /// Average win over average loss
    fn payoff_ratio(&self) -> f64 {
        if self.wins == 0 || self.losses == 0 {
            return 0.0;
        }
        let avg_win = self.total_win / self.wins as f64;
        let avg_loss = self.total_loss / self.losses as f64;
        if avg_loss <= 0.0 {
            return 0.0;
        }
        avg_win / avg_loss
    }
}

#[derive(Debug, Clone)]
struct SizerSettings {
    config: SizingConfig,
    correlation_threshold: f64,
}

pub struct PositionSizer {
    settings: RwLock<SizerSettings>,
    correlations: CorrelationTable,
    stats: Mutex<HashMap<String, SymbolStats>>,
}

impl PositionSizer {
    pub fn new(
        config: SizingConfig,
        correlations: CorrelationTable,
        correlation_threshold: f64,
    ) -> Self {
        Self {
            settings: RwLock::new(SizerSettings {
                config,
                correlation_threshold,
            }),
            correlations,
            stats: Mutex::new(HashMap::new()),
        }
    }

    fn settings(&self) -> SizerSettings {
        self.settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Swap in new sizing parameters between cycles; Kelly stats survive
    pub fn update_config(&self, config: SizingConfig, correlation_threshold: f64) {
        *self
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = SizerSettings {
            config,
            correlation_threshold,
        };
    }

    /// Compute a broker-valid volume, or 0.0 when any required data is
    /// missing.
    pub fn size(&self, spec: Option<&SymbolSpec>, method: SizingMethod, inputs: &SizeInputs) -> f64 {
        let Some(spec) = spec else {
            return 0.0;
        };
        let settings = self.settings();
        let config = &settings.config;

        let lots = match method {
            SizingMethod::Fixed => Self::fixed(config, spec),
            SizingMethod::RiskBased => Self::risk_based(spec, inputs.risk_amount, inputs),
            SizingMethod::Kelly => self.kelly(config, spec, inputs),
            SizingMethod::VolatilityAdjusted => Self::volatility_adjusted(spec, inputs),
            SizingMethod::CorrelationAdjusted => {
                self.correlation_adjusted(settings.correlation_threshold, spec, inputs)
            }
        };

        if lots <= 0.0 || !lots.is_finite() {
            return 0.0;
        }
        Self::finalize(config, spec, lots)
    }

    fn fixed(config: &SizingConfig, spec: &SymbolSpec) -> f64 {
        let symbol = spec.symbol.as_str();
        let volatile = symbol.starts_with("XAU")
            || symbol.starts_with("XAG")
            || symbol.starts_with("BTC")
            || symbol.starts_with("ETH");
        if volatile {
            config.fixed_lot_volatile
        } else {
            config.fixed_lot
        }
    }

    fn risk_based(spec: &SymbolSpec, risk_amount: f64, inputs: &SizeInputs) -> f64 {
        if risk_amount <= 0.0 {
            return 0.0;
        }
        let stop_distance = (inputs.entry_price - inputs.stop_loss).abs();
        if stop_distance <= 0.0 {
            return 0.0;
        }

        let pip_value = spec.pip_value_per_lot();
        let stop_distance_pips = stop_distance / spec.pip_size();
        if pip_value <= 0.0 || stop_distance_pips <= 0.0 {
            return 0.0;
        }

        risk_amount / (stop_distance_pips * pip_value)
    }

    fn kelly(&self, config: &SizingConfig, spec: &SymbolSpec, inputs: &SizeInputs) -> f64 {
        let stats = {
            let guard = self
                .stats
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.get(&spec.symbol).cloned()
        };

        // Cold start: no history for this symbol, behave exactly like
        // risk_based.
        let Some(stats) = stats.filter(|s| s.trades() > 0) else {
            return Self::risk_based(spec, inputs.risk_amount, inputs);
        };

        let p = stats.win_rate();
        let b = if stats.payoff_ratio() > 0.0 {
            stats.payoff_ratio()
        } else {
            1.5
        };
        let q = 1.0 - p;

        let fraction = ((b * p - q) / b).clamp(config.kelly_floor, config.kelly_fraction);

        let kelly_budget = inputs.equity * fraction;
        let risk = kelly_budget.min(inputs.risk_amount);
        debug!(
            "{}: kelly f={:.3} (p={:.2}, b={:.2}), risk {:.2}",
            spec.symbol, fraction, p, b, risk
        );
        Self::risk_based(spec, risk, inputs)
    }

    fn volatility_adjusted(spec: &SymbolSpec, inputs: &SizeInputs) -> f64 {
        let scale = match inputs.atr_ratio {
            Some(ratio) if ratio > ATR_HOT_RATIO => ATR_HOT_SCALE,
            Some(ratio) if ratio < ATR_COLD_RATIO => ATR_COLD_SCALE,
            _ => 1.0,
        };
        Self::risk_based(spec, inputs.risk_amount * scale, inputs)
    }

    fn correlation_adjusted(&self, threshold: f64, spec: &SymbolSpec, inputs: &SizeInputs) -> f64 {
        let mut strongest: f64 = 0.0;
        for position in inputs.open_positions {
            if position.symbol == spec.symbol {
                continue;
            }
            if let Some(coefficient) = self.correlations.coefficient(&spec.symbol, &position.symbol)
            {
                strongest = strongest.max(coefficient.abs());
            }
        }

        let scale = if strongest >= 0.8 {
            0.5
        } else if strongest >= threshold {
            0.8
        } else {
            1.0
        };
        Self::risk_based(spec, inputs.risk_amount * scale, inputs)
    }

    /// Shared finishing pass for all methods
    fn finalize(config: &SizingConfig, spec: &SymbolSpec, lots: f64) -> f64 {
        let step = if spec.volume_step > 0.0 {
            spec.volume_step
        } else {
            0.01
        };
        // Floor to the lot step, tolerating fp noise at step boundaries
        let mut volume = (lots / step + 1e-9).floor() * step;

        let floor = spec.volume_min.max(config.min_lot);
        let ceiling = spec.volume_max.min(config.max_lot);
        volume = volume.clamp(floor, ceiling);

        (volume * 100.0).round() / 100.0
    }

    /// Feed a closed trade's outcome into the per-symbol Kelly stats
    pub fn record_trade(&self, symbol: &str, pnl: f64) {
        let mut guard = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let stats = guard.entry(symbol.to_string()).or_default();
        if pnl >= 0.0 {
            stats.wins += 1;
            stats.total_win += pnl;
        } else {
            stats.losses += 1;
            stats.total_loss += pnl.abs();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CorrelationPair;
    use crate::broker::TradeDirection;
    use chrono::Utc;

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

    fn sizer() -> PositionSizer {
        PositionSizer::new(SizingConfig::default(), CorrelationTable::default(), 0.7)
    }

    fn scenario_inputs<'a>(open: &'a [BrokerPosition]) -> SizeInputs<'a> {
        SizeInputs {
            entry_price: 1.10000,
            stop_loss: 1.09500,
            risk_amount: 100.0,
            equity: 10_000.0,
            atr_ratio: None,
            open_positions: open,
        }
    }

    #[test]
    fn test_risk_based_scenario_twenty_hundredths() {
        // $100 risk over 50 pips at $10/pip/lot -> 0.20 lots
        let volume = sizer().size(
            Some(&eurusd_spec()),
            SizingMethod::RiskBased,
            &scenario_inputs(&[]),
        );
        assert!((volume - 0.20).abs() < 1e-9);
    }

    #[test]
    fn test_missing_spec_fails_closed_for_every_method() {
        let methods = [
            SizingMethod::Fixed,
            SizingMethod::RiskBased,
            SizingMethod::Kelly,
            SizingMethod::VolatilityAdjusted,
            SizingMethod::CorrelationAdjusted,
        ];
        for method in methods {
            let volume = sizer().size(None, method, &scenario_inputs(&[]));
            assert_eq!(volume, 0.0, "{:?} must fail closed", method);
        }
    }

    #[test]
    fn test_zero_stop_distance_fails_closed() {
        let inputs = SizeInputs {
            stop_loss: 1.10000,
            ..scenario_inputs(&[])
        };
        let volume = sizer().size(Some(&eurusd_spec()), SizingMethod::RiskBased, &inputs);
        assert_eq!(volume, 0.0);
    }

    #[test]
    fn test_kelly_cold_start_equals_risk_based() {
        let sizer = sizer();
        let inputs = scenario_inputs(&[]);
        let kelly = sizer.size(Some(&eurusd_spec()), SizingMethod::Kelly, &inputs);
        let risk_based = sizer.size(Some(&eurusd_spec()), SizingMethod::RiskBased, &inputs);
        assert!((kelly - risk_based).abs() < 1e-12);
    }

    #[test]
    fn test_kelly_with_history_caps_budget() {
        let sizer = sizer();
        // Strong record: fraction clamps at kelly_fraction (0.25), budget
        // 2500 > risk_amount 100 -> still bounded by the external budget
        for _ in 0..8 {
            sizer.record_trade("EURUSD", 150.0);
        }
        for _ in 0..2 {
            sizer.record_trade("EURUSD", -100.0);
        }

        let inputs = scenario_inputs(&[]);
        let kelly = sizer.size(Some(&eurusd_spec()), SizingMethod::Kelly, &inputs);
        let risk_based = sizer.size(Some(&eurusd_spec()), SizingMethod::RiskBased, &inputs);
        assert!(kelly <= risk_based + 1e-12);
        assert!(kelly > 0.0);
    }

    #[test]
    fn test_kelly_poor_history_floors_at_minimum() {
        let sizer = sizer();
        for _ in 0..9 {
            sizer.record_trade("EURUSD", -100.0);
        }
        sizer.record_trade("EURUSD", 50.0);

        let inputs = scenario_inputs(&[]);
        let kelly = sizer.size(Some(&eurusd_spec()), SizingMethod::Kelly, &inputs);
        // kelly_floor 0.01 of 10k equity = 100 budget, same as risk_amount
        assert!(kelly > 0.0);
    }

    #[test]
    fn test_volatility_adjustment_scales_down_when_hot() {
        let sizer = sizer();
        let hot = SizeInputs {
            atr_ratio: Some(2.0),
            ..scenario_inputs(&[])
        };
        let calm = SizeInputs {
            atr_ratio: Some(1.0),
            ..scenario_inputs(&[])
        };

        let hot_volume = sizer.size(Some(&eurusd_spec()), SizingMethod::VolatilityAdjusted, &hot);
        let calm_volume = sizer.size(Some(&eurusd_spec()), SizingMethod::VolatilityAdjusted, &calm);
        assert!(hot_volume < calm_volume);
        assert!((hot_volume - 0.14).abs() < 1e-9); // 0.7 * 0.20
    }

    #[test]
    fn test_volatility_adjustment_scales_up_when_quiet() {
        let sizer = sizer();
        let quiet = SizeInputs {
            atr_ratio: Some(0.3),
            ..scenario_inputs(&[])
        };
        let volume = sizer.size(Some(&eurusd_spec()), SizingMethod::VolatilityAdjusted, &quiet);
        assert!((volume - 0.26).abs() < 1e-9); // 1.3 * 0.20
    }

    #[test]
    fn test_correlation_adjustment_halves_on_strong_overlap() {
        let table = CorrelationTable::new(vec![CorrelationPair {
            a: "EURUSD".to_string(),
            b: "GBPUSD".to_string(),
            coefficient: 0.85,
        }]);
        let sizer = PositionSizer::new(SizingConfig::default(), table, 0.7);

        let open = vec![BrokerPosition {
            ticket: 1,
            symbol: "GBPUSD".to_string(),
            direction: TradeDirection::Long,
            volume: 0.1,
            entry_price: 1.25,
            stop_loss: None,
            take_profit: None,
            open_time: Utc::now(),
            strategy_tag: "swing".to_string(),
            unrealized_pnl: 0.0,
        }];
        let volume = sizer.size(
            Some(&eurusd_spec()),
            SizingMethod::CorrelationAdjusted,
            &scenario_inputs(&open),
        );
        assert!((volume - 0.10).abs() < 1e-9); // 0.5 * 0.20
    }

    #[test]
    fn test_finalize_floors_to_step_and_clamps() {
        let sizer = sizer();
        // Risk that computes to 0.2349... lots floors to 0.23
        let inputs = SizeInputs {
            risk_amount: 117.45,
            ..scenario_inputs(&[])
        };
        let volume = sizer.size(Some(&eurusd_spec()), SizingMethod::RiskBased, &inputs);
        assert!((volume - 0.23).abs() < 1e-9);

        // Oversized request clamps to the global ceiling
        let inputs = SizeInputs {
            risk_amount: 100_000.0,
            ..scenario_inputs(&[])
        };
        let volume = sizer.size(Some(&eurusd_spec()), SizingMethod::RiskBased, &inputs);
        assert!((volume - SizingConfig::default().max_lot).abs() < 1e-9);
    }

    #[test]
    fn test_fixed_lot_by_asset_class() {
        let sizer = sizer();
        let fx = sizer.size(Some(&eurusd_spec()), SizingMethod::Fixed, &scenario_inputs(&[]));
        assert!((fx - 0.10).abs() < 1e-9);

        let gold_spec = SymbolSpec {
            symbol: "XAUUSD".to_string(),
            point: 0.01,
            digits: 2,
            contract_size: 100.0,
            volume_min: 0.01,
            volume_max: 50.0,
            volume_step: 0.01,
            tick_value: 1.0,
        };
        let gold = sizer.size(Some(&gold_spec), SizingMethod::Fixed, &scenario_inputs(&[]));
        assert!((gold - 0.01).abs() < 1e-9);
    }
}
