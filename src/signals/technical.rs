// Technical analysis signal provider
//
// Classic indicator battery over the freshest usable candle window. Each
// indicator votes into a trend score; the score maps onto a continuous
// direction and the agreement between votes onto strength.

use crate::broker::Candle;
use crate::data::SymbolSnapshot;
use crate::error::TradingResult;

use super::{Signal, SignalCategory, SignalProvider};

const MIN_CANDLES: usize = 35;
const ATR_STOP_MULTIPLIER: f64 = 1.5;

pub fn sma(values: &[f64], period: usize) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    if values.len() < period {
        return values.iter().sum::<f64>() / values.len() as f64;
    }
    let start = values.len() - period;
    values[start..].iter().sum::<f64>() / period as f64
}

pub fn ema(values: &[f64], period: usize) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut ema = values[0];
    for &value in &values[1..] {
        ema = alpha * value + (1.0 - alpha) * ema;
    }
    ema
}

pub fn rsi(values: &[f64], period: usize) -> f64 {
    if values.len() < period + 1 {
        return 50.0;
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=period {
        let idx = values.len() - period - 1 + i;
        let change = values[idx] - values[idx - 1];
        if change >= 0.0 {
            gains += change;
        } else {
            losses += change.abs();
        }
    }

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;

    if avg_loss == 0.0 {
        return 100.0;
    }

    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// MACD line and signal line (12/26/9)
pub fn macd(values: &[f64]) -> (f64, f64) {
    let macd_line = ema(values, 12) - ema(values, 26);

    // Signal line: EMA of the MACD series over the last 9 bars
    let mut series = Vec::with_capacity(9);
    let start = values.len().saturating_sub(9);
    for i in start..values.len() {
        let window = &values[..=i];
        series.push(ema(window, 12) - ema(window, 26));
    }
    (macd_line, ema(&series, 9))
}

/// Bollinger band bounds (period, deviations) around the period SMA
pub fn bollinger(values: &[f64], period: usize, deviations: f64) -> (f64, f64) {
    let mid = sma(values, period);
    if values.len() < period {
        return (mid, mid);
    }
    let start = values.len() - period;
    let variance = values[start..]
        .iter()
        .map(|&v| (v - mid).powi(2))
        .sum::<f64>()
        / period as f64;
    let std = variance.sqrt();
    (mid + deviations * std, mid - deviations * std)
}

pub fn atr(candles: &[Candle], period: usize) -> f64 {
    if candles.len() < 2 {
        return 0.0;
    }

    let mut true_ranges = Vec::with_capacity(candles.len() - 1);
    for i in 1..candles.len() {
        let high_low = candles[i].high - candles[i].low;
        let high_close = (candles[i].high - candles[i - 1].close).abs();
        let low_close = (candles[i].low - candles[i - 1].close).abs();
        true_ranges.push(high_low.max(high_close).max(low_close));
    }

    let take = period.min(true_ranges.len());
    true_ranges.iter().rev().take(take).sum::<f64>() / take as f64
}

/// Current ATR against its trailing average, as a ratio. Used by the
/// volatility-adjusted sizer; >1 means hotter than usual.
pub fn atr_ratio(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period * 3 {
        return None;
    }
    let current = atr(candles, period);
    let trailing = atr(&candles[..candles.len() - period], period * 2);
    if trailing <= 0.0 {
        return None;
    }
    Some(current / trailing)
}

pub struct TechnicalSignalProvider;

impl TechnicalSignalProvider {
    pub fn new() -> Self {
        Self
    }

    fn score_window(&self, candles: &[Candle]) -> (f64, f64) {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let last = *closes.last().unwrap_or(&0.0);

        let mut score = 0.0;
        let mut votes = 0.0;

        // Moving average alignment
        let sma_short = sma(&closes, 5);
        let sma_long = sma(&closes, 20);
        if sma_short > sma_long {
            score += 1.0;
        } else if sma_short < sma_long {
            score -= 1.0;
        }
        votes += 1.0;

        // EMA crossover
        let ema_fast = ema(&closes, 12);
        let ema_slow = ema(&closes, 26);
        if ema_fast > ema_slow {
            score += 0.5;
        } else {
            score -= 0.5;
        }
        votes += 0.5;

        // MACD against its signal line
        let (macd_line, signal_line) = macd(&closes);
        if macd_line > signal_line {
            score += 0.5;
        } else {
            score -= 0.5;
        }
        votes += 0.5;

        // RSI extremes fade the move, mid-range follows it
        let rsi_value = rsi(&closes, 14);
        if rsi_value > 70.0 {
            score -= 0.5;
        } else if rsi_value < 30.0 {
            score += 0.5;
        } else if rsi_value > 55.0 {
            score += 0.3;
        } else if rsi_value < 45.0 {
            score -= 0.3;
        }
        votes += 0.5;

        // Bollinger breakout
        let (upper, lower) = bollinger(&closes, 20, 2.0);
        if last > upper {
            score += 0.5;
        } else if last < lower {
            score -= 0.5;
        }
        votes += 0.5;

        (score / votes, (score / votes).abs())
    }
}

impl Default for TechnicalSignalProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalProvider for TechnicalSignalProvider {
    fn category(&self) -> SignalCategory {
        SignalCategory::Technical
    }

    fn evaluate(&self, symbol: &str, snapshot: &SymbolSnapshot) -> TradingResult<Option<Signal>> {
        let mut direction_sum = 0.0;
        let mut strength_sum = 0.0;
        let mut windows = 0usize;
        let mut stop_basis: Option<(f64, f64)> = None; // (last close, atr)

        let mut frames: Vec<_> = snapshot.windows.keys().copied().collect();
        frames.sort_by_key(|tf| tf.minutes());

        for tf in frames {
            let Some(candles) = snapshot.window(tf) else {
                continue;
            };
            if candles.len() < MIN_CANDLES {
                continue;
            }

            let (direction, strength) = self.score_window(candles);
            direction_sum += direction;
            strength_sum += strength;
            windows += 1;

            if stop_basis.is_none() {
                let range = atr(candles, 14);
                if range > 0.0 {
                    stop_basis = Some((candles[candles.len() - 1].close, range));
                }
            }
        }

        if windows == 0 {
            return Ok(None);
        }

        let direction = (direction_sum / windows as f64).clamp(-1.0, 1.0);
        let strength = (strength_sum / windows as f64).clamp(0.0, 1.0);

        if direction == 0.0 {
            return Ok(None);
        }

        let mut signal = Signal::new(symbol, SignalCategory::Technical, direction, strength)?;
        if let Some((close, range)) = stop_basis {
            let stop = if direction > 0.0 {
                close - ATR_STOP_MULTIPLIER * range
            } else {
                close + ATR_STOP_MULTIPLIER * range
            };
            signal = signal.with_entry_hint(close).with_stop_hint(stop);
        }

        Ok(Some(signal))
    }
}
