// Candlestick pattern signal provider
//
// Recognizes a small set of reversal/continuation formations on the shortest
// fresh window and scores them against the prevailing short trend.

use crate::broker::Candle;
use crate::data::SymbolSnapshot;
use crate::error::TradingResult;

use super::technical::sma;
use super::{Signal, SignalCategory, SignalProvider};

const MIN_CANDLES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandlePattern {
    BullishEngulfing,
    BearishEngulfing,
    Hammer,
    ShootingStar,
    Doji,
}

impl CandlePattern {
    fn direction(&self) -> f64 {
        match self {
            CandlePattern::BullishEngulfing | CandlePattern::Hammer => 1.0,
            CandlePattern::BearishEngulfing | CandlePattern::ShootingStar => -1.0,
            CandlePattern::Doji => 0.0,
        }
    }

    fn base_strength(&self) -> f64 {
        match self {
            CandlePattern::BullishEngulfing | CandlePattern::BearishEngulfing => 0.8,
            CandlePattern::Hammer | CandlePattern::ShootingStar => 0.6,
            CandlePattern::Doji => 0.2,
        }
    }
}

fn detect_last_pattern(candles: &[Candle]) -> Option<CandlePattern> {
    if candles.len() < 2 {
        return None;
    }
    let prev = &candles[candles.len() - 2];
    let last = &candles[candles.len() - 1];

    let range = last.range();
    if range <= 0.0 {
        return None;
    }
    let body = last.body();
    let upper_wick = last.high - last.open.max(last.close);
    let lower_wick = last.open.min(last.close) - last.low;

    // Engulfing: current body swallows the previous body, opposite color
    if last.is_bullish() && !prev.is_bullish() && last.close > prev.open && last.open < prev.close {
        return Some(CandlePattern::BullishEngulfing);
    }
    if !last.is_bullish() && prev.is_bullish() && last.open > prev.close && last.close < prev.open {
        return Some(CandlePattern::BearishEngulfing);
    }

    // Doji: negligible body
    if body / range < 0.1 {
        return Some(CandlePattern::Doji);
    }

    // Hammer: long lower wick, small upper wick
    if lower_wick >= 2.0 * body && upper_wick <= body * 0.5 {
        return Some(CandlePattern::Hammer);
    }

    // Shooting star: long upper wick, small lower wick
    if upper_wick >= 2.0 * body && lower_wick <= body * 0.5 {
        return Some(CandlePattern::ShootingStar);
    }

    None
}

pub struct PatternSignalProvider;

impl PatternSignalProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PatternSignalProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalProvider for PatternSignalProvider {
    fn category(&self) -> SignalCategory {
        SignalCategory::Pattern
    }

    fn evaluate(&self, symbol: &str, snapshot: &SymbolSnapshot) -> TradingResult<Option<Signal>> {
        let Some(candles) = snapshot.any_window(MIN_CANDLES) else {
            return Ok(None);
        };

        let Some(pattern) = detect_last_pattern(candles) else {
            return Ok(None);
        };

        let direction = pattern.direction();
        if direction == 0.0 {
            // A doji alone carries no tradable direction
            return Ok(None);
        }

        // Reversal patterns score higher against the short trend
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let trend = *closes.last().unwrap() - sma(&closes, 10);
        let counter_trend = (direction > 0.0 && trend < 0.0) || (direction < 0.0 && trend > 0.0);
        let strength = if counter_trend {
            pattern.base_strength()
        } else {
            pattern.base_strength() * 0.6
        };

        let last = &candles[candles.len() - 1];
        let stop = if direction > 0.0 { last.low } else { last.high };

        Ok(Some(
            Signal::new(symbol, SignalCategory::Pattern, direction, strength)?
                .with_entry_hint(last.close)
                .with_stop_hint(stop),
        ))
    }
}
