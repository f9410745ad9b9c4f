// Notification boundary
//
// The core emits discrete, structured events; formatting and delivery
// (Telegram, email, dashboards) belong to whoever implements Notifier.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::broker::TradeDirection;

/// Structured event payloads emitted by the engine
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TradeEvent {
    TradeOpened {
        timestamp: DateTime<Utc>,
        symbol: String,
        direction: TradeDirection,
        volume: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        strategy: String,
        ticket: u64,
        signal_strength: f64,
    },
    TradeClosed {
        timestamp: DateTime<Utc>,
        symbol: String,
        ticket: u64,
        reason: String,
        pnl: f64,
    },
    EmergencyStop {
        timestamp: DateTime<Utc>,
        drawdown_pct: f64,
        positions_closed: usize,
    },
    DailyLimitReached {
        timestamp: DateTime<Utc>,
        reason: String,
    },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &TradeEvent);
}

/// Default notifier: structured events into the log stream
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &TradeEvent) {
        match event {
            TradeEvent::TradeOpened {
                symbol,
                direction,
                volume,
                entry_price,
                strategy,
                ticket,
                ..
            } => {
                info!(
                    "📈 Trade opened: {} {} {:.2} @ {:.5} [{}] ticket {}",
                    direction, symbol, volume, entry_price, strategy, ticket
                );
            }
            TradeEvent::TradeClosed {
                symbol,
                ticket,
                reason,
                pnl,
                ..
            } => {
                info!(
                    "📉 Trade closed: {} ticket {} ({}) PnL {:.2}",
                    symbol, ticket, reason, pnl
                );
            }
            TradeEvent::EmergencyStop {
                drawdown_pct,
                positions_closed,
                ..
            } => {
                warn!(
                    "🚨 EMERGENCY STOP: drawdown {:.2}%, {} positions closed",
                    drawdown_pct, positions_closed
                );
            }
            TradeEvent::DailyLimitReached { reason, .. } => {
                warn!("⛔ Daily limit reached: {}", reason);
            }
        }
    }
}

/// Channel-backed notifier for embedding the engine in a larger process.
/// Sends never block; if the receiver is gone, events are dropped.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<TradeEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TradeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: &TradeEvent) {
        let _ = self.tx.send(event.clone());
    }
}
