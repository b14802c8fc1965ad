pub mod timeframe;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use timeframe::Timeframe;

/// OHLCV bar for one symbol over one timeframe
///
/// `timestamp` is the close time of the bar, in UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Absolute high-low range
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Fold a finer bar into this (forming) bar
    pub fn merge(&mut self, finer: &Bar) {
        self.high = self.high.max(finer.high);
        self.low = self.low.min(finer.low);
        self.close = finer.close;
        self.volume += finer.volume;
    }
}

/// Read-only snapshot of an open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub symbol: String,
    /// Positive for long, negative for short
    pub quantity: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub opened_at: DateTime<Utc>,
}

impl PositionState {
    pub fn is_long(&self) -> bool {
        self.quantity > 0.0
    }

    pub fn is_short(&self) -> bool {
        self.quantity < 0.0
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == 0.0
    }

    pub fn unrealized_pnl(&self) -> f64 {
        (self.current_price - self.entry_price) * self.quantity
    }

    /// Unrealized P&L as a percentage of the entry price, signed by direction
    pub fn unrealized_pnl_pct(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        let direction = if self.is_short() { -1.0 } else { 1.0 };
        (self.current_price - self.entry_price) / self.entry_price * 100.0 * direction
    }
}
