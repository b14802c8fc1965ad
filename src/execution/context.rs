use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Bar, PositionState, Timeframe};
use crate::strategy::edge_cases::EdgeCaseResult;
use crate::strategy::signals::Metadata;

/// Immutable snapshot handed to every function evaluated at one boundary
///
/// Built once per boundary, shared by reference, dropped after evaluation.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub current_bar: Bar,
    /// Bars before `current_bar`, oldest first
    pub historical_bars: Vec<Bar>,
    pub plan_parameters: Metadata,
    pub position: Option<PositionState>,
    pub account_balance: f64,
    pub timestamp: DateTime<Utc>,
    pub edge_cases: Vec<EdgeCaseResult>,
}

impl ExecutionContext {
    /// History followed by the current bar
    pub fn bars_with_current(&self) -> Vec<Bar> {
        let mut bars = self.historical_bars.clone();
        bars.push(self.current_bar.clone());
        bars
    }

    /// The last `n` closes, current bar included
    pub fn recent_closes(&self, n: usize) -> Vec<f64> {
        let mut closes: Vec<f64> = self
            .historical_bars
            .iter()
            .rev()
            .take(n.saturating_sub(1))
            .map(|b| b.close)
            .collect();
        closes.reverse();
        if n > 0 {
            closes.push(self.current_bar.close);
        }
        closes
    }

    /// Open position with a non-zero quantity, if any
    pub fn open_position(&self) -> Option<&PositionState> {
        self.position.as_ref().filter(|p| !p.is_flat())
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            close: self.current_bar.close,
            open: self.current_bar.open,
            high: self.current_bar.high,
            low: self.current_bar.low,
            volume: self.current_bar.volume,
            bar_time: self.current_bar.timestamp,
            history_len: self.historical_bars.len(),
            position_quantity: self.position.as_ref().map(|p| p.quantity),
            account_balance: self.account_balance,
            edge_cases: self.edge_cases.clone(),
        }
    }
}

/// Compact, serializable view of a context kept with each audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub bar_time: DateTime<Utc>,
    pub history_len: usize,
    pub position_quantity: Option<f64>,
    pub account_balance: f64,
    #[serde(default)]
    pub edge_cases: Vec<EdgeCaseResult>,
}

/// Read-only source of position and balance snapshots
#[async_trait]
pub trait AccountProvider: Send + Sync {
    async fn position(&self, symbol: &str) -> Option<PositionState>;

    async fn account_balance(&self) -> f64;
}

/// In-memory account, fed by whoever owns the broker connection
#[derive(Debug, Default)]
pub struct StaticAccount {
    positions: RwLock<HashMap<String, PositionState>>,
    balance: RwLock<f64>,
}

impl StaticAccount {
    pub fn new(balance: f64) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            balance: RwLock::new(balance),
        }
    }

    pub fn set_position(&self, position: PositionState) {
        let mut positions = self.positions.write().unwrap_or_else(PoisonError::into_inner);
        positions.insert(position.symbol.clone(), position);
    }

    pub fn clear_position(&self, symbol: &str) -> Option<PositionState> {
        let mut positions = self.positions.write().unwrap_or_else(PoisonError::into_inner);
        positions.remove(symbol)
    }

    pub fn set_balance(&self, balance: f64) {
        *self.balance.write().unwrap_or_else(PoisonError::into_inner) = balance;
    }
}

#[async_trait]
impl AccountProvider for StaticAccount {
    async fn position(&self, symbol: &str) -> Option<PositionState> {
        let positions = self.positions.read().unwrap_or_else(PoisonError::into_inner);
        positions.get(symbol).cloned()
    }

    async fn account_balance(&self) -> f64 {
        *self.balance.read().unwrap_or_else(PoisonError::into_inner)
    }
}
