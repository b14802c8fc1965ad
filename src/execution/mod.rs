// Bar close scheduling, evaluation and signal distribution
pub mod adapter;
pub mod context;
pub mod detector;
pub mod emitter;
pub mod handler;
pub mod history;

use std::sync::atomic::{AtomicU64, Ordering};

pub use adapter::{AdapterComponents, AdapterStats, MarketDataAdapter};
pub use context::{AccountProvider, ContextSnapshot, ExecutionContext, StaticAccount};
pub use detector::{BarCloseDetector, BarCloseEvent, Clock, MarketSchedule, SystemClock, TimingStats, TokioClock};
pub use emitter::{SignalEmitter, SignalPayload};
pub use handler::{OrderIntent, OrderRequest, RiskCategory, SignalHandler};
pub use history::{HistoricalDataManager, StoreOutcome};

/// Handle for removing a registered callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

impl CallbackId {
    pub(crate) fn next(counter: &AtomicU64) -> Self {
        CallbackId(counter.fetch_add(1, Ordering::Relaxed))
    }
}
