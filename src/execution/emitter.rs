use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, warn};

use super::{CallbackId, ExecutionContext};
use crate::error::{panic_message, SignalError};
use crate::models::Timeframe;
use crate::strategy::ExecutionSignal;

/// A qualifying signal on its way to order translation
#[derive(Debug, Clone)]
pub struct SignalPayload {
    pub function_name: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub signal: ExecutionSignal,
    pub context: Arc<ExecutionContext>,
    pub timestamp: DateTime<Utc>,
}

pub type SignalCallback =
    Arc<dyn Fn(SignalPayload) -> BoxFuture<'static, Result<(), SignalError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EmitterStats {
    pub callbacks: usize,
    pub signals_emitted: u64,
    pub callback_failures: u64,
    pub circuit_open: u64,
}

/// Fans qualifying signals out to registered callbacks, in registration order
#[derive(Default)]
pub struct SignalEmitter {
    callbacks: RwLock<Vec<(CallbackId, SignalCallback)>>,
    next_id: AtomicU64,
    signals_emitted: AtomicU64,
    callback_failures: AtomicU64,
    circuit_open: AtomicU64,
}

impl SignalEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async callback
    pub fn add_callback<F, Fut>(&self, callback: F) -> CallbackId
    where
        F: Fn(SignalPayload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), SignalError>> + Send + 'static,
    {
        self.add_boxed_callback(Arc::new(move |payload| callback(payload).boxed()))
    }

    /// Register a plain callback; it runs inline when the signal is emitted
    pub fn add_sync_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(SignalPayload) -> Result<(), SignalError> + Send + Sync + 'static,
    {
        self.add_boxed_callback(Arc::new(move |payload| {
            futures::future::ready(callback(payload)).boxed()
        }))
    }

    pub fn add_boxed_callback(&self, callback: SignalCallback) -> CallbackId {
        let id = CallbackId::next(&self.next_id);
        let mut callbacks = self.callbacks.write().unwrap_or_else(PoisonError::into_inner);
        callbacks.push((id, callback));
        id
    }

    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.write().unwrap_or_else(PoisonError::into_inner);
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver one signal to every callback
    ///
    /// A circuit-open error is returned after the remaining callbacks have
    /// run; every other failure is logged and swallowed.
    pub async fn emit(
        &self,
        function_name: &str,
        context: Arc<ExecutionContext>,
        signal: ExecutionSignal,
    ) -> Result<(), SignalError> {
        let payload = SignalPayload {
            function_name: function_name.to_string(),
            symbol: context.symbol.clone(),
            timeframe: context.timeframe,
            signal,
            context,
            timestamp: Utc::now(),
        };
        self.signals_emitted.fetch_add(1, Ordering::Relaxed);

        let callbacks: Vec<(CallbackId, SignalCallback)> = {
            let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
            callbacks.clone()
        };
        if callbacks.is_empty() {
            debug!(function = function_name, "Signal emitted with no callbacks registered");
            return Ok(());
        }

        let mut circuit_error = None;
        for (id, callback) in callbacks {
            let call = AssertUnwindSafe(async { callback(payload.clone()).await }).catch_unwind();
            let result = match call.await {
                Ok(result) => result,
                Err(panic) => Err(SignalError::Panicked(panic_message(panic))),
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_circuit_open() => {
                    warn!(
                        function = function_name,
                        symbol = %payload.symbol,
                        callback = ?id,
                        "Signal refused downstream: {}",
                        e
                    );
                    self.circuit_open.fetch_add(1, Ordering::Relaxed);
                    circuit_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(
                        function = function_name,
                        symbol = %payload.symbol,
                        callback = ?id,
                        "Signal callback failed: {}",
                        e
                    );
                    self.callback_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        match circuit_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> EmitterStats {
        EmitterStats {
            callbacks: self.callback_count(),
            signals_emitted: self.signals_emitted.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
            circuit_open: self.circuit_open.load(Ordering::Relaxed),
        }
    }
}
