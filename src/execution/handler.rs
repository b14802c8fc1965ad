use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::emitter::{SignalCallback, SignalPayload};
use crate::error::SignalError;
use crate::strategy::SignalAction;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerSettings {
    /// Stop distance from the entry price, percent
    pub default_stop_pct: f64,
    /// Target distance from the entry price, percent
    pub default_target_pct: f64,
    /// Capacity of the order intent queue
    pub order_buffer: usize,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            default_stop_pct: 2.0,
            default_target_pct: 4.0,
            order_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    Large,
    Normal,
    Small,
}

impl RiskCategory {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            RiskCategory::Large
        } else if confidence >= 0.6 {
            RiskCategory::Normal
        } else {
            RiskCategory::Small
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Order for the broker layer. Entries leave `quantity` to the sizing layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Option<f64>,
    pub reference_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub risk_category: RiskCategory,
    /// True when the order closes an existing position
    pub closing: bool,
    pub function_name: String,
    pub confidence: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopModification {
    pub id: Uuid,
    pub symbol: String,
    pub new_stop: f64,
    pub previous_stop: Option<f64>,
    pub function_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderIntent {
    Submit(OrderRequest),
    ModifyStop(StopModification),
}

impl OrderIntent {
    pub fn symbol(&self) -> &str {
        match self {
            OrderIntent::Submit(order) => &order.symbol,
            OrderIntent::ModifyStop(modification) => &modification.symbol,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandlerDecision {
    /// None means no action
    pub intent: Option<OrderIntent>,
    pub reason: String,
}

impl HandlerDecision {
    fn no_action(reason: impl Into<String>) -> Self {
        Self {
            intent: None,
            reason: reason.into(),
        }
    }

    pub fn is_no_action(&self) -> bool {
        self.intent.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HandlerStats {
    pub signals_handled: u64,
    pub intents_queued: u64,
    pub no_action: u64,
    pub refused: u64,
}

/// Translates emitted signals into order intents on a bounded queue
///
/// The queue consumer owns broker connectivity. A full or closed queue means
/// downstream is refusing work and surfaces as `SignalError::CircuitOpen`.
pub struct SignalHandler {
    settings: HandlerSettings,
    orders: mpsc::Sender<OrderIntent>,
    signals_handled: AtomicU64,
    intents_queued: AtomicU64,
    no_action: AtomicU64,
    refused: AtomicU64,
}

impl SignalHandler {
    pub fn new(settings: HandlerSettings) -> (Self, mpsc::Receiver<OrderIntent>) {
        let (orders, receiver) = mpsc::channel(settings.order_buffer.max(1));
        let handler = Self {
            settings,
            orders,
            signals_handled: AtomicU64::new(0),
            intents_queued: AtomicU64::new(0),
            no_action: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        };
        (handler, receiver)
    }

    /// Route a payload by action without side effects
    pub fn decide(&self, payload: &SignalPayload) -> HandlerDecision {
        let signal = &payload.signal;
        let price = payload.context.current_bar.close;

        match signal.action {
            SignalAction::EnterLong | SignalAction::EnterShort => {
                let long = signal.action == SignalAction::EnterLong;
                let stop_offset = price * self.settings.default_stop_pct / 100.0;
                let target_offset = price * self.settings.default_target_pct / 100.0;
                let default_stop = if long { price - stop_offset } else { price + stop_offset };
                let default_target = if long {
                    price + target_offset
                } else {
                    price - target_offset
                };

                let order = OrderRequest {
                    id: Uuid::new_v4(),
                    symbol: payload.symbol.clone(),
                    side: if long { OrderSide::Buy } else { OrderSide::Sell },
                    quantity: None,
                    reference_price: price,
                    stop_loss: Some(metadata_f64(payload, "stop_loss").unwrap_or(default_stop)),
                    take_profit: Some(metadata_f64(payload, "take_profit").unwrap_or(default_target)),
                    risk_category: RiskCategory::from_confidence(signal.confidence),
                    closing: false,
                    function_name: payload.function_name.clone(),
                    confidence: signal.confidence,
                    reason: signal.reasoning.clone(),
                    created_at: Utc::now(),
                };
                HandlerDecision {
                    reason: format!(
                        "{} entry at {:.2} ({:?} risk)",
                        if long { "Long" } else { "Short" },
                        price,
                        order.risk_category
                    ),
                    intent: Some(OrderIntent::Submit(order)),
                }
            }

            SignalAction::Exit => {
                let Some(position) = payload.context.open_position() else {
                    return HandlerDecision::no_action(format!("No position to exit for {}", payload.symbol));
                };

                let order = OrderRequest {
                    id: Uuid::new_v4(),
                    symbol: payload.symbol.clone(),
                    side: if position.is_long() { OrderSide::Sell } else { OrderSide::Buy },
                    quantity: Some(position.quantity.abs()),
                    reference_price: price,
                    stop_loss: None,
                    take_profit: None,
                    risk_category: RiskCategory::from_confidence(signal.confidence),
                    closing: true,
                    function_name: payload.function_name.clone(),
                    confidence: signal.confidence,
                    reason: signal.reasoning.clone(),
                    created_at: Utc::now(),
                };
                HandlerDecision {
                    reason: format!(
                        "Closing {} {} at {:.2} ({:+.2}% unrealized)",
                        position.quantity.abs(),
                        payload.symbol,
                        price,
                        position.unrealized_pnl_pct()
                    ),
                    intent: Some(OrderIntent::Submit(order)),
                }
            }

            SignalAction::ModifyStop => {
                let Some(new_stop) = metadata_f64(payload, "new_stop_level") else {
                    return HandlerDecision::no_action("Stop modification without new_stop_level");
                };

                let modification = StopModification {
                    id: Uuid::new_v4(),
                    symbol: payload.symbol.clone(),
                    new_stop,
                    previous_stop: payload.context.open_position().and_then(|p| p.stop_loss),
                    function_name: payload.function_name.clone(),
                    created_at: Utc::now(),
                };
                HandlerDecision {
                    reason: format!("Moving stop to {:.2}", new_stop),
                    intent: Some(OrderIntent::ModifyStop(modification)),
                }
            }

            SignalAction::None => HandlerDecision::no_action("Signal carries no action"),
        }
    }

    /// Decide and queue the resulting intent
    pub async fn handle(&self, payload: &SignalPayload) -> Result<HandlerDecision, SignalError> {
        self.signals_handled.fetch_add(1, Ordering::Relaxed);
        let decision = self.decide(payload);

        let Some(intent) = decision.intent.clone() else {
            self.no_action.fetch_add(1, Ordering::Relaxed);
            debug!(
                function = %payload.function_name,
                symbol = %payload.symbol,
                "No order: {}",
                decision.reason
            );
            return Ok(decision);
        };

        match self.orders.try_send(intent) {
            Ok(()) => {
                self.intents_queued.fetch_add(1, Ordering::Relaxed);
                info!(
                    function = %payload.function_name,
                    symbol = %payload.symbol,
                    action = %payload.signal.action,
                    confidence = payload.signal.confidence,
                    "Order intent queued: {}",
                    decision.reason
                );
                Ok(decision)
            }
            Err(e) => {
                self.refused.fetch_add(1, Ordering::Relaxed);
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "order queue full",
                    mpsc::error::TrySendError::Closed(_) => "order queue closed",
                };
                warn!(symbol = %payload.symbol, "Order intent refused: {}", reason);
                Err(SignalError::CircuitOpen(reason.to_string()))
            }
        }
    }

    /// Emitter callback that feeds this handler
    pub fn callback(self: &Arc<Self>) -> SignalCallback {
        let handler = Arc::clone(self);
        Arc::new(move |payload| {
            let handler = Arc::clone(&handler);
            async move { handler.handle(&payload).await.map(|_| ()) }.boxed()
        })
    }

    pub fn stats(&self) -> HandlerStats {
        HandlerStats {
            signals_handled: self.signals_handled.load(Ordering::Relaxed),
            intents_queued: self.intents_queued.load(Ordering::Relaxed),
            no_action: self.no_action.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
        }
    }
}

fn metadata_f64(payload: &SignalPayload, key: &str) -> Option<f64> {
    payload
        .signal
        .metadata
        .get(key)
        .and_then(|v| v.as_f64())
        .filter(|v| v.is_finite() && *v > 0.0)
}
