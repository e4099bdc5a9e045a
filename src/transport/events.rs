use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{OrderSide, Side};
use crate::risk::DrawdownState;

/// Structured events emitted by the engine for external collaborators
/// (persistence, notification). Delivery is fire-and-forget: a slow or
/// failed subscriber never blocks or fails the trading cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    SignalGenerated {
        symbol: String,
        side: Side,
        strategy: String,
        entry_price: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        size: f64,
        confidence: f64,
        timestamp: DateTime<Utc>,
    },
    SignalRejected {
        symbol: String,
        side: Side,
        strategy: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    OrderFilled {
        order_id: uuid::Uuid,
        symbol: String,
        side: OrderSide,
        size: f64,
        price: f64,
        commission: f64,
        reduce_only: bool,
        timestamp: DateTime<Utc>,
    },
    PositionClosed {
        symbol: String,
        side: Side,
        size: f64,
        entry_price: f64,
        exit_price: f64,
        realized_pnl: f64,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    KillSwitchTripped {
        reason: String,
        session_loss_pct: f64,
        drawdown_pct: f64,
        timestamp: DateTime<Utc>,
    },
    DrawdownStateChanged {
        from: DrawdownState,
        to: DrawdownState,
        drawdown_pct: f64,
        timestamp: DateTime<Utc>,
    },
    /// A new completed bar arrived; producers must drop derived caches.
    CacheInvalidated {
        symbol: String,
        timestamp: DateTime<Utc>,
    },
    OperatorAlert {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// JSON payload for persistence/notification subscribers.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"event\":\"{}\"}}", self.name()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::SignalGenerated { .. } => "signal_generated",
            EngineEvent::SignalRejected { .. } => "signal_rejected",
            EngineEvent::OrderFilled { .. } => "order_filled",
            EngineEvent::PositionClosed { .. } => "position_closed",
            EngineEvent::KillSwitchTripped { .. } => "kill_switch_tripped",
            EngineEvent::DrawdownStateChanged { .. } => "drawdown_state_changed",
            EngineEvent::CacheInvalidated { .. } => "cache_invalidated",
            EngineEvent::OperatorAlert { .. } => "operator_alert",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_for_external_consumers() {
        let event = EngineEvent::SignalRejected {
            symbol: "SOL".into(),
            side: Side::Long,
            strategy: "swing".into(),
            reason: "max concurrent positions reached (3)".into(),
            timestamp: Utc::now(),
        };
        let json = event.to_json();
        assert!(json.contains("SignalRejected"));
        assert!(json.contains("max concurrent positions"));

        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name(), "signal_rejected");
    }
}
