use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{OrderKind, OrderSide, Signal, Trade};
use crate::exchange::OrderRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Submitted => "submitted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("illegal order transition {from} -> {to}")]
pub struct OrderStateError {
    pub from: OrderStatus,
    pub to: OrderStatus,
}

/// A tracked order. The id doubles as the exchange client-order-id so a
/// resubmission of the same order can never duplicate on the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub size: f64,
    pub kind: OrderKind,
    pub status: OrderStatus,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub filled_size: f64,
    pub avg_fill_price: f64,
    pub commission: f64,
    /// Bracket legs point at their entry order.
    pub parent_id: Option<Uuid>,
    pub strategy: Option<String>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub status_note: Option<String>,
}

impl Order {
    pub fn new(symbol: &str, side: OrderSide, size: f64, kind: OrderKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            size,
            kind,
            status: OrderStatus::Pending,
            limit_price: None,
            stop_price: None,
            reduce_only: false,
            filled_size: 0.0,
            avg_fill_price: 0.0,
            commission: 0.0,
            parent_id: None,
            strategy: None,
            created_at: Utc::now(),
            submitted_at: None,
            closed_at: None,
            status_note: None,
        }
    }

    pub fn entry_for(signal: &Signal, size: f64, kind: OrderKind) -> Self {
        let mut order = Order::new(&signal.symbol, signal.side.entry_order_side(), size, kind);
        if kind == OrderKind::Limit {
            order.limit_price = Some(signal.entry_price);
        }
        order.strategy = Some(signal.strategy.clone());
        order
    }

    /// Enforce the finite state machine. Terminal states are final; an
    /// order advances pending -> submitted -> (partial) -> terminal, or is
    /// closed out before it ever reaches the venue.
    pub fn transition(&mut self, to: OrderStatus) -> Result<(), OrderStateError> {
        let legal = match (self.status, to) {
            (OrderStatus::Pending, OrderStatus::Submitted) => true,
            (OrderStatus::Pending, OrderStatus::Rejected) => true,
            (OrderStatus::Pending, OrderStatus::Cancelled) => true,
            (OrderStatus::Submitted, OrderStatus::PartiallyFilled) => true,
            (OrderStatus::Submitted, status) if status.is_terminal() => true,
            (OrderStatus::PartiallyFilled, OrderStatus::Filled) => true,
            (OrderStatus::PartiallyFilled, OrderStatus::Cancelled) => true,
            (OrderStatus::PartiallyFilled, OrderStatus::Expired) => true,
            _ => false,
        };
        if !legal {
            return Err(OrderStateError {
                from: self.status,
                to,
            });
        }
        match to {
            OrderStatus::Submitted => self.submitted_at = Some(Utc::now()),
            status if status.is_terminal() => self.closed_at = Some(Utc::now()),
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    /// Fold a trade into the fill accounting and advance the state machine
    /// when the order is fully filled.
    pub fn record_fill(&mut self, trade: &Trade) -> Result<(), OrderStateError> {
        let prior_notional = self.avg_fill_price * self.filled_size;
        self.filled_size += trade.size;
        self.avg_fill_price = (prior_notional + trade.price * trade.size) / self.filled_size;
        self.commission += trade.commission;

        if self.filled_size + 1e-9 >= self.size {
            if self.status == OrderStatus::Submitted {
                self.transition(OrderStatus::PartiallyFilled)?;
            }
            self.transition(OrderStatus::Filled)
        } else if self.status == OrderStatus::Submitted {
            self.transition(OrderStatus::PartiallyFilled)
        } else {
            Ok(())
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn to_request(&self) -> OrderRequest {
        OrderRequest {
            client_order_id: self.id,
            symbol: self.symbol.clone(),
            side: self.side,
            size: self.size,
            kind: self.kind,
            limit_price: self.limit_price,
            stop_price: self.stop_price,
            reduce_only: self.reduce_only,
        }
    }
}
