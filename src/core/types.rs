use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn flip(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Order side that opens a position in this direction.
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes a position in this direction.
    pub fn exit_order_side(self) -> OrderSide {
        self.entry_order_side().flip()
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn flip(self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
    /// Protective stop leg, triggers a market close.
    StopMarket,
    /// Profit-taking limit leg.
    TakeProfitLimit,
}

/// A proposed trade emitted by a signal producer. Immutable once created;
/// consumed (never mutated) by the arbiter and execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Proposed size. When absent the risk engine computes one.
    pub size: Option<f64>,
    pub strategy: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Signal {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry < now)
    }
}

/// Point-in-time view of the account. Owned by the state synchronizer;
/// everything else reads a clone, never the live value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: f64,
    pub margin_used: f64,
    pub available_margin: f64,
    /// Highest equity ever observed this session. Only ever increases.
    pub peak_equity: f64,
    pub session_start_equity: f64,
    pub session_pnl: f64,
    pub updated_at: DateTime<Utc>,
}

impl AccountSnapshot {
    pub fn empty() -> Self {
        Self {
            equity: 0.0,
            margin_used: 0.0,
            available_margin: 0.0,
            peak_equity: 0.0,
            session_start_equity: 0.0,
            session_pnl: 0.0,
            updated_at: Utc::now(),
        }
    }

    /// Session loss as a positive percentage of session-start equity.
    /// Zero when flat or in profit.
    pub fn session_loss_pct(&self) -> f64 {
        if self.session_start_equity <= 0.0 || self.session_pnl >= 0.0 {
            return 0.0;
        }
        -self.session_pnl / self.session_start_equity * 100.0
    }

    /// Percentage decline from the peak equity seen this session.
    pub fn drawdown_pct(&self) -> f64 {
        if self.peak_equity <= 0.0 {
            return 0.0;
        }
        ((self.peak_equity - self.equity) / self.peak_equity * 100.0).max(0.0)
    }
}

/// One OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Market context handed to signal producers each tick.
#[derive(Debug, Clone)]
pub struct MarketView {
    pub symbol: String,
    pub price: f64,
    pub candles: Vec<Candle>,
}

/// A fill reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub size: f64,
    pub price: f64,
    pub commission: f64,
    pub timestamp: DateTime<Utc>,
}

/// Exchange-reported position row, as consumed by the synchronizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    /// Signed size: positive long, negative short, zero flat.
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
}

impl PositionInfo {
    pub fn side(&self) -> Option<Side> {
        if self.size > 0.0 {
            Some(Side::Long)
        } else if self.size < 0.0 {
            Some(Side::Short)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn signal_expiry() {
        let now = Utc::now();
        let mut signal = Signal {
            symbol: "SOL".into(),
            side: Side::Long,
            entry_price: 150.0,
            stop_loss: Some(148.5),
            take_profit: Some(154.5),
            size: None,
            strategy: "swing".into(),
            confidence: 0.8,
            created_at: now,
            expires_at: Some(now - Duration::seconds(1)),
        };
        assert!(signal.is_expired(now));

        signal.expires_at = Some(now + Duration::seconds(30));
        assert!(!signal.is_expired(now));

        signal.expires_at = None;
        assert!(!signal.is_expired(now));
    }

    #[test]
    fn snapshot_loss_and_drawdown() {
        let snap = AccountSnapshot {
            equity: 890.0,
            margin_used: 0.0,
            available_margin: 890.0,
            peak_equity: 1000.0,
            session_start_equity: 1000.0,
            session_pnl: -110.0,
            updated_at: Utc::now(),
        };
        assert!((snap.session_loss_pct() - 11.0).abs() < 1e-9);
        assert!((snap.drawdown_pct() - 11.0).abs() < 1e-9);

        let flat = AccountSnapshot::empty();
        assert_eq!(flat.session_loss_pct(), 0.0);
        assert_eq!(flat.drawdown_pct(), 0.0);
    }

    #[test]
    fn sides_flip() {
        assert_eq!(Side::Long.exit_order_side(), OrderSide::Sell);
        assert_eq!(Side::Short.exit_order_side(), OrderSide::Buy);
        assert_eq!(OrderSide::Buy.flip(), OrderSide::Sell);
    }
}
