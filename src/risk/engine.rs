use tracing::debug;

use crate::config::RiskLimits;
use crate::core::{AccountSnapshot, PositionInfo, Signal};

/// Outcome of pre-trade validation. Rejection is a normal control-flow
/// result carrying the reason, never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskVerdict {
    Accepted { size: f64 },
    Rejected { reason: String },
}

impl RiskVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RiskVerdict::Accepted { .. })
    }
}

/// Risk Validation Engine
///
/// Pure pre-trade checks against the configured limits and a snapshot
/// captured at the start of the tick. Same inputs always produce the
/// same verdict.
pub struct RiskEngine {
    limits: RiskLimits,
    leverage: f64,
}

impl RiskEngine {
    pub fn new(limits: RiskLimits, leverage: f64) -> Self {
        Self { limits, leverage }
    }

    /// Size a signal from account equity when the producer left it open:
    /// `equity * position_size_pct * leverage / entry`, then clamped by the
    /// leverage ceiling and the per-trade risk ceiling.
    pub fn position_size(&self, signal: &Signal, account: &AccountSnapshot) -> f64 {
        if let Some(size) = signal.size {
            return size;
        }
        let allocation = account.equity * self.limits.max_position_size_pct / 100.0;
        let value_size = allocation * self.leverage / signal.entry_price;

        let leverage_cap =
            account.equity * self.limits.max_leverage / signal.entry_price;

        let risk_size = match signal.stop_loss {
            Some(stop) => {
                let distance = (signal.entry_price - stop).abs();
                if distance > f64::EPSILON {
                    account.equity * self.limits.max_account_risk_pct / 100.0 / distance
                } else {
                    f64::INFINITY
                }
            }
            None => f64::INFINITY,
        };

        value_size.min(leverage_cap).min(risk_size)
    }

    /// Ordered checks, short-circuiting on the first failure:
    /// position count, per-instrument uniqueness, leverage ceiling,
    /// per-trade risk, session loss.
    pub fn validate(
        &self,
        signal: &Signal,
        account: &AccountSnapshot,
        open_positions: &[PositionInfo],
    ) -> RiskVerdict {
        if open_positions.len() >= self.limits.max_positions {
            return RiskVerdict::Rejected {
                reason: format!(
                    "max concurrent positions reached ({})",
                    self.limits.max_positions
                ),
            };
        }

        if open_positions
            .iter()
            .any(|p| p.symbol == signal.symbol && p.size.abs() > f64::EPSILON)
        {
            return RiskVerdict::Rejected {
                reason: format!("position already open for {}", signal.symbol),
            };
        }

        let size = self.position_size(signal, account);
        if size <= 0.0 || !size.is_finite() {
            return RiskVerdict::Rejected {
                reason: format!("computed size {size} is not tradeable"),
            };
        }

        let notional = size * signal.entry_price;
        let max_notional = account.equity * self.limits.max_leverage;
        if notional > max_notional * (1.0 + 1e-9) {
            return RiskVerdict::Rejected {
                reason: format!(
                    "notional {notional:.2} exceeds leverage cap {max_notional:.2}"
                ),
            };
        }

        if let Some(stop) = signal.stop_loss {
            let projected_loss = (signal.entry_price - stop).abs() * size;
            let max_loss = account.equity * self.limits.max_account_risk_pct / 100.0;
            if projected_loss > max_loss * (1.0 + 1e-9) {
                return RiskVerdict::Rejected {
                    reason: format!(
                        "projected risk {projected_loss:.2} exceeds {:.1}% of equity",
                        self.limits.max_account_risk_pct
                    ),
                };
            }
        }

        let session_loss = account.session_loss_pct();
        if session_loss >= self.limits.max_daily_loss_pct {
            return RiskVerdict::Rejected {
                reason: format!(
                    "session loss {session_loss:.2}% at or beyond daily limit {:.1}%",
                    self.limits.max_daily_loss_pct
                ),
            };
        }

        debug!(
            symbol = %signal.symbol,
            strategy = %signal.strategy,
            size,
            "Signal passed risk validation"
        );
        RiskVerdict::Accepted { size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Side;
    use chrono::Utc;

    fn limits() -> RiskLimits {
        RiskLimits {
            max_position_size_pct: 50.0,
            max_positions: 3,
            max_leverage: 10.0,
            max_account_risk_pct: 100.0,
            max_daily_loss_pct: 5.0,
            max_drawdown_pct: 10.0,
            daily_loss_trigger_pct: 10.0,
            drawdown_trigger_pct: 15.0,
            max_consecutive_failures: 5,
            drawdown_warning_pct: 5.0,
            drawdown_auto_pause_pct: 12.0,
        }
    }

    fn snapshot(equity: f64) -> AccountSnapshot {
        AccountSnapshot {
            equity,
            margin_used: 0.0,
            available_margin: equity,
            peak_equity: equity,
            session_start_equity: equity,
            session_pnl: 0.0,
            updated_at: Utc::now(),
        }
    }

    fn signal(entry: f64) -> Signal {
        Signal {
            symbol: "SOL".into(),
            side: Side::Long,
            entry_price: entry,
            stop_loss: None,
            take_profit: None,
            size: None,
            strategy: "test".into(),
            confidence: 0.9,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn sizing_follows_allocation_times_leverage() {
        let engine = RiskEngine::new(limits(), 5.0);
        let size = engine.position_size(&signal(150.0), &snapshot(1000.0));
        // 1000 * 50% * 5x / 150
        assert!((size - 16.6667).abs() < 1e-3);

        let mut full = limits();
        full.max_position_size_pct = 100.0;
        let engine = RiskEngine::new(full, 5.0);
        let size = engine.position_size(&signal(150.0), &snapshot(1000.0));
        assert!((size - 33.3333).abs() < 1e-3);
    }

    #[test]
    fn risk_cap_clamps_size_when_stop_is_wide() {
        let mut l = limits();
        l.max_account_risk_pct = 2.0;
        let engine = RiskEngine::new(l, 5.0);
        let mut sig = signal(100.0);
        sig.stop_loss = Some(90.0); // 10 per unit at risk
        let size = engine.position_size(&sig, &snapshot(1000.0));
        // 2% of 1000 = 20 risk budget / 10 per unit = 2 units,
        // well under the value-derived 25.
        assert!((size - 2.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_duplicate_instrument() {
        let engine = RiskEngine::new(limits(), 5.0);
        let open = vec![PositionInfo {
            symbol: "SOL".into(),
            size: 1.0,
            entry_price: 140.0,
            mark_price: 150.0,
            unrealized_pnl: 10.0,
        }];
        let verdict = engine.validate(&signal(150.0), &snapshot(1000.0), &open);
        assert!(matches!(verdict, RiskVerdict::Rejected { ref reason } if reason.contains("SOL")));
    }

    #[test]
    fn rejects_when_position_slots_full() {
        let mut l = limits();
        l.max_positions = 1;
        let engine = RiskEngine::new(l, 5.0);
        let open = vec![PositionInfo {
            symbol: "ETH".into(),
            size: 1.0,
            entry_price: 3000.0,
            mark_price: 3000.0,
            unrealized_pnl: 0.0,
        }];
        let verdict = engine.validate(&signal(150.0), &snapshot(1000.0), &open);
        assert!(!verdict.is_accepted());
    }

    #[test]
    fn rejects_after_daily_loss_limit() {
        let engine = RiskEngine::new(limits(), 5.0);
        let mut account = snapshot(1000.0);
        account.equity = 940.0;
        account.session_pnl = -60.0; // 6% loss vs 5% limit
        let verdict = engine.validate(&signal(150.0), &account, &[]);
        assert!(matches!(verdict, RiskVerdict::Rejected { ref reason } if reason.contains("session loss")));
    }

    #[test]
    fn validate_is_deterministic() {
        let engine = RiskEngine::new(limits(), 5.0);
        let sig = signal(150.0);
        let account = snapshot(1000.0);
        let first = engine.validate(&sig, &account, &[]);
        let second = engine.validate(&sig, &account, &[]);
        assert_eq!(first, second);
    }
}
