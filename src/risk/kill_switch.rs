use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tracing::{error, warn};

use crate::config::RiskLimits;
use crate::core::AccountSnapshot;

/// Kill Switch
///
/// One-way session halt. Trips on session loss or drawdown-from-peak
/// beyond the configured triggers, or on too many consecutive cycle
/// failures, and never resets for the life of the process.
pub struct KillSwitch {
    daily_loss_trigger_pct: f64,
    drawdown_trigger_pct: f64,
    max_consecutive_failures: u32,
    tripped: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl KillSwitch {
    pub fn new(limits: &RiskLimits) -> Self {
        Self {
            daily_loss_trigger_pct: limits.daily_loss_trigger_pct,
            drawdown_trigger_pct: limits.drawdown_trigger_pct,
            max_consecutive_failures: limits.max_consecutive_failures,
            tripped: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Evaluate the account against the triggers. Returns true when the
    /// switch is (or becomes) tripped. The reason is logged on the
    /// transition only.
    pub fn check_triggers(&self, account: &AccountSnapshot) -> bool {
        if self.is_tripped() {
            return true;
        }

        let session_loss = account.session_loss_pct();
        if session_loss >= self.daily_loss_trigger_pct {
            self.trip(&format!(
                "session loss {session_loss:.2}% >= trigger {:.1}%",
                self.daily_loss_trigger_pct
            ));
            return true;
        }

        let drawdown = account.drawdown_pct();
        if drawdown >= self.drawdown_trigger_pct {
            self.trip(&format!(
                "drawdown {drawdown:.2}% >= trigger {:.1}%",
                self.drawdown_trigger_pct
            ));
            return true;
        }

        false
    }

    /// Track cycle outcomes. A run of failures at the configured threshold
    /// trips the switch; any success clears the run.
    pub fn record_cycle(&self, succeeded: bool) {
        if succeeded {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            return;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(failures, "Trading cycle failed");
        if failures >= self.max_consecutive_failures && !self.is_tripped() {
            self.trip(&format!("{failures} consecutive cycle failures"));
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    fn trip(&self, reason: &str) {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            error!(reason, "KILL SWITCH TRIPPED - no further orders this session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn limits() -> RiskLimits {
        RiskLimits {
            daily_loss_trigger_pct: 10.0,
            drawdown_trigger_pct: 15.0,
            max_consecutive_failures: 3,
            ..RiskLimits::default()
        }
    }

    fn account(session_start: f64, equity: f64, peak: f64) -> AccountSnapshot {
        AccountSnapshot {
            equity,
            margin_used: 0.0,
            available_margin: equity,
            peak_equity: peak,
            session_start_equity: session_start,
            session_pnl: equity - session_start,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn trips_on_session_loss_and_stays_tripped() {
        let switch = KillSwitch::new(&limits());
        // 11% session loss against a 10% trigger.
        assert!(switch.check_triggers(&account(1000.0, 890.0, 1000.0)));
        assert!(switch.is_tripped());

        // Full recovery does not reset it.
        assert!(switch.check_triggers(&account(1000.0, 1100.0, 1100.0)));
    }

    #[test]
    fn trips_on_drawdown_from_peak() {
        let switch = KillSwitch::new(&limits());
        // Flat on the session but 16% off the peak.
        assert!(switch.check_triggers(&account(1000.0, 1008.0, 1200.0)));
    }

    #[test]
    fn stays_quiet_inside_limits() {
        let switch = KillSwitch::new(&limits());
        assert!(!switch.check_triggers(&account(1000.0, 950.0, 1000.0)));
        assert!(!switch.is_tripped());
    }

    #[test]
    fn consecutive_failures_escalate() {
        let switch = KillSwitch::new(&limits());
        switch.record_cycle(false);
        switch.record_cycle(false);
        assert!(!switch.is_tripped());
        switch.record_cycle(true); // reset
        switch.record_cycle(false);
        switch.record_cycle(false);
        switch.record_cycle(false);
        assert!(switch.is_tripped());
    }
}
