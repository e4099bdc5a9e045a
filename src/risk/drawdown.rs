use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RiskLimits;
use crate::core::AccountSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrawdownState {
    Normal,
    Warning,
    AutoPaused,
}

impl std::fmt::Display for DrawdownState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrawdownState::Normal => write!(f, "normal"),
            DrawdownState::Warning => write!(f, "warning"),
            DrawdownState::AutoPaused => write!(f, "auto_paused"),
        }
    }
}

/// Drawdown Monitor
///
/// Grades drawdown-from-peak into normal / warning / auto-paused. Unlike
/// the kill switch this is reversible: trading resumes on its own once
/// drawdown recovers below the pause threshold.
pub struct DrawdownMonitor {
    warning_pct: f64,
    auto_pause_pct: f64,
    state: DrawdownState,
}

pub struct DrawdownUpdate {
    pub state: DrawdownState,
    pub previous: DrawdownState,
    pub drawdown_pct: f64,
}

impl DrawdownUpdate {
    pub fn changed(&self) -> bool {
        self.state != self.previous
    }
}

impl DrawdownMonitor {
    pub fn new(limits: &RiskLimits) -> Self {
        Self {
            warning_pct: limits.drawdown_warning_pct,
            auto_pause_pct: limits.drawdown_auto_pause_pct,
            state: DrawdownState::Normal,
        }
    }

    pub fn state(&self) -> DrawdownState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state == DrawdownState::AutoPaused
    }

    pub fn update(&mut self, account: &AccountSnapshot) -> DrawdownUpdate {
        let drawdown = account.drawdown_pct();
        let previous = self.state;
        self.state = if drawdown >= self.auto_pause_pct {
            DrawdownState::AutoPaused
        } else if drawdown >= self.warning_pct {
            DrawdownState::Warning
        } else {
            DrawdownState::Normal
        };

        if self.state != previous {
            match self.state {
                DrawdownState::AutoPaused => warn!(
                    drawdown_pct = drawdown,
                    "Drawdown auto-pause engaged, suspending new signals"
                ),
                DrawdownState::Warning => warn!(drawdown_pct = drawdown, "Drawdown warning"),
                DrawdownState::Normal => info!(
                    drawdown_pct = drawdown,
                    "Drawdown recovered, resuming normal operation"
                ),
            }
        }

        DrawdownUpdate {
            state: self.state,
            previous,
            drawdown_pct: drawdown,
        }
    }
}
