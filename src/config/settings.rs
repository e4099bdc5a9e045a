/// Engine configuration structures

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub trading: Trading,
    pub risk: RiskLimits,
    pub execution: Execution,
    pub sync: Sync,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Trading {
    pub symbol: String,
    pub leverage: f64,
    /// Minimum seconds between accepted signals.
    pub signal_cooldown_secs: u64,
    pub enable_bracket_orders: bool,
    /// Per-producer budget when fanning out signal generation.
    pub producer_timeout_ms: u64,
}

/// Hard limits loaded once at startup; read-only at runtime.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RiskLimits {
    /// Maximum position value as a percentage of equity.
    pub max_position_size_pct: f64,
    pub max_positions: usize,
    pub max_leverage: f64,
    /// Maximum account percentage at risk between entry and stop.
    pub max_account_risk_pct: f64,
    pub max_daily_loss_pct: f64,
    pub max_drawdown_pct: f64,
    /// Kill switch triggers.
    pub daily_loss_trigger_pct: f64,
    pub drawdown_trigger_pct: f64,
    /// Consecutive failed trades before the kill switch trips.
    pub max_consecutive_failures: u32,
    /// Drawdown monitor thresholds.
    pub drawdown_warning_pct: f64,
    pub drawdown_auto_pause_pct: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Execution {
    /// Beyond this move a limit entry is downgraded to market.
    pub slippage_tolerance_pct: f64,
    /// Beyond this move the signal is dropped outright.
    pub hard_revalidation_pct: f64,
    /// Time-in-force deadline for submitted orders.
    pub order_timeout_secs: u64,
    pub monitor_interval_secs: u64,
    /// Per-cancel budget during shutdown.
    pub cancel_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Sync {
    /// Pull refresh cadence when the push stream has gone silent.
    pub pull_interval_secs: u64,
    pub candle_buffer: usize,
    pub candle_interval: String,
}

impl Config {
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment wins over the file for the handful of settings an
    /// operator tunes per deployment.
    fn apply_env_overrides(&mut self) {
        if let Ok(symbol) = std::env::var("HARRIER_SYMBOL") {
            self.trading.symbol = symbol;
        }
        if let Some(leverage) = env_f64("HARRIER_LEVERAGE") {
            self.trading.leverage = leverage;
        }
        if let Some(pct) = env_f64("HARRIER_MAX_DAILY_LOSS_PCT") {
            self.risk.max_daily_loss_pct = pct;
        }
        if let Some(pct) = env_f64("HARRIER_MAX_DRAWDOWN_PCT") {
            self.risk.max_drawdown_pct = pct;
        }
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trading: Trading {
                symbol: "SOL".into(),
                leverage: 5.0,
                signal_cooldown_secs: 60,
                enable_bracket_orders: true,
                producer_timeout_ms: 500,
            },
            risk: RiskLimits::default(),
            execution: Execution {
                slippage_tolerance_pct: 1.0,
                hard_revalidation_pct: 3.0,
                order_timeout_secs: 30,
                monitor_interval_secs: 5,
                cancel_timeout_secs: 5,
            },
            sync: Sync {
                pull_interval_secs: 900,
                candle_buffer: 128,
                candle_interval: "1m".into(),
            },
        }
    }
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size_pct: 70.0,
            max_positions: 3,
            max_leverage: 5.0,
            max_account_risk_pct: 2.0,
            max_daily_loss_pct: 5.0,
            max_drawdown_pct: 10.0,
            daily_loss_trigger_pct: 10.0,
            drawdown_trigger_pct: 15.0,
            max_consecutive_failures: 5,
            drawdown_warning_pct: 5.0,
            drawdown_auto_pause_pct: 12.0,
        }
    }
}
