use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::execution::ExecutionEngine;
use crate::position::PositionManager;
use crate::risk::{DrawdownMonitor, KillSwitch, RiskEngine, RiskVerdict};
use crate::signals::SignalArbiter;
use crate::sync::StateSynchronizer;
use crate::transport::{EngineEvent, EventBus};

const CYCLE_INTERVAL: Duration = Duration::from_secs(1);
const FAILURE_BACKOFF: Duration = Duration::from_secs(2);

/// Trading Engine
///
/// The control loop. One tick per second: refresh state, run the
/// supervisors, manage open positions, then (when trading is allowed)
/// arbitrate, validate, and execute at most one signal. Errors inside a
/// tick are caught at the loop boundary; the loop backs off and continues.
pub struct TradingEngine {
    config: Config,
    sync: Arc<StateSynchronizer>,
    arbiter: Arc<SignalArbiter>,
    risk: RiskEngine,
    execution: Arc<ExecutionEngine>,
    positions: Arc<PositionManager>,
    kill_switch: Arc<KillSwitch>,
    drawdown: DrawdownMonitor,
    bus: EventBus,
    kill_reported: bool,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        sync: Arc<StateSynchronizer>,
        arbiter: Arc<SignalArbiter>,
        execution: Arc<ExecutionEngine>,
        positions: Arc<PositionManager>,
        kill_switch: Arc<KillSwitch>,
        bus: EventBus,
    ) -> Self {
        let risk = RiskEngine::new(config.risk.clone(), config.trading.leverage);
        let drawdown = DrawdownMonitor::new(&config.risk);
        Self {
            config,
            sync,
            arbiter,
            risk,
            execution,
            positions,
            kill_switch,
            drawdown,
            bus,
            kill_reported: false,
        }
    }

    /// Run until the shutdown signal fires, then walk the shutdown
    /// sequence: stop signals, cancel working orders, flush statistics.
    #[instrument(skip_all)]
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!(symbol = %self.config.trading.symbol, "Trading engine starting");
        let mut ticker = interval(CYCLE_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.cycle().await {
                        Ok(()) => self.kill_switch.record_cycle(true),
                        Err(err) => {
                            error!(%err, "Trading cycle failed");
                            self.kill_switch.record_cycle(false);
                            if self.kill_switch.is_tripped() && !self.kill_reported {
                                self.kill_reported = true;
                                self.bus.alert(&format!(
                                    "kill switch tripped after {} consecutive cycle failures: {err}",
                                    self.kill_switch.consecutive_failures()
                                ));
                            }
                            sleep(FAILURE_BACKOFF).await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutdown signal received by trading engine");
                    break;
                }
            }
        }

        self.shutdown_sequence().await;
        Ok(())
    }

    /// One tick. Risk validation always sees the snapshot captured at the
    /// top of the tick, never a mid-cycle re-read.
    pub async fn cycle(&mut self) -> Result<()> {
        self.sync.maybe_refresh().await?;
        let snapshot = self.sync.snapshot().await;
        let live_positions = self.sync.positions().await;

        // Supervisors run every tick, trading or not.
        let tripped = self.kill_switch.check_triggers(&snapshot);
        if tripped && !self.kill_reported {
            self.kill_reported = true;
            self.bus.publish(EngineEvent::KillSwitchTripped {
                reason: format!(
                    "session loss {:.2}%, drawdown {:.2}%",
                    snapshot.session_loss_pct(),
                    snapshot.drawdown_pct()
                ),
                session_loss_pct: snapshot.session_loss_pct(),
                drawdown_pct: snapshot.drawdown_pct(),
                timestamp: Utc::now(),
            });
        }

        let drawdown = self.drawdown.update(&snapshot);
        if drawdown.changed() {
            self.bus.publish(EngineEvent::DrawdownStateChanged {
                from: drawdown.previous,
                to: drawdown.state,
                drawdown_pct: drawdown.drawdown_pct,
                timestamp: Utc::now(),
            });
        }

        // Open positions are managed even when new trading is halted:
        // ratchets and backup closes keep protecting what is already on.
        self.positions.tick(&live_positions).await;

        if tripped {
            return Ok(());
        }
        if self.drawdown.is_paused() {
            debug!("Auto-paused on drawdown, skipping signal evaluation");
            return Ok(());
        }

        let market = self.sync.market_view().await;
        if market.price <= 0.0 {
            debug!("No market data yet, skipping signal evaluation");
            return Ok(());
        }

        let Some(signal) = self
            .arbiter
            .propose(&market, &snapshot, &live_positions)
            .await
        else {
            return Ok(());
        };

        match self.risk.validate(&signal, &snapshot, &live_positions) {
            RiskVerdict::Rejected { reason } => {
                info!(
                    symbol = %signal.symbol,
                    strategy = %signal.strategy,
                    %reason,
                    "Signal rejected by risk validation"
                );
                self.bus.publish(EngineEvent::SignalRejected {
                    symbol: signal.symbol.clone(),
                    side: signal.side,
                    strategy: signal.strategy.clone(),
                    reason,
                    timestamp: Utc::now(),
                });
            }
            RiskVerdict::Accepted { size } => {
                self.bus.publish(EngineEvent::SignalGenerated {
                    symbol: signal.symbol.clone(),
                    side: signal.side,
                    strategy: signal.strategy.clone(),
                    entry_price: signal.entry_price,
                    stop_loss: signal.stop_loss,
                    take_profit: signal.take_profit,
                    size,
                    confidence: signal.confidence,
                    timestamp: Utc::now(),
                });
                match self.execution.execute(&signal, size, market.price).await? {
                    Some(order_id) => {
                        info!(
                            %order_id,
                            symbol = %signal.symbol,
                            side = %signal.side,
                            size,
                            "Signal executing"
                        );
                        self.arbiter.note_accepted(&signal).await;
                    }
                    None => {
                        debug!(symbol = %signal.symbol, "Execution declined the signal");
                    }
                }
            }
        }
        Ok(())
    }

    async fn shutdown_sequence(&mut self) {
        info!("Trading engine shutting down");

        let cancelled = self.execution.cancel_all().await;
        if cancelled > 0 {
            info!(cancelled, "Cancelled working orders at shutdown");
        }
        let remaining = self.execution.active_orders().len();
        if remaining > 0 {
            warn!(remaining, "Orders still live after shutdown cancels");
        }

        self.execution.stats().log_summary();
        for (producer, stats) in self.arbiter.stats() {
            info!(
                producer = %producer,
                proposals = stats.proposals,
                wins = stats.wins,
                timeouts = stats.timeouts,
                "Producer statistics"
            );
        }
        let closed = self.positions.closed_positions().await;
        let realized: f64 = closed.iter().map(|p| p.realized_pnl).sum();
        info!(
            closed_positions = closed.len(),
            realized_pnl = realized,
            "Session summary"
        );
    }
}
