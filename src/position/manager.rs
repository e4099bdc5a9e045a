use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::{OrderKind, PositionInfo, Side, Trade};
use crate::exchange::ExchangeClient;
use crate::execution::{ExecutionEngine, Order};
use crate::transport::{EngineEvent, EventBus};

// Ratchet ladder, in leveraged P&L percent.
const BREAKEVEN_STOP_PNL_PCT: f64 = 7.0;
const TIGHTEN_TARGET_PNL_PCT: f64 = 10.0;
const LOCK_TARGET_PNL_PCT: f64 = 12.0;

const BREAKEVEN_STOP_BUFFER: f64 = 0.005;
const TIGHTEN_TARGET_RATIO: f64 = 0.024;
const LOCK_TARGET_BUFFER: f64 = 0.004;

#[derive(Debug, Clone)]
pub struct ManagedPosition {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub entry_order: Uuid,
    pub stop_order: Option<Uuid>,
    pub target_order: Option<Uuid>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    /// Highest favorable leveraged P&L percent ever observed.
    pub peak_pnl_pct: f64,
    pub max_adverse_pnl_pct: f64,
    pub strategy: Option<String>,
    pub opened_at: DateTime<Utc>,
}

impl ManagedPosition {
    /// Leveraged unrealized P&L percent at the given mark.
    fn pnl_pct(&self, mark: f64, leverage: f64) -> f64 {
        if self.entry_price.abs() < f64::EPSILON {
            return 0.0;
        }
        let move_pct = (mark - self.entry_price) / self.entry_price * 100.0;
        match self.side {
            Side::Long => move_pct * leverage,
            Side::Short => -move_pct * leverage,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClosedPosition {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub reason: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// Position Lifecycle Manager
///
/// Owns positions from entry fill to close. Every tick it re-marks open
/// positions, walks the trailing ratchet ladder, fires the backup close
/// when a protective level is breached with the resting order still live,
/// and reconciles positions that were closed out-of-band.
pub struct PositionManager {
    exchange: Arc<dyn ExchangeClient>,
    engine: Arc<ExecutionEngine>,
    bus: EventBus,
    leverage: f64,
    positions: DashMap<String, ManagedPosition>,
    closed: RwLock<Vec<ClosedPosition>>,
}

impl PositionManager {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        engine: Arc<ExecutionEngine>,
        bus: EventBus,
        leverage: f64,
    ) -> Self {
        Self {
            exchange,
            engine,
            bus,
            leverage,
            positions: DashMap::new(),
            closed: RwLock::new(Vec::new()),
        }
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn open_positions(&self) -> Vec<ManagedPosition> {
        self.positions.iter().map(|entry| entry.clone()).collect()
    }

    pub fn position(&self, symbol: &str) -> Option<ManagedPosition> {
        self.positions.get(symbol).map(|entry| entry.clone())
    }

    pub async fn closed_positions(&self) -> Vec<ClosedPosition> {
        self.closed.read().await.clone()
    }

    /// Entry fills open (or grow) a position; reduce-only fills shrink or
    /// close it.
    pub async fn on_fill(&self, order: &Order, trade: &Trade) {
        if order.reduce_only {
            self.on_reducing_fill(order, trade).await;
            return;
        }

        let side = match order.side {
            crate::core::OrderSide::Buy => Side::Long,
            crate::core::OrderSide::Sell => Side::Short,
        };

        let mut stop_order = None;
        let mut stop_price = None;
        let mut target_order = None;
        let mut target_price = None;
        for leg in self.engine.legs_of(order.id) {
            match leg.kind {
                OrderKind::StopMarket => {
                    stop_order = Some(leg.id);
                    stop_price = leg.stop_price;
                }
                OrderKind::TakeProfitLimit => {
                    target_order = Some(leg.id);
                    target_price = leg.limit_price;
                }
                _ => {}
            }
        }

        match self.positions.get_mut(&order.symbol) {
            Some(mut existing) => {
                let total = existing.size + trade.size;
                existing.entry_price = (existing.entry_price * existing.size
                    + trade.price * trade.size)
                    / total;
                existing.size = total;
                debug!(symbol = %order.symbol, size = total, "Added to position");
            }
            None => {
                info!(
                    symbol = %order.symbol,
                    side = %side,
                    size = trade.size,
                    entry = trade.price,
                    "Position opened"
                );
                self.positions.insert(
                    order.symbol.clone(),
                    ManagedPosition {
                        symbol: order.symbol.clone(),
                        side,
                        size: trade.size,
                        entry_price: trade.price,
                        mark_price: trade.price,
                        unrealized_pnl: 0.0,
                        entry_order: order.id,
                        stop_order,
                        target_order,
                        stop_price,
                        target_price,
                        peak_pnl_pct: 0.0,
                        max_adverse_pnl_pct: 0.0,
                        strategy: order.strategy.clone(),
                        opened_at: Utc::now(),
                    },
                );
            }
        }
    }

    async fn on_reducing_fill(&self, order: &Order, trade: &Trade) {
        let Some(mut position) = self.positions.get_mut(&order.symbol) else {
            warn!(symbol = %order.symbol, "Reducing fill for untracked position");
            return;
        };
        let closed_size = trade.size.min(position.size);
        position.size -= trade.size;
        let closed = position.size <= 1e-9;
        let mut snapshot = position.clone();
        drop(position);

        if closed {
            snapshot.size = closed_size;
            let reason = if Some(order.id) == snapshot.stop_order {
                "stop_loss"
            } else if Some(order.id) == snapshot.target_order {
                "take_profit"
            } else {
                "engine_close"
            };
            self.finish(snapshot, trade.price, reason).await;
        }
    }

    /// Per-tick pass over every tracked position against the latest
    /// exchange position list.
    pub async fn tick(&self, live: &[PositionInfo]) {
        let tracked: Vec<String> = self.positions.iter().map(|e| e.key().clone()).collect();
        for symbol in tracked {
            let remote = live
                .iter()
                .find(|p| p.symbol == symbol && p.size.abs() > f64::EPSILON);
            match remote {
                None => self.reconcile_external_close(&symbol).await,
                Some(info) => self.manage(&symbol, info).await,
            }
        }
    }

    async fn manage(&self, symbol: &str, info: &PositionInfo) {
        let Some(mut position) = self.positions.get_mut(symbol) else {
            return;
        };
        position.mark_price = info.mark_price;
        position.unrealized_pnl = info.unrealized_pnl;
        let pnl_pct = position.pnl_pct(info.mark_price, self.leverage);
        position.peak_pnl_pct = position.peak_pnl_pct.max(pnl_pct);
        position.max_adverse_pnl_pct = position.max_adverse_pnl_pct.min(pnl_pct);
        let snapshot = position.clone();
        drop(position);

        if self.backup_close_if_breached(&snapshot).await {
            return;
        }
        self.apply_ratchets(&snapshot, pnl_pct).await;
    }

    /// A protective level is breached but its resting order has not
    /// reported a fill: close at market rather than wait.
    async fn backup_close_if_breached(&self, position: &ManagedPosition) -> bool {
        let mark = position.mark_price;
        let stop_breached = position.stop_price.is_some_and(|stop| match position.side {
            Side::Long => mark <= stop,
            Side::Short => mark >= stop,
        });
        let target_breached = position
            .target_price
            .is_some_and(|target| match position.side {
                Side::Long => mark >= target,
                Side::Short => mark <= target,
            });
        if !stop_breached && !target_breached {
            return false;
        }

        let reason = if stop_breached {
            "backup_stop"
        } else {
            "backup_target"
        };
        warn!(
            symbol = %position.symbol,
            mark,
            reason,
            "Protective level breached with resting order still live, closing at market"
        );
        match self
            .engine
            .close_position(&position.symbol, position.side, position.size)
            .await
        {
            Ok(_) => {
                self.finish(position.clone(), mark, reason).await;
                true
            }
            Err(err) => {
                warn!(symbol = %position.symbol, %err, "Backup close failed");
                self.bus
                    .alert(&format!("backup close failed for {}: {err}", position.symbol));
                false
            }
        }
    }

    /// Walk the ratchet ladder. Every step only ever tightens: a stop
    /// moves with the position, a target moves toward the mark, and
    /// neither ever moves back.
    async fn apply_ratchets(&self, position: &ManagedPosition, pnl_pct: f64) {
        let peak = position.peak_pnl_pct.max(pnl_pct);
        let entry = position.entry_price;
        let mark = position.mark_price;

        if peak >= BREAKEVEN_STOP_PNL_PCT {
            let desired = match position.side {
                Side::Long => entry * (1.0 + BREAKEVEN_STOP_BUFFER),
                Side::Short => entry * (1.0 - BREAKEVEN_STOP_BUFFER),
            };
            if tightens_stop(position.side, position.stop_price, desired) {
                self.replace_stop(position, desired).await;
            }
        }

        let desired_target = if peak >= LOCK_TARGET_PNL_PCT {
            Some(match position.side {
                Side::Long => mark * (1.0 + LOCK_TARGET_BUFFER),
                Side::Short => mark * (1.0 - LOCK_TARGET_BUFFER),
            })
        } else if peak >= TIGHTEN_TARGET_PNL_PCT {
            Some(match position.side {
                Side::Long => entry * (1.0 + TIGHTEN_TARGET_RATIO),
                Side::Short => entry * (1.0 - TIGHTEN_TARGET_RATIO),
            })
        } else {
            None
        };
        if let Some(desired) = desired_target {
            if tightens_target(position.side, position.target_price, desired) {
                self.replace_target(position, desired).await;
            }
        }
    }

    async fn replace_stop(&self, position: &ManagedPosition, price: f64) {
        if let Some(old) = position.stop_order {
            if let Err(err) = self.engine.cancel(old).await {
                warn!(symbol = %position.symbol, %err, "Failed to cancel old stop");
            }
        }
        let mut order = Order::new(
            &position.symbol,
            position.side.exit_order_side(),
            position.size,
            OrderKind::StopMarket,
        );
        order.stop_price = Some(price);
        order.reduce_only = true;
        order.parent_id = Some(position.entry_order);

        let new_id = match self.engine.submit_single(order).await {
            Ok(id) => id,
            Err(err) => {
                warn!(symbol = %position.symbol, %err, "Stop replacement failed");
                None
            }
        };
        if let Some(mut tracked) = self.positions.get_mut(&position.symbol) {
            // The local level is kept even when the venue refused the
            // order: the backup close enforces it.
            tracked.stop_price = Some(price);
            tracked.stop_order = new_id;
        }
        info!(symbol = %position.symbol, stop = price, "Stop ratcheted");
    }

    async fn replace_target(&self, position: &ManagedPosition, price: f64) {
        if let Some(old) = position.target_order {
            if let Err(err) = self.engine.cancel(old).await {
                warn!(symbol = %position.symbol, %err, "Failed to cancel old target");
            }
        }
        let mut order = Order::new(
            &position.symbol,
            position.side.exit_order_side(),
            position.size,
            OrderKind::TakeProfitLimit,
        );
        order.limit_price = Some(price);
        order.reduce_only = true;
        order.parent_id = Some(position.entry_order);

        let new_id = match self.engine.submit_single(order).await {
            Ok(id) => id,
            Err(err) => {
                warn!(symbol = %position.symbol, %err, "Target replacement failed");
                None
            }
        };
        if let Some(mut tracked) = self.positions.get_mut(&position.symbol) {
            tracked.target_price = Some(price);
            tracked.target_order = new_id;
        }
        info!(symbol = %position.symbol, target = price, "Target ratcheted");
    }

    /// The exchange reports no position where we track one: closed by a
    /// stop fill we missed, a manual close, or liquidation. Recover the
    /// exit price from recent trades.
    async fn reconcile_external_close(&self, symbol: &str) {
        let Some((_, position)) = self.positions.remove(symbol) else {
            return;
        };
        let exit_side = position.side.exit_order_side();
        let exit_price = match self.exchange.trade_history(symbol, 20).await {
            Ok(trades) => trades
                .iter()
                .find(|t| t.side == exit_side)
                .map(|t| t.price)
                .unwrap_or(position.mark_price),
            Err(err) => {
                warn!(symbol, %err, "Trade history unavailable for close reconciliation");
                position.mark_price
            }
        };
        info!(symbol, exit_price, "Position closed externally, reconciling");
        self.finish(position, exit_price, "external_close").await;
    }

    /// Common close-out path: clear lingering protective orders, record
    /// history, emit the close event.
    async fn finish(&self, position: ManagedPosition, exit_price: f64, reason: &str) {
        self.positions.remove(&position.symbol);

        for leg in [position.stop_order, position.target_order]
            .into_iter()
            .flatten()
        {
            if self.engine.order(leg).is_some() {
                if let Err(err) = self.engine.cancel(leg).await {
                    warn!(order_id = %leg, %err, "Failed to cancel lingering protective order");
                }
            }
        }

        let direction = match position.side {
            Side::Long => 1.0,
            Side::Short => -1.0,
        };
        let size = position.size.abs();
        let realized = (exit_price - position.entry_price) * direction * size;

        let record = ClosedPosition {
            symbol: position.symbol.clone(),
            side: position.side,
            size,
            entry_price: position.entry_price,
            exit_price,
            realized_pnl: realized,
            reason: reason.to_string(),
            opened_at: position.opened_at,
            closed_at: Utc::now(),
        };
        info!(
            symbol = %record.symbol,
            realized_pnl = record.realized_pnl,
            reason = %record.reason,
            "Position closed"
        );
        self.bus.publish(EngineEvent::PositionClosed {
            symbol: record.symbol.clone(),
            side: record.side,
            size: record.size,
            entry_price: record.entry_price,
            exit_price: record.exit_price,
            realized_pnl: record.realized_pnl,
            reason: record.reason.clone(),
            timestamp: record.closed_at,
        });
        self.closed.write().await.push(record);
    }
}

fn tightens_stop(side: Side, current: Option<f64>, desired: f64) -> bool {
    match (side, current) {
        (_, None) => true,
        (Side::Long, Some(stop)) => desired > stop,
        (Side::Short, Some(stop)) => desired < stop,
    }
}

fn tightens_target(side: Side, current: Option<f64>, desired: f64) -> bool {
    match (side, current) {
        (_, None) => true,
        (Side::Long, Some(target)) => desired < target,
        (Side::Short, Some(target)) => desired > target,
    }
}
