use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Sync as SyncConfig;
use crate::core::{AccountSnapshot, Candle, MarketView, PositionInfo};
use crate::exchange::{ExchangeClient, ExchangeResult, StreamEvent};
use crate::transport::{EngineEvent, EventBus};

use super::candles::CandleBuffer;

/// State Synchronizer
///
/// Owns the local view of account, positions, and candles. Push events
/// update it between ticks; a timed pull (and a forced pull after any
/// stream gap) keeps it honest. Every other component reads copies.
pub struct StateSynchronizer {
    exchange: Arc<dyn ExchangeClient>,
    symbol: String,
    candle_interval: String,
    pull_interval: Duration,
    candle_capacity: usize,
    snapshot: RwLock<AccountSnapshot>,
    positions: RwLock<Vec<PositionInfo>>,
    candles: DashMap<String, CandleBuffer>,
    last_pull: RwLock<Instant>,
    needs_resync: AtomicBool,
    bus: EventBus,
}

impl StateSynchronizer {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        config: &SyncConfig,
        symbol: &str,
        bus: EventBus,
    ) -> Self {
        Self {
            exchange,
            symbol: symbol.to_string(),
            candle_interval: config.candle_interval.clone(),
            pull_interval: Duration::from_secs(config.pull_interval_secs),
            candle_capacity: config.candle_buffer,
            snapshot: RwLock::new(AccountSnapshot::empty()),
            positions: RwLock::new(Vec::new()),
            candles: DashMap::new(),
            last_pull: RwLock::new(Instant::now()),
            needs_resync: AtomicBool::new(true),
            bus,
        }
    }

    /// Initial pull: seeds the session baseline and backfills the candle
    /// buffer. Must succeed before the control loop starts.
    pub async fn bootstrap(&self) -> ExchangeResult<AccountSnapshot> {
        let history = self
            .exchange
            .candles(&self.symbol, &self.candle_interval, self.candle_capacity)
            .await?;
        let mut buffer = CandleBuffer::new(self.candle_capacity);
        buffer.replace(history);
        self.candles.insert(self.symbol.clone(), buffer);

        let snapshot = self.refresh().await?;
        info!(
            symbol = %self.symbol,
            equity = snapshot.equity,
            "State synchronizer bootstrapped"
        );
        Ok(snapshot)
    }

    /// Pull refresh. Merges the remote read into the local snapshot,
    /// keeping peak equity monotone and the session baseline fixed.
    pub async fn refresh(&self) -> ExchangeResult<AccountSnapshot> {
        let state = self.exchange.account_state().await?;

        let mut snapshot = self.snapshot.write().await;
        if snapshot.session_start_equity == 0.0 {
            snapshot.session_start_equity = state.equity;
            snapshot.peak_equity = state.equity;
        }
        snapshot.equity = state.equity;
        snapshot.margin_used = state.margin_used;
        snapshot.available_margin = state.available_margin();
        snapshot.peak_equity = snapshot.peak_equity.max(state.equity);
        snapshot.session_pnl = state.equity - snapshot.session_start_equity;
        snapshot.updated_at = state.fetched_at;
        let copy = snapshot.clone();
        drop(snapshot);

        *self.positions.write().await = state.positions;
        *self.last_pull.write().await = Instant::now();
        self.needs_resync.store(false, Ordering::SeqCst);
        Ok(copy)
    }

    /// Tick-boundary maintenance: pull when a resync is pending or the
    /// push stream has been silent past the pull interval.
    pub async fn maybe_refresh(&self) -> ExchangeResult<()> {
        let stale = self.last_pull.read().await.elapsed() >= self.pull_interval;
        if self.needs_resync.load(Ordering::SeqCst) || stale {
            if stale {
                debug!("Push stream silent past pull interval, falling back to pull");
            }
            self.refresh().await?;
        }
        Ok(())
    }

    pub async fn snapshot(&self) -> AccountSnapshot {
        self.snapshot.read().await.clone()
    }

    pub async fn positions(&self) -> Vec<PositionInfo> {
        self.positions.read().await.clone()
    }

    pub fn candles(&self, symbol: &str) -> Vec<Candle> {
        self.candles
            .get(symbol)
            .map(|buffer| buffer.to_vec())
            .unwrap_or_default()
    }

    /// Consistent read for signal producers: latest price plus the cached
    /// candle series.
    pub async fn market_view(&self) -> MarketView {
        let candles = self.candles(&self.symbol);
        let price = match candles.last() {
            Some(bar) => bar.close,
            None => self
                .positions
                .read()
                .await
                .iter()
                .find(|p| p.symbol == self.symbol)
                .map(|p| p.mark_price)
                .unwrap_or(0.0),
        };
        MarketView {
            symbol: self.symbol.clone(),
            price,
            candles,
        }
    }

    pub async fn apply_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::Account { equity, margin_used } => {
                let mut snapshot = self.snapshot.write().await;
                if snapshot.session_start_equity == 0.0 {
                    snapshot.session_start_equity = equity;
                    snapshot.peak_equity = equity;
                }
                snapshot.equity = equity;
                snapshot.margin_used = margin_used;
                snapshot.available_margin = (equity - margin_used).max(0.0);
                snapshot.peak_equity = snapshot.peak_equity.max(equity);
                snapshot.session_pnl = equity - snapshot.session_start_equity;
                snapshot.updated_at = chrono::Utc::now();
            }
            StreamEvent::PositionUpdate(update) => {
                let mut positions = self.positions.write().await;
                positions.retain(|p| p.symbol != update.symbol);
                if update.size.abs() > f64::EPSILON {
                    positions.push(update);
                }
            }
            StreamEvent::Candle { symbol, candle } => {
                let mut buffer = self
                    .candles
                    .entry(symbol.clone())
                    .or_insert_with(|| CandleBuffer::new(self.candle_capacity));
                let new_bar = buffer.push(candle);
                drop(buffer);
                if new_bar {
                    // Producers cache derived indicator values per bar.
                    self.bus.publish(EngineEvent::CacheInvalidated {
                        symbol,
                        timestamp: chrono::Utc::now(),
                    });
                }
            }
            StreamEvent::OrderFill { .. } => {
                // Fills are consumed by the execution monitor on its own
                // subscription.
            }
            StreamEvent::Disconnected => {
                warn!("Push stream disconnected");
                self.needs_resync.store(true, Ordering::SeqCst);
            }
            StreamEvent::Reconnected => {
                info!("Push stream reconnected, forcing full refresh");
                self.needs_resync.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Background consumer for the push stream. A closed stream marks the
    /// view stale so the next tick falls back to a pull.
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let mut stream = self.exchange.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = stream.recv() => match event {
                        Some(event) => self.apply_event(event).await,
                        None => {
                            error!("Push stream closed");
                            self.needs_resync.store(true, Ordering::SeqCst);
                            break;
                        }
                    },
                    _ = shutdown.recv() => {
                        debug!("State synchronizer stream consumer stopping");
                        break;
                    }
                }
            }
        })
    }
}
