use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::core::{AccountSnapshot, MarketView, PositionInfo, Signal};

use super::producer::SignalProducer;

/// Conflict resolution when several producers fire in the same tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationPolicy {
    /// First non-empty result in registration order. Default.
    FirstAvailable,
    /// Fixed ranking supplied at registration.
    Priority,
    /// Rotate preference among the producers that fired this tick.
    RoundRobin,
}

#[derive(Debug, Default, Clone)]
pub struct ProducerStats {
    pub proposals: u64,
    pub wins: u64,
    pub timeouts: u64,
}

struct Registered {
    producer: Arc<dyn SignalProducer>,
    priority: u32,
}

/// Signal Arbitrator
///
/// Fans signal generation out to every registered producer concurrently,
/// bounds each with a timeout, and selects at most one winner per tick.
/// The single-open-position gate lives here: with a position already open
/// for the instrument, producers are not even invoked.
pub struct SignalArbiter {
    producers: Vec<Registered>,
    policy: ArbitrationPolicy,
    producer_timeout: Duration,
    cooldown: Duration,
    last_accepted: RwLock<Option<Instant>>,
    rotation: AtomicUsize,
    stats: DashMap<String, ProducerStats>,
}

impl SignalArbiter {
    pub fn new(policy: ArbitrationPolicy, producer_timeout: Duration, cooldown: Duration) -> Self {
        Self {
            producers: Vec::new(),
            policy,
            producer_timeout,
            cooldown,
            last_accepted: RwLock::new(None),
            rotation: AtomicUsize::new(0),
            stats: DashMap::new(),
        }
    }

    pub fn register(&mut self, producer: Arc<dyn SignalProducer>) {
        self.register_with_priority(producer, u32::MAX);
    }

    /// Lower value ranks higher under the priority policy.
    pub fn register_with_priority(&mut self, producer: Arc<dyn SignalProducer>, priority: u32) {
        self.stats
            .insert(producer.name().to_string(), ProducerStats::default());
        self.producers.push(Registered { producer, priority });
    }

    pub fn invalidate_caches(&self) {
        for registered in &self.producers {
            registered.producer.invalidate_cache();
        }
    }

    /// Record that a proposed signal was accepted and executed, starting
    /// the cooldown window.
    pub async fn note_accepted(&self, winner: &Signal) {
        *self.last_accepted.write().await = Some(Instant::now());
        if let Some(mut stats) = self.stats.get_mut(&winner.strategy) {
            stats.wins += 1;
        }
    }

    pub fn stats(&self) -> Vec<(String, ProducerStats)> {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub async fn propose(
        &self,
        market: &MarketView,
        account: &AccountSnapshot,
        open_positions: &[PositionInfo],
    ) -> Option<Signal> {
        // Single-position gate, checked before any producer runs.
        if open_positions
            .iter()
            .any(|p| p.symbol == market.symbol && p.size.abs() > f64::EPSILON)
        {
            return None;
        }

        if let Some(last) = *self.last_accepted.read().await {
            if last.elapsed() < self.cooldown {
                return None;
            }
        }

        if self.producers.is_empty() {
            return None;
        }

        let polls = self.producers.iter().map(|registered| {
            let producer = registered.producer.clone();
            async move {
                match timeout(
                    self.producer_timeout,
                    producer.generate_signal(market, account),
                )
                .await
                {
                    Ok(signal) => (producer.name().to_string(), signal, false),
                    Err(_) => {
                        warn!(producer = producer.name(), "Signal producer timed out");
                        (producer.name().to_string(), None, true)
                    }
                }
            }
        });

        let now = Utc::now();
        let mut candidates: Vec<(usize, Signal)> = Vec::new();
        for (index, (name, signal, timed_out)) in join_all(polls).await.into_iter().enumerate() {
            if let Some(mut stats) = self.stats.get_mut(&name) {
                if timed_out {
                    stats.timeouts += 1;
                }
            }
            let Some(signal) = signal else { continue };
            if signal.is_expired(now) {
                debug!(producer = %name, "Discarding expired signal");
                continue;
            }
            if let Some(mut stats) = self.stats.get_mut(&name) {
                stats.proposals += 1;
            }
            candidates.push((index, signal));
        }

        if candidates.is_empty() {
            return None;
        }

        let winner = match self.policy {
            ArbitrationPolicy::FirstAvailable => candidates.swap_remove(0).1,
            ArbitrationPolicy::Priority => {
                candidates.sort_by_key(|(index, _)| self.producers[*index].priority);
                candidates.swap_remove(0).1
            }
            ArbitrationPolicy::RoundRobin => {
                let turn = self.rotation.fetch_add(1, Ordering::SeqCst);
                let pick = turn % candidates.len();
                candidates.swap_remove(pick).1
            }
        };

        debug!(
            strategy = %winner.strategy,
            symbol = %winner.symbol,
            side = %winner.side,
            "Arbitration winner"
        );
        Some(winner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Side;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    struct FixedProducer {
        name: String,
        signal: Option<Signal>,
        calls: AtomicU64,
    }

    impl FixedProducer {
        fn new(name: &str, signal: Option<Signal>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                signal,
                calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl SignalProducer for FixedProducer {
        fn name(&self) -> &str {
            &self.name
        }

        async fn generate_signal(
            &self,
            _market: &MarketView,
            _account: &AccountSnapshot,
        ) -> Option<Signal> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.signal.clone()
        }
    }

    struct SlowProducer;

    #[async_trait]
    impl SignalProducer for SlowProducer {
        fn name(&self) -> &str {
            "slow"
        }

        async fn generate_signal(
            &self,
            market: &MarketView,
            _account: &AccountSnapshot,
        ) -> Option<Signal> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Some(long_signal(&market.symbol, "slow"))
        }
    }

    fn long_signal(symbol: &str, strategy: &str) -> Signal {
        Signal {
            symbol: symbol.into(),
            side: Side::Long,
            entry_price: 100.0,
            stop_loss: Some(95.0),
            take_profit: Some(110.0),
            size: None,
            strategy: strategy.into(),
            confidence: 0.8,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    fn market() -> MarketView {
        MarketView {
            symbol: "SOL".into(),
            price: 100.0,
            candles: Vec::new(),
        }
    }

    fn account() -> AccountSnapshot {
        AccountSnapshot {
            equity: 1000.0,
            margin_used: 0.0,
            available_margin: 1000.0,
            peak_equity: 1000.0,
            session_start_equity: 1000.0,
            session_pnl: 0.0,
            updated_at: Utc::now(),
        }
    }

    fn arbiter(policy: ArbitrationPolicy) -> SignalArbiter {
        SignalArbiter::new(policy, Duration::from_millis(50), Duration::ZERO)
    }

    #[tokio::test]
    async fn first_available_prefers_registration_order() {
        let mut arb = arbiter(ArbitrationPolicy::FirstAvailable);
        arb.register(FixedProducer::new("alpha", Some(long_signal("SOL", "alpha"))));
        arb.register(FixedProducer::new("beta", Some(long_signal("SOL", "beta"))));

        let winner = arb.propose(&market(), &account(), &[]).await.unwrap();
        assert_eq!(winner.strategy, "alpha");
    }

    #[tokio::test]
    async fn open_position_skips_producers_entirely() {
        let producer = FixedProducer::new("alpha", Some(long_signal("SOL", "alpha")));
        let mut arb = arbiter(ArbitrationPolicy::FirstAvailable);
        arb.register(producer.clone());

        let open = vec![PositionInfo {
            symbol: "SOL".into(),
            size: 2.0,
            entry_price: 95.0,
            mark_price: 100.0,
            unrealized_pnl: 10.0,
        }];
        assert!(arb.propose(&market(), &account(), &open).await.is_none());
        assert_eq!(producer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_does_not_fail_the_tick() {
        let mut arb = arbiter(ArbitrationPolicy::FirstAvailable);
        arb.register(Arc::new(SlowProducer));
        arb.register(FixedProducer::new("beta", Some(long_signal("SOL", "beta"))));

        let winner = arb.propose(&market(), &account(), &[]).await.unwrap();
        assert_eq!(winner.strategy, "beta");
        let stats = arb.stats();
        let slow = stats.iter().find(|(name, _)| name == "slow").unwrap();
        assert_eq!(slow.1.timeouts, 1);
    }

    #[tokio::test]
    async fn priority_policy_ranks_over_registration_order() {
        let mut arb = arbiter(ArbitrationPolicy::Priority);
        arb.register_with_priority(
            FixedProducer::new("alpha", Some(long_signal("SOL", "alpha"))),
            5,
        );
        arb.register_with_priority(
            FixedProducer::new("beta", Some(long_signal("SOL", "beta"))),
            1,
        );

        let winner = arb.propose(&market(), &account(), &[]).await.unwrap();
        assert_eq!(winner.strategy, "beta");
    }

    #[tokio::test]
    async fn round_robin_rotates_winners() {
        let mut arb = arbiter(ArbitrationPolicy::RoundRobin);
        arb.register(FixedProducer::new("alpha", Some(long_signal("SOL", "alpha"))));
        arb.register(FixedProducer::new("beta", Some(long_signal("SOL", "beta"))));

        let first = arb.propose(&market(), &account(), &[]).await.unwrap();
        let second = arb.propose(&market(), &account(), &[]).await.unwrap();
        assert_ne!(first.strategy, second.strategy);
    }

    #[tokio::test]
    async fn expired_signals_are_discarded() {
        let mut expired = long_signal("SOL", "alpha");
        expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(5));
        let mut arb = arbiter(ArbitrationPolicy::FirstAvailable);
        arb.register(FixedProducer::new("alpha", Some(expired)));

        assert!(arb.propose(&market(), &account(), &[]).await.is_none());
    }

    #[tokio::test]
    async fn cooldown_suppresses_back_to_back_signals() {
        let mut arb =
            SignalArbiter::new(ArbitrationPolicy::FirstAvailable, Duration::from_millis(50), Duration::from_secs(60));
        arb.register(FixedProducer::new("alpha", Some(long_signal("SOL", "alpha"))));

        let winner = arb.propose(&market(), &account(), &[]).await.unwrap();
        arb.note_accepted(&winner).await;
        assert!(arb.propose(&market(), &account(), &[]).await.is_none());
    }
}
