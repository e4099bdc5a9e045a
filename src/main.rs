use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use harrier::config::Config;
use harrier::engine::TradingEngine;
use harrier::exchange::{ExchangeClient, PaperExchange};
use harrier::execution::{ExecutionEngine, OrderMonitor};
use harrier::position::PositionManager;
use harrier::risk::KillSwitch;
use harrier::signals::{ArbitrationPolicy, SignalArbiter};
use harrier::sync::StateSynchronizer;
use harrier::transport::EventBus;

struct ServiceOrchestrator {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<Result<()>>>,
}

impl ServiceOrchestrator {
    fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    async fn start_all_services(&mut self, config: Config) -> Result<()> {
        info!("Starting all Harrier services");

        let bus = EventBus::new();
        let exchange: Arc<dyn ExchangeClient> =
            Arc::new(PaperExchange::new(paper_balance()));

        let sync = Arc::new(StateSynchronizer::new(
            exchange.clone(),
            &config.sync,
            &config.trading.symbol,
            bus.clone(),
        ));
        sync.bootstrap().await?;

        let execution = Arc::new(ExecutionEngine::new(
            exchange.clone(),
            config.execution.clone(),
            config.trading.enable_bracket_orders,
            bus.clone(),
        ));
        let positions = Arc::new(PositionManager::new(
            exchange.clone(),
            execution.clone(),
            bus.clone(),
            config.trading.leverage,
        ));
        let kill_switch = Arc::new(KillSwitch::new(&config.risk));

        // Producers register here; the engine runs (and protects existing
        // positions) even with none wired in.
        let arbiter = Arc::new(SignalArbiter::new(
            ArbitrationPolicy::FirstAvailable,
            Duration::from_millis(config.trading.producer_timeout_ms),
            Duration::from_secs(config.trading.signal_cooldown_secs),
        ));

        // Push-stream consumer.
        let sync_task = sync.clone().spawn(self.shutdown_tx.subscribe());
        self.tasks.push(tokio::spawn(async move {
            sync_task.await?;
            Ok(())
        }));

        // Background order reconciliation.
        let monitor = Arc::new(OrderMonitor::new(
            execution.clone(),
            positions.clone(),
            exchange.clone(),
            Duration::from_secs(config.execution.monitor_interval_secs),
        ));
        let monitor_task = monitor.spawn(self.shutdown_tx.subscribe());
        self.tasks.push(tokio::spawn(async move {
            monitor_task.await?;
            Ok(())
        }));

        // Control loop.
        let engine_shutdown = self.shutdown_tx.subscribe();
        let mut engine = TradingEngine::new(
            config,
            sync,
            arbiter,
            execution,
            positions,
            kill_switch,
            bus,
        );
        self.tasks.push(tokio::spawn(async move {
            engine.run(engine_shutdown).await
        }));

        Ok(())
    }

    async fn shutdown_all(&mut self) -> Result<()> {
        info!("Initiating graceful shutdown of all services");
        let _ = self.shutdown_tx.send(());

        let results = futures_util::future::join_all(self.tasks.drain(..)).await;
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Ok(Ok(())) => info!("Service {} shut down cleanly", i + 1),
                Ok(Err(e)) => warn!("Service {} error during shutdown: {}", i + 1, e),
                Err(e) => error!("Service {} task failed: {}", i + 1, e),
            }
        }

        info!("All services shut down");
        Ok(())
    }
}

fn paper_balance() -> f64 {
    std::env::var("HARRIER_PAPER_BALANCE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10_000.0)
}

fn load_config() -> Config {
    let path = std::env::var("HARRIER_CONFIG").unwrap_or_else(|_| "harrier.toml".to_string());
    match Config::load_from_file(&path) {
        Ok(config) => {
            info!(%path, "Configuration loaded");
            config
        }
        Err(err) => {
            warn!(%path, %err, "Config file unavailable, using defaults");
            Config::default()
        }
    }
}

fn init_tracing() -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::daily("logs", "harrier.log");
    let (non_blocking_file, _guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .json()
        .with_current_span(false)
        .with_span_list(true);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Keep the appender alive for the life of the process.
    std::mem::forget(_guard);

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("Harrier Execution & Risk Engine");
    info!("===============================");

    let config = load_config();
    let mut orchestrator = ServiceOrchestrator::new();

    match orchestrator.start_all_services(config).await {
        Ok(()) => {
            info!("Engine running, press Ctrl+C to shut down");
        }
        Err(e) => {
            error!("Failed to start services: {}", e);
            return Err(e);
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    orchestrator.shutdown_all().await?;

    info!("Harrier shutdown complete");
    Ok(())
}
