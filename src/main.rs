//! posengine - event-sourced position management for equity swaps.
//!
//! Composition root: loads configuration, builds the adapter graph
//! (stores, bus, cache, contract rules), starts the dispatcher workers and
//! background sweeps, then runs until interrupted.

use anyhow::{bail, Context, Result};
use posengine_backend::bus::{BusConsumer, MemoryBus, SharedProducer};
use posengine_backend::cache::{MemoryCache, SharedCache};
use posengine_backend::config::{
    CacheType, Config, ContractServiceType, MessagingProvider,
};
use posengine_backend::engine::classifier::Classifier;
use posengine_backend::engine::contracts::{
    CircuitBreakerContractService, ContractRulesResolver, MockContractService,
    RestContractService, RetryingContractService, SharedContractService,
};
use posengine_backend::engine::{
    ColdpathRecalculator, Dispatcher, HotpathProcessor, ReconciliationChecker,
};
use posengine_backend::store::{Database, StoreSweeper};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Redelivery budget for the in-memory bus binding.
const MEMORY_BUS_MAX_DELIVERIES: u32 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "posengine=info,posengine_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("loading configuration")?;
    info!(
        db = %config.database_path,
        partitions = config.partitions_count,
        workers = config.worker_count,
        "🚀 Starting position engine"
    );

    let db = Database::open(&config.database_path)
        .map_err(|e| anyhow::anyhow!("opening database: {}", e))?;

    let cache: SharedCache = match config.cache_type {
        CacheType::Memory => Arc::new(MemoryCache::new()),
        CacheType::Redis => bail!("redis cache binding is not bundled in this build"),
    };

    let bus = match config.messaging_provider {
        MessagingProvider::Memory => Arc::new(MemoryBus::new(MEMORY_BUS_MAX_DELIVERIES)),
        MessagingProvider::Kafka | MessagingProvider::Solace => {
            bail!("vendor bus bindings are not bundled in this build")
        }
    };
    let producer: SharedProducer = bus.clone();

    let contract_service: SharedContractService = match config.contract_service_type {
        ContractServiceType::Mock => {
            Arc::new(MockContractService::new(config.default_tax_lot_method))
        }
        ContractServiceType::Rest => {
            let url = match config.contract_service_url.clone() {
                Some(url) => url,
                None => bail!("CONTRACT_SERVICE_URL is required for the rest contract service"),
            };
            Arc::new(RestContractService::new(url, Duration::from_secs(5))
                .map_err(|e| anyhow::anyhow!("contract client: {}", e))?)
        }
    };
    let contract_service: SharedContractService = Arc::new(RetryingContractService::new(
        contract_service,
        3,
        Duration::from_millis(100),
    ));
    let contract_service: SharedContractService = Arc::new(CircuitBreakerContractService::new(
        contract_service,
        5,
        Duration::from_secs(30),
    ));
    let contracts = Arc::new(ContractRulesResolver::new(
        contract_service,
        cache.clone(),
        Duration::from_secs(300),
        config.default_tax_lot_method,
    ));

    let classifier = Classifier::new(config.engine_timezone);

    let hotpath = Arc::new(HotpathProcessor::new(
        db.clone(),
        cache.clone(),
        contracts.clone(),
        producer.clone(),
        classifier.clone(),
        config.topics.clone(),
        config.partitions_count,
        config.save_retry_limit,
    ));
    let coldpath = Arc::new(ColdpathRecalculator::new(
        db.clone(),
        cache.clone(),
        contracts.clone(),
        producer.clone(),
        config.topics.clone(),
        config.partitions_count,
    ));

    let dispatcher = Dispatcher::start(
        hotpath,
        coldpath,
        db.clone(),
        producer,
        config.topics.clone(),
        classifier,
        config.worker_count,
        config.worker_queue_depth,
        config.partitions_count,
    );
    dispatcher.attach(bus.as_ref());
    bus.start()
        .await
        .map_err(|e| anyhow::anyhow!("starting bus consumer: {}", e))?;

    let sweeper = StoreSweeper::new(
        db.clone(),
        config.idempotency_retention,
        config.archival_age,
        config.provisional_stale_after,
        config.partitions_count,
    );
    let sweep_task = tokio::spawn(sweeper.run(config.sweep_interval));

    let reconciler = ReconciliationChecker::new(db.clone(), contracts);
    let reconciliation_task = tokio::spawn(reconciler.run(config.reconciliation_interval));

    info!("✅ Engine online; waiting for trades");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("🛑 Shutdown signal received");

    bus.stop().await;
    sweep_task.abort();
    reconciliation_task.abort();
    dispatcher.shutdown().await;
    info!("engine stopped");
    Ok(())
}
