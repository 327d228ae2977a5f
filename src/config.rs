//! Engine configuration loaded from the environment.
//!
//! Every knob has a default so the engine boots with an empty environment;
//! `.env` files are honored via dotenv.

use crate::models::TaxLotMethod;
use anyhow::{bail, Context, Result};
use std::env;
use std::time::Duration;

/// Messaging binding selected at composition time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagingProvider {
    /// In-process bus (tests, single-node deployments).
    Memory,
    Kafka,
    Solace,
}

/// Cache binding selected at composition time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    Memory,
    Redis,
}

/// Contract-rules lookup binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractServiceType {
    Rest,
    Mock,
}

/// Bus topic names. Configurable so shared clusters can namespace them.
#[derive(Debug, Clone)]
pub struct Topics {
    pub trade_events: String,
    pub backdated_trades: String,
    pub dlq: String,
    pub errors: String,
    pub corrections: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            trade_events: "trade-events".to_string(),
            backdated_trades: "backdated-trades".to_string(),
            dlq: "trade-events-dlq".to_string(),
            errors: "trade-events-errors".to_string(),
            corrections: "historical-position-corrected-events".to_string(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub messaging_provider: MessagingProvider,
    pub cache_type: CacheType,
    pub contract_service_type: ContractServiceType,
    pub contract_service_url: Option<String>,
    /// Partitioner modulus for keyed routing.
    pub partitions_count: u32,
    /// Worker pool size; keys hash onto workers, one thread of work per key.
    pub worker_count: usize,
    /// Bounded depth of each worker queue (backpressure threshold).
    pub worker_queue_depth: usize,
    /// Optimistic-lock retry budget on snapshot save.
    pub save_retry_limit: u32,
    pub idempotency_retention: Duration,
    pub provisional_stale_after: Duration,
    /// Events older than this are flagged for archival by the sweep.
    pub archival_age: Duration,
    pub sweep_interval: Duration,
    /// Replay-vs-snapshot reconciliation cadence.
    pub reconciliation_interval: Duration,
    pub default_tax_lot_method: TaxLotMethod,
    /// Zone used to resolve "today" for effective-date classification.
    pub engine_timezone: chrono_tz::Tz,
    pub topics: Topics,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "./posengine.db".to_string());

        let messaging_provider = match env::var("MESSAGING_PROVIDER")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "memory" => MessagingProvider::Memory,
            "kafka" => MessagingProvider::Kafka,
            "solace" => MessagingProvider::Solace,
            other => bail!("unrecognized MESSAGING_PROVIDER: {}", other),
        };

        let cache_type = match env::var("CACHE_TYPE")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "memory" => CacheType::Memory,
            "redis" => CacheType::Redis,
            other => bail!("unrecognized CACHE_TYPE: {}", other),
        };

        let contract_service_type = match env::var("CONTRACT_SERVICE_TYPE")
            .unwrap_or_else(|_| "mock".to_string())
            .to_lowercase()
            .as_str()
        {
            "rest" => ContractServiceType::Rest,
            "mock" => ContractServiceType::Mock,
            other => bail!("unrecognized CONTRACT_SERVICE_TYPE: {}", other),
        };

        let contract_service_url = env::var("CONTRACT_SERVICE_URL").ok();
        if contract_service_type == ContractServiceType::Rest && contract_service_url.is_none() {
            bail!("CONTRACT_SERVICE_TYPE=rest requires CONTRACT_SERVICE_URL");
        }

        let partitions_count = env_parse("PARTITIONS_COUNT", 16u32)?;
        if partitions_count == 0 {
            bail!("PARTITIONS_COUNT must be positive");
        }

        let worker_count = env_parse("WORKER_COUNT", 8usize)?;
        if worker_count == 0 {
            bail!("WORKER_COUNT must be positive");
        }

        let engine_timezone: chrono_tz::Tz = env::var("ENGINE_TIMEZONE")
            .unwrap_or_else(|_| "UTC".to_string())
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid ENGINE_TIMEZONE: {}", e))?;

        let default_tax_lot_method = {
            let raw = env::var("TAXLOT_DEFAULT_METHOD").unwrap_or_else(|_| "FIFO".to_string());
            TaxLotMethod::parse(&raw)
                .with_context(|| format!("invalid TAXLOT_DEFAULT_METHOD: {}", raw))?
        };

        let topics = Topics {
            trade_events: env::var("TOPIC_TRADE_EVENTS")
                .unwrap_or_else(|_| Topics::default().trade_events),
            backdated_trades: env::var("TOPIC_BACKDATED_TRADES")
                .unwrap_or_else(|_| Topics::default().backdated_trades),
            dlq: env::var("TOPIC_DLQ").unwrap_or_else(|_| Topics::default().dlq),
            errors: env::var("TOPIC_ERRORS").unwrap_or_else(|_| Topics::default().errors),
            corrections: env::var("TOPIC_CORRECTIONS")
                .unwrap_or_else(|_| Topics::default().corrections),
        };

        Ok(Self {
            database_path,
            messaging_provider,
            cache_type,
            contract_service_type,
            contract_service_url,
            partitions_count,
            worker_count,
            worker_queue_depth: env_parse("WORKER_QUEUE_DEPTH", 256usize)?,
            save_retry_limit: env_parse("SAVE_RETRY_LIMIT", 3u32)?,
            idempotency_retention: Duration::from_secs(env_parse(
                "IDEMPOTENCY_RETENTION_SECS",
                7 * 24 * 3600u64,
            )?),
            provisional_stale_after: Duration::from_secs(env_parse(
                "COLDPATH_PROVISIONAL_STALE_AFTER_SECS",
                900u64,
            )?),
            archival_age: Duration::from_secs(env_parse(
                "ARCHIVAL_AGE_SECS",
                365 * 24 * 3600u64,
            )?),
            sweep_interval: Duration::from_secs(env_parse("SWEEP_INTERVAL_SECS", 300u64)?),
            reconciliation_interval: Duration::from_secs(env_parse(
                "RECONCILIATION_INTERVAL_SECS",
                3600u64,
            )?),
            default_tax_lot_method,
            engine_timezone,
            topics,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: ":memory:".to_string(),
            messaging_provider: MessagingProvider::Memory,
            cache_type: CacheType::Memory,
            contract_service_type: ContractServiceType::Mock,
            contract_service_url: None,
            partitions_count: 16,
            worker_count: 4,
            worker_queue_depth: 256,
            save_retry_limit: 3,
            idempotency_retention: Duration::from_secs(7 * 24 * 3600),
            provisional_stale_after: Duration::from_secs(900),
            archival_age: Duration::from_secs(365 * 24 * 3600),
            sweep_interval: Duration::from_secs(300),
            reconciliation_interval: Duration::from_secs(3600),
            default_tax_lot_method: TaxLotMethod::Fifo,
            engine_timezone: chrono_tz::UTC,
            topics: Topics::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {}: {}", var, e)),
    }
}
