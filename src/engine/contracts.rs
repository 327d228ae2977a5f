//! Contract-rules lookup.
//!
//! The engine only needs the tax-lot method (plus opaque business rules)
//! per contract. Lookups go through a port with two bindings — a REST
//! client and an in-process mock — composed with caching, retry and a
//! failure-threshold circuit breaker. A miss or a tripped breaker falls
//! back to the configured default method rather than blocking the trade.

use crate::cache::{CacheExt, SharedCache};
use crate::engine::error::EngineError;
use crate::models::{ContractRules, TaxLotMethod};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[async_trait]
pub trait ContractService: Send + Sync {
    async fn rules(&self, contract_id: &str) -> Result<ContractRules, EngineError>;
}

pub type SharedContractService = Arc<dyn ContractService>;

/// In-process binding; also the test double.
pub struct MockContractService {
    default_method: TaxLotMethod,
    overrides: RwLock<HashMap<String, ContractRules>>,
}

impl MockContractService {
    pub fn new(default_method: TaxLotMethod) -> Self {
        Self {
            default_method,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_rules(&self, rules: ContractRules) {
        self.overrides
            .write()
            .insert(rules.contract_id.clone(), rules);
    }
}

#[async_trait]
impl ContractService for MockContractService {
    async fn rules(&self, contract_id: &str) -> Result<ContractRules, EngineError> {
        if let Some(rules) = self.overrides.read().get(contract_id) {
            return Ok(rules.clone());
        }
        Ok(ContractRules::default_for(contract_id, self.default_method))
    }
}

/// REST binding: `GET {base_url}/contracts/{id}/rules`.
pub struct RestContractService {
    client: reqwest::Client,
    base_url: String,
}

impl RestContractService {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Fatal(format!("contract client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ContractService for RestContractService {
    async fn rules(&self, contract_id: &str) -> Result<ContractRules, EngineError> {
        let url = format!("{}/contracts/{}/rules", self.base_url, contract_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Transient(format!("contract lookup: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::NotFound(format!(
                "contract {} has no rules",
                contract_id
            )));
        }
        if !response.status().is_success() {
            return Err(EngineError::Transient(format!(
                "contract lookup returned {}",
                response.status()
            )));
        }
        response
            .json::<ContractRules>()
            .await
            .map_err(|e| EngineError::Transient(format!("contract rules decode: {}", e)))
    }
}

/// Retry middleware: transient failures retry with exponential backoff;
/// everything else passes straight through.
pub struct RetryingContractService {
    inner: SharedContractService,
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryingContractService {
    pub fn new(inner: SharedContractService, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }
}

#[async_trait]
impl ContractService for RetryingContractService {
    async fn rules(&self, contract_id: &str) -> Result<ContractRules, EngineError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.rules(contract_id).await {
                Err(EngineError::Transient(reason)) if attempt + 1 < self.max_attempts => {
                    attempt += 1;
                    let delay = self.base_delay * 2u32.pow(attempt - 1);
                    debug!(contract_id, attempt, %reason, "retrying contract lookup");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

/// Failure-threshold circuit breaker. After `failure_threshold` consecutive
/// failures the breaker opens for `open_for`; calls in that window fail
/// fast as Transient without touching the inner service.
pub struct CircuitBreakerContractService {
    inner: SharedContractService,
    failure_threshold: u32,
    open_for: Duration,
    state: Mutex<BreakerState>,
}

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreakerContractService {
    pub fn new(inner: SharedContractService, failure_threshold: u32, open_for: Duration) -> Self {
        Self {
            inner,
            failure_threshold: failure_threshold.max(1),
            open_for,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                open_until: None,
            }),
        }
    }

    fn check_open(&self) -> Option<EngineError> {
        let mut state = self.state.lock();
        if let Some(until) = state.open_until {
            if Instant::now() < until {
                return Some(EngineError::Transient(
                    "contract service circuit open".to_string(),
                ));
            }
            // Half-open: allow the next call through.
            state.open_until = None;
        }
        None
    }

    fn record(&self, ok: bool) {
        let mut state = self.state.lock();
        if ok {
            state.consecutive_failures = 0;
            return;
        }
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.failure_threshold {
            warn!(
                failures = state.consecutive_failures,
                "contract service circuit opened"
            );
            state.open_until = Some(Instant::now() + self.open_for);
            state.consecutive_failures = 0;
        }
    }
}

#[async_trait]
impl ContractService for CircuitBreakerContractService {
    async fn rules(&self, contract_id: &str) -> Result<ContractRules, EngineError> {
        if let Some(fail_fast) = self.check_open() {
            return Err(fail_fast);
        }
        let result = self.inner.rules(contract_id).await;
        // NotFound is an answer, not an outage.
        let outage = matches!(
            &result,
            Err(EngineError::Transient(_) | EngineError::Fatal(_))
        );
        self.record(!outage);
        result
    }
}

/// Resolve the tax-lot method for a trade's contract, consulting the cache
/// first and degrading to `default_method` on any lookup failure.
pub struct ContractRulesResolver {
    service: SharedContractService,
    cache: SharedCache,
    cache_ttl: Duration,
    default_method: TaxLotMethod,
}

impl ContractRulesResolver {
    pub fn new(
        service: SharedContractService,
        cache: SharedCache,
        cache_ttl: Duration,
        default_method: TaxLotMethod,
    ) -> Self {
        Self {
            service,
            cache,
            cache_ttl,
            default_method,
        }
    }

    pub fn default_method(&self) -> TaxLotMethod {
        self.default_method
    }

    pub async fn resolve(&self, contract_id: Option<&str>) -> ContractRules {
        let Some(contract_id) = contract_id else {
            return ContractRules::default_for("", self.default_method);
        };
        let cache_key = format!("contract-rules:{}", contract_id);
        let lookup = self
            .cache
            .get_or_compute(&cache_key, Some(self.cache_ttl), || async {
                self.service.rules(contract_id).await
            })
            .await;
        match lookup {
            Ok(rules) => rules,
            Err(e) => {
                warn!(contract_id, error = %e, "contract lookup failed; using default rules");
                ContractRules::default_for(contract_id, self.default_method)
            }
        }
    }
}
