//! Bus dispatcher and per-key worker pool.
//!
//! Messages for one position key always land on the same worker
//! (`partition(key) % workers`), which gives single-threaded semantics per
//! position without a global lock; hot and cold work for a key share that
//! worker, so two backdated trades for one position serialize. Worker
//! queues are bounded: when one fills, the topic consumer blocks on the
//! send and the bus stops being polled — backpressure instead of loss.
//!
//! Error routing at this boundary:
//! - validation and state-machine rejections: DLQ + FAILED idempotency + ack
//! - transient and exhausted-conflict failures: nack (bus redelivers;
//!   idempotency makes the retry safe)
//! - corruption: errors topic + ack, with an alert log

use crate::bus::{Acker, BusConsumer, BusHandler, Delivery, SharedProducer};
use crate::config::Topics;
use crate::engine::classifier::Classifier;
use crate::engine::coldpath::ColdpathRecalculator;
use crate::engine::error::EngineError;
use crate::engine::hotpath::HotpathProcessor;
use crate::engine::position_key::{partition, position_key};
use crate::engine::validation;
use crate::models::{DeadLetter, Trade};
use crate::store::{Database, IdempotencyRecord};
use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkKind {
    Hot,
    Cold,
}

struct WorkItem {
    trade: Trade,
    kind: WorkKind,
    acker: Acker,
}

struct DispatcherCore {
    workers: Vec<mpsc::Sender<WorkItem>>,
    partitions_count: u32,
    producer: SharedProducer,
    topics: Topics,
}

pub struct Dispatcher {
    core: Arc<DispatcherCore>,
    tasks: Vec<JoinHandle<()>>,
}

/// Everything a worker needs to drive one trade to a settled outcome.
struct WorkerContext {
    hotpath: Arc<HotpathProcessor>,
    coldpath: Arc<ColdpathRecalculator>,
    db: Database,
    producer: SharedProducer,
    topics: Topics,
    classifier: Classifier,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        hotpath: Arc<HotpathProcessor>,
        coldpath: Arc<ColdpathRecalculator>,
        db: Database,
        producer: SharedProducer,
        topics: Topics,
        classifier: Classifier,
        worker_count: usize,
        queue_depth: usize,
        partitions_count: u32,
    ) -> Self {
        let context = Arc::new(WorkerContext {
            hotpath,
            coldpath,
            db,
            producer: producer.clone(),
            topics: topics.clone(),
            classifier,
        });

        let mut workers = Vec::with_capacity(worker_count);
        let mut tasks = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let (sender, receiver) = mpsc::channel(queue_depth.max(1));
            workers.push(sender);
            let context = context.clone();
            tasks.push(tokio::spawn(worker_loop(worker_id, receiver, context)));
        }
        info!(worker_count, queue_depth, "dispatcher workers started");

        Self {
            core: Arc::new(DispatcherCore {
                workers,
                partitions_count,
                producer,
                topics,
            }),
            tasks,
        }
    }

    /// Register this dispatcher's handlers on the consumer's two topics.
    pub fn attach(&self, consumer: &dyn BusConsumer) {
        consumer.subscribe(
            &self.core.topics.trade_events,
            Arc::new(TopicHandler {
                core: self.core.clone(),
                kind: WorkKind::Hot,
            }),
        );
        consumer.subscribe(
            &self.core.topics.backdated_trades,
            Arc::new(TopicHandler {
                core: self.core.clone(),
                kind: WorkKind::Cold,
            }),
        );
    }

    pub async fn shutdown(self) {
        drop(self.core);
        for task in self.tasks {
            task.abort();
        }
    }
}

struct TopicHandler {
    core: Arc<DispatcherCore>,
    kind: WorkKind,
}

#[async_trait]
impl BusHandler for TopicHandler {
    async fn handle(&self, delivery: Delivery) {
        let Delivery {
            key,
            payload,
            attempt,
            acker,
            ..
        } = delivery;

        let trade: Trade = match serde_json::from_slice(&payload) {
            Ok(trade) => trade,
            Err(e) => {
                // Not even a trade; there is nothing to retry.
                error!(bus_key = %key, error = %e, "undecodable trade payload; dead-lettering");
                counter!("posengine_undecodable_payloads", 1);
                let raw = serde_json::json!({
                    "rawPayload": String::from_utf8_lossy(&payload),
                    "errors": [format!("payload decode failed: {}", e)],
                    "errorType": "INVALID_ARGUMENT",
                });
                let _ = self
                    .core
                    .producer
                    .send(
                        &self.core.topics.dlq,
                        &key,
                        raw.to_string().into_bytes(),
                    )
                    .await;
                acker.ack();
                return;
            }
        };

        if attempt > 1 {
            debug!(trade_id = %trade.trade_id, attempt, "redelivered trade");
        }

        let routing_key = match routing_key(&trade) {
            Ok(k) => k,
            Err(e) => {
                publish_dead_letter(
                    &self.core.producer,
                    &self.core.topics,
                    trade,
                    vec![e.to_string()],
                    "INVALID_ARGUMENT",
                )
                .await;
                acker.ack();
                return;
            }
        };

        let partition_no = match partition(&routing_key, self.core.partitions_count) {
            Ok(p) => p,
            Err(e) => {
                publish_dead_letter(
                    &self.core.producer,
                    &self.core.topics,
                    trade,
                    vec![e.to_string()],
                    "INVALID_ARGUMENT",
                )
                .await;
                acker.ack();
                return;
            }
        };

        let worker = (partition_no as usize) % self.core.workers.len();
        let item = WorkItem {
            trade,
            kind: self.kind,
            acker,
        };
        // Bounded send: a full queue blocks here, pausing topic polling.
        if self.core.workers[worker].send(item).await.is_err() {
            warn!(worker, "worker queue closed; delivery will be redelivered");
        }
    }
}

/// Stable routing key: the precomputed position key, or one derived from
/// the triple.
fn routing_key(trade: &Trade) -> Result<String, EngineError> {
    match &trade.position_key {
        Some(k) if !k.trim().is_empty() => Ok(k.clone()),
        _ => position_key(
            &trade.account,
            &trade.instrument,
            &trade.currency,
            trade.direction,
        ),
    }
}

async fn worker_loop(
    worker_id: usize,
    mut receiver: mpsc::Receiver<WorkItem>,
    context: Arc<WorkerContext>,
) {
    debug!(worker_id, "worker online");
    while let Some(item) = receiver.recv().await {
        match item.kind {
            WorkKind::Hot => handle_hot(&context, item.trade, item.acker).await,
            WorkKind::Cold => handle_cold(&context, item.trade, item.acker).await,
        }
    }
    debug!(worker_id, "worker offline");
}

async fn handle_hot(context: &WorkerContext, trade: Trade, acker: Acker) {
    // Duplicate check comes before the gate: a replayed trade must settle
    // to its recorded outcome, not re-validate against the moved-on
    // snapshot.
    match context.db.idempotency().check(&trade.trade_id) {
        Ok(Some(record)) => {
            debug!(
                trade_id = %trade.trade_id,
                status = record.status.as_str(),
                "duplicate delivery settled from idempotency record"
            );
            acker.ack();
            return;
        }
        Ok(None) => {}
        Err(e) => {
            warn!(trade_id = %trade.trade_id, error = %e, "idempotency check failed; redelivering");
            acker.nack();
            return;
        }
    }

    // Validation gate, serialized with mutations by the per-key worker.
    let key = match routing_key(&trade) {
        Ok(k) => k,
        Err(e) => {
            publish_dead_letter(
                &context.producer,
                &context.topics,
                trade,
                vec![e.to_string()],
                "INVALID_ARGUMENT",
            )
            .await;
            acker.ack();
            return;
        }
    };

    let snapshot = match context.hotpath.load_position(&key).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(trade_id = %trade.trade_id, error = %e, "snapshot load failed; redelivering");
            acker.nack();
            return;
        }
    };

    if let Err(failure) =
        validation::validate(&trade, snapshot.as_ref(), context.classifier.today())
    {
        counter!("posengine_validation_failures", 1);
        record_failed(context, &trade, &key);
        publish_dead_letter(
            &context.producer,
            &context.topics,
            trade,
            failure.errors,
            failure.error_type,
        )
        .await;
        acker.ack();
        return;
    }

    match context.hotpath.process(trade.clone()).await {
        Ok(_) => acker.ack(),
        Err(e) => settle_failure(context, trade, Some(key), e, acker).await,
    }
}

async fn handle_cold(context: &WorkerContext, trade: Trade, acker: Acker) {
    let key = trade.position_key.clone();
    match context.coldpath.recalculate(trade.clone()).await {
        Ok(_) => acker.ack(),
        Err(e) => settle_failure(context, trade, key, e, acker).await,
    }
}

/// Map a processing error onto its bus disposition.
async fn settle_failure(
    context: &WorkerContext,
    trade: Trade,
    key: Option<String>,
    e: EngineError,
    acker: Acker,
) {
    match &e {
        EngineError::InvalidArgument(_) | EngineError::StateViolation(_) => {
            counter!("posengine_terminal_failures", 1);
            if let Some(key) = &key {
                record_failed(context, &trade, key);
            }
            let error_type = e.error_type();
            publish_dead_letter(
                &context.producer,
                &context.topics,
                trade,
                vec![e.to_string()],
                error_type,
            )
            .await;
            acker.ack();
        }
        EngineError::DataCorruption { event_id, .. } => {
            error!(
                trade_id = %trade.trade_id,
                event_id = %event_id,
                error = %e,
                "corrupt stored data encountered; routing to error queue"
            );
            counter!("posengine_corruption_failures", 1);
            let letter = DeadLetter::new(trade, vec![e.to_string()], e.error_type());
            if let Ok(payload) = serde_json::to_vec(&letter) {
                let _ = context
                    .producer
                    .send(
                        &context.topics.errors,
                        key.as_deref().unwrap_or(&letter.trade.trade_id),
                        payload,
                    )
                    .await;
            }
            acker.ack();
        }
        EngineError::Transient(_) | EngineError::VersionConflict(_) | EngineError::NotFound(_) => {
            warn!(trade_id = %trade.trade_id, error = %e, "retryable failure; redelivering");
            counter!("posengine_retryable_failures", 1);
            acker.nack();
        }
        EngineError::Fatal(reason) => {
            // A vendor binding would stop the consumer here; the in-memory
            // binding redelivers until the cap trips.
            error!(trade_id = %trade.trade_id, %reason, "fatal storage failure");
            counter!("posengine_fatal_failures", 1);
            acker.nack();
        }
    }
}

fn record_failed(context: &WorkerContext, trade: &Trade, key: &str) {
    if let Err(e) = context
        .db
        .idempotency()
        .record(&IdempotencyRecord::failed(&trade.trade_id, key))
    {
        warn!(trade_id = %trade.trade_id, error = %e, "could not record FAILED idempotency");
    }
}

async fn publish_dead_letter(
    producer: &SharedProducer,
    topics: &Topics,
    trade: Trade,
    errors: Vec<String>,
    error_type: &str,
) {
    counter!("posengine_dead_letters", 1);
    let key = trade
        .position_key
        .clone()
        .unwrap_or_else(|| trade.trade_id.clone());
    let letter = DeadLetter::new(trade, errors, error_type);
    match serde_json::to_vec(&letter) {
        Ok(payload) => {
            if let Err(e) = producer.send(&topics.dlq, &key, payload).await {
                error!(error = %e, "DLQ publish failed; message is lost to the DLQ but acked");
            }
        }
        Err(e) => error!(error = %e, "dead letter serialization failed"),
    }
}
