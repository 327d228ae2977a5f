//! In-process bus binding.
//!
//! One unbounded queue and one consumer task per subscribed topic; the
//! handler is awaited per message, so a slow handler (or a full worker
//! queue behind it) pauses polling of that topic — the same backpressure
//! shape a paused vendor consumer gives. Nacked messages re-enter the
//! topic's queue with a bumped attempt counter, up to a redelivery cap.
//!
//! Every send is also recorded in an outbox, keyed by topic, so tests can
//! observe traffic on producer-only topics (DLQ, corrections).

use super::{Acker, BusConsumer, BusHandler, BusProducer, Delivery, Disposition};
use crate::engine::error::EngineError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

#[derive(Clone)]
struct Message {
    key: String,
    payload: Vec<u8>,
    attempt: u32,
}

#[derive(Default)]
struct Inner {
    handlers: HashMap<String, Arc<dyn BusHandler>>,
    senders: HashMap<String, mpsc::UnboundedSender<Message>>,
    outbox: HashMap<String, Vec<(String, Vec<u8>)>>,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
    max_deliveries: u32,
}

impl MemoryBus {
    pub fn new(max_deliveries: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            max_deliveries: max_deliveries.max(1),
        }
    }

    /// Everything sent to `topic` since construction, in send order.
    pub fn published(&self, topic: &str) -> Vec<(String, Vec<u8>)> {
        self.inner
            .lock()
            .outbox
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn published_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .outbox
            .get(topic)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BusProducer for MemoryBus {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        inner
            .outbox
            .entry(topic.to_string())
            .or_default()
            .push((key.to_string(), payload.clone()));
        if let Some(sender) = inner.senders.get(topic) {
            sender
                .send(Message {
                    key: key.to_string(),
                    payload,
                    attempt: 1,
                })
                .map_err(|_| EngineError::Transient(format!("topic {} is stopped", topic)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl BusConsumer for MemoryBus {
    fn subscribe(&self, topic: &str, handler: Arc<dyn BusHandler>) {
        let mut inner = self.inner.lock();
        if inner.started {
            warn!(topic, "subscribe after start is ignored");
            return;
        }
        inner.handlers.insert(topic.to_string(), handler);
    }

    async fn start(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if inner.started {
            return Ok(());
        }
        inner.started = true;

        let handlers: Vec<(String, Arc<dyn BusHandler>)> = inner
            .handlers
            .iter()
            .map(|(t, h)| (t.clone(), h.clone()))
            .collect();

        for (topic, handler) in handlers {
            let (sender, mut receiver) = mpsc::unbounded_channel::<Message>();
            inner.senders.insert(topic.clone(), sender.clone());

            let max_deliveries = self.max_deliveries;
            let task = tokio::spawn(async move {
                while let Some(message) = receiver.recv().await {
                    let delivery = make_delivery(
                        &topic,
                        message,
                        sender.clone(),
                        max_deliveries,
                    );
                    handler.handle(delivery).await;
                }
            });
            inner.tasks.push(task);
        }
        Ok(())
    }

    async fn stop(&self) {
        let tasks = {
            let mut inner = self.inner.lock();
            inner.senders.clear();
            std::mem::take(&mut inner.tasks)
        };
        for task in tasks {
            task.abort();
        }
    }
}

fn make_delivery(
    topic: &str,
    message: Message,
    requeue: mpsc::UnboundedSender<Message>,
    max_deliveries: u32,
) -> Delivery {
    let topic_name = topic.to_string();
    let redeliver = message.clone();
    let attempt = message.attempt;
    let acker = Acker::new(move |disposition| {
        if disposition == Disposition::Ack {
            return;
        }
        if redeliver.attempt >= max_deliveries {
            error!(
                topic = %topic_name,
                key = %redeliver.key,
                attempts = redeliver.attempt,
                "delivery exhausted redelivery budget; dropping"
            );
            return;
        }
        let _ = requeue.send(Message {
            attempt: redeliver.attempt + 1,
            ..redeliver
        });
    });
    Delivery {
        topic: topic.to_string(),
        key: message.key,
        payload: message.payload,
        attempt,
        acker,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct CountingHandler {
        seen: AtomicU32,
        nack_first: u32,
    }

    #[async_trait]
    impl BusHandler for CountingHandler {
        async fn handle(&self, delivery: Delivery) {
            let n = self.seen.fetch_add(1, Ordering::SeqCst);
            if n < self.nack_first {
                delivery.acker.nack();
            } else {
                delivery.acker.ack();
            }
        }
    }

    #[tokio::test]
    async fn delivers_in_send_order() {
        let bus = Arc::new(MemoryBus::new(3));
        let seen = Arc::new(Mutex::new(Vec::new()));

        struct Recorder(Arc<Mutex<Vec<String>>>);
        #[async_trait]
        impl BusHandler for Recorder {
            async fn handle(&self, delivery: Delivery) {
                self.0.lock().push(delivery.key.clone());
                delivery.acker.ack();
            }
        }

        bus.subscribe("t", Arc::new(Recorder(seen.clone())));
        bus.start().await.unwrap();
        for i in 0..5 {
            bus.send("t", &format!("k{}", i), vec![i]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *seen.lock(),
            vec!["k0", "k1", "k2", "k3", "k4"]
        );
        bus.stop().await;
    }

    #[tokio::test]
    async fn nack_redelivers_until_cap() {
        let bus = Arc::new(MemoryBus::new(3));
        let handler = Arc::new(CountingHandler {
            seen: AtomicU32::new(0),
            nack_first: u32::MAX,
        });
        bus.subscribe("t", handler.clone());
        bus.start().await.unwrap();
        bus.send("t", "k", vec![]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Exactly max_deliveries attempts, then dropped.
        assert_eq!(handler.seen.load(Ordering::SeqCst), 3);
        bus.stop().await;
    }

    #[tokio::test]
    async fn dropped_delivery_counts_as_nack() {
        let bus = Arc::new(MemoryBus::new(2));

        struct Dropper(AtomicU32);
        #[async_trait]
        impl BusHandler for Dropper {
            async fn handle(&self, delivery: Delivery) {
                self.0.fetch_add(1, Ordering::SeqCst);
                drop(delivery); // never settled explicitly
            }
        }

        let handler = Arc::new(Dropper(AtomicU32::new(0)));
        bus.subscribe("t", handler.clone());
        bus.start().await.unwrap();
        bus.send("t", "k", vec![]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.0.load(Ordering::SeqCst), 2);
        bus.stop().await;
    }

    #[tokio::test]
    async fn producer_only_topics_land_in_outbox() {
        let bus = MemoryBus::new(3);
        bus.send("dlq", "k1", b"bad".to_vec()).await.unwrap();
        assert_eq!(bus.published_count("dlq"), 1);
        assert_eq!(bus.published("dlq")[0].0, "k1");
    }
}
