//! An in-process message bus with broker semantics.
//!
//! The workers in this daemon cooperate exclusively through this bus; no
//! worker calls another directly. The bus keeps the semantics of a durable
//! broker: exchanges with queue bindings, per-message acknowledge /
//! reject(requeue) / reject(drop), a redelivery count, and per-message
//! expiration. Consumers run on their own tasks so the registering
//! component is never blocked, and a handler failure never terminates the
//! consumer loop.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::events::CommandTag;
use crate::api::subject::Timestamp;
use crate::commons::error::Error;
use crate::commons::WardResult;
use crate::constants::CONTENT_TYPE_JSON;

//------------ ExchangeKind --------------------------------------------------

/// The routing behaviour of an exchange. Only direct exchanges are used.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExchangeKind {
    /// Deliver to every queue bound with a key equal to the routing key.
    Direct,
}

//------------ QueueOptions --------------------------------------------------

/// Options applied when declaring a queue.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueOptions {
    /// Default time-to-live applied to messages enqueued without their
    /// own expiration. Used on the renew queue so stale renewal requests
    /// expire instead of being retried forever.
    pub message_ttl_secs: Option<i64>,
}

impl QueueOptions {
    pub fn with_ttl_secs(secs: i64) -> Self {
        QueueOptions {
            message_ttl_secs: Some(secs),
        }
    }
}

//------------ Message -------------------------------------------------------

/// The envelope and body published on the bus.
#[derive(Clone, Debug)]
pub struct Message {
    pub content_type: String,
    /// Command tag for single-queue multi-purpose consumers.
    pub kind: Option<CommandTag>,
    /// The reply queue name for RPC-over-queue requests.
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    /// Absolute expiry; expired messages are discarded at delivery.
    pub expiration: Option<Timestamp>,
    pub body: serde_json::Value,
}

impl Message {
    /// Creates a message with a JSON body and no envelope extras.
    pub fn json<T: Serialize>(body: &T) -> WardResult<Self> {
        Ok(Message {
            content_type: CONTENT_TYPE_JSON.to_string(),
            kind: None,
            reply_to: None,
            correlation_id: None,
            expiration: None,
            body: serde_json::to_value(body)?,
        })
    }

    pub fn with_kind(mut self, kind: CommandTag) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_expiration(mut self, expiration: Timestamp) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Deserializes the body, mapping failure to a JSON error the caller
    /// should treat as a permanent (reject without requeue) condition.
    pub fn parse<T: DeserializeOwned>(&self) -> WardResult<T> {
        serde_json::from_value(self.body.clone()).map_err(Error::from)
    }

    fn is_expired(&self) -> bool {
        match self.expiration {
            Some(exp) => Timestamp::now() > exp,
            None => false,
        }
    }
}

//------------ Delivery ------------------------------------------------------

/// A message as handed to a consumer.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub message: Message,
    /// How often this message was delivered before, i.e. 0 on first
    /// delivery.
    pub redelivered: u32,
}

//------------ Disposition ---------------------------------------------------

/// What a handler decided about a delivery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// Fully processed.
    Ack,

    /// Transient failure. The broker redelivers, possibly much later.
    Requeue,

    /// Malformed or unprocessable. Requeuing a message that can never
    /// succeed causes an infinite redelivery loop, so it is dropped.
    Drop,

    /// Stop consuming this queue. Only reply-queue consumers use this,
    /// after the stream-termination sentinel.
    Stop,
}

//------------ MessageBus ----------------------------------------------------

struct Exchange {
    kind: ExchangeKind,
    /// (routing key, queue name)
    bindings: Vec<(String, String)>,
}

struct QueueEntry {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
    options: QueueOptions,
}

#[derive(Default)]
struct BusInner {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, QueueEntry>,
}

/// The broker: topology, publishing and consumer registration.
///
/// Cheap to share; all methods take `&self`. Declared topology is
/// idempotent so every worker can declare what it needs at startup.
#[derive(Default)]
pub struct MessageBus {
    inner: Mutex<BusInner>,
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("MessageBus")
    }
}

impl MessageBus {
    pub fn new() -> Arc<Self> {
        Arc::new(MessageBus::default())
    }

    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> WardResult<()> {
        let mut inner = self.lock();
        inner.exchanges.entry(name.to_string()).or_insert(Exchange {
            kind,
            bindings: Vec::new(),
        });
        Ok(())
    }

    pub fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> WardResult<()> {
        let mut inner = self.lock();
        inner.queues.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            QueueEntry {
                tx,
                rx: Some(rx),
                options,
            }
        });
        Ok(())
    }

    pub fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> WardResult<()> {
        let mut inner = self.lock();
        if !inner.queues.contains_key(queue) {
            return Err(Error::bus(format!("queue '{queue}' not declared")));
        }
        let ex = inner.exchanges.get_mut(exchange).ok_or_else(|| {
            Error::bus(format!("exchange '{exchange}' not declared"))
        })?;
        let binding = (routing_key.to_string(), queue.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    /// Removes a queue. Its consumer, if any, stops once it has drained
    /// deliveries already in flight. Used for ephemeral reply queues.
    pub fn delete_queue(&self, name: &str) {
        let mut inner = self.lock();
        inner.queues.remove(name);
        for ex in inner.exchanges.values_mut() {
            ex.bindings.retain(|(_, queue)| queue != name);
        }
    }

    /// Publishes a message. Fire-and-forget: the returned error means the
    /// message was not routed to any queue; the caller logs it or retries
    /// on its next scheduler tick.
    ///
    /// The empty exchange name addresses a queue directly by routing key.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> WardResult<()> {
        let inner = self.lock();

        if exchange.is_empty() {
            let entry = inner.queues.get(routing_key).ok_or_else(|| {
                Error::bus(format!("queue '{routing_key}' not declared"))
            })?;
            return Self::enqueue(entry, message, routing_key);
        }

        let ex = inner.exchanges.get(exchange).ok_or_else(|| {
            Error::bus(format!("exchange '{exchange}' not declared"))
        })?;

        let targets: Vec<&str> = match ex.kind {
            ExchangeKind::Direct => ex
                .bindings
                .iter()
                .filter(|(key, _)| key == routing_key)
                .map(|(_, queue)| queue.as_str())
                .collect(),
        };

        if targets.is_empty() {
            return Err(Error::bus(format!(
                "message for '{exchange}/{routing_key}' is unroutable"
            )));
        }

        for name in targets {
            if let Some(entry) = inner.queues.get(name) {
                Self::enqueue(entry, message.clone(), name)?;
            }
        }
        Ok(())
    }

    fn enqueue(
        entry: &QueueEntry,
        mut message: Message,
        queue: &str,
    ) -> WardResult<()> {
        if message.expiration.is_none() {
            if let Some(ttl) = entry.options.message_ttl_secs {
                message.expiration = Some(Timestamp::now_plus_seconds(ttl));
            }
        }
        entry
            .tx
            .send(Delivery {
                message,
                redelivered: 0,
            })
            .map_err(|_| Error::bus(format!("queue '{queue}' is gone")))
    }

    /// Registers a consumer on a queue.
    ///
    /// The handler runs once per delivered message on a dedicated task and
    /// returns the message's [`Disposition`]. A handler that panics drops
    /// its message; the loop keeps consuming. Consuming ends when the
    /// handler returns [`Disposition::Stop`] or the queue is deleted. A
    /// queue supports one consumer at a time.
    pub fn consume<F, Fut>(
        self: &Arc<Self>,
        queue: &str,
        handler: F,
    ) -> WardResult<JoinHandle<()>>
    where
        F: Fn(Delivery) -> Fut + Send + 'static,
        Fut: Future<Output = Disposition> + Send + 'static,
    {
        let mut rx = {
            let mut inner = self.lock();
            let entry = inner.queues.get_mut(queue).ok_or_else(|| {
                Error::bus(format!("queue '{queue}' not declared"))
            })?;
            entry.rx.take().ok_or_else(|| {
                Error::bus(format!("queue '{queue}' already has a consumer"))
            })?
        };

        let bus = self.clone();
        let queue = queue.to_string();

        Ok(tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                if delivery.message.is_expired() {
                    debug!("'{queue}': discarding expired message");
                    continue;
                }

                // The handler runs on its own task so a panic poisons
                // only the message that caused it, never the loop.
                let disposition =
                    match tokio::spawn(handler(delivery.clone())).await {
                        Ok(disposition) => disposition,
                        Err(e) => {
                            warn!("'{queue}': handler failed: {e}");
                            Disposition::Drop
                        }
                    };

                match disposition {
                    Disposition::Ack => {}
                    Disposition::Requeue => {
                        bus.requeue(&queue, delivery);
                    }
                    Disposition::Drop => {
                        debug!("'{queue}': message dropped");
                    }
                    Disposition::Stop => break,
                }
            }
            debug!("'{queue}': consumer stopped");
        }))
    }

    fn requeue(&self, queue: &str, mut delivery: Delivery) {
        delivery.redelivered += 1;
        let inner = self.lock();
        match inner.queues.get(queue) {
            Some(entry) => {
                if entry.tx.send(delivery).is_err() {
                    warn!("'{queue}': could not requeue, queue is gone");
                }
            }
            None => warn!("'{queue}': could not requeue, queue is gone"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        // A poisoned lock means a panic while touching topology; the
        // topology itself is still consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    fn direct_topology(bus: &Arc<MessageBus>, queue: &str) {
        bus.declare_exchange("x", ExchangeKind::Direct).unwrap();
        bus.declare_queue(queue, QueueOptions::default()).unwrap();
        bus.bind_queue(queue, "x", queue).unwrap();
    }

    #[tokio::test]
    async fn ack_consumes_each_message_once() {
        let bus = MessageBus::new();
        direct_topology(&bus, "jobs");

        let seen = Arc::new(AtomicU32::new(0));
        let seen_handler = seen.clone();
        bus.consume("jobs", move |_| {
            let seen = seen_handler.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Disposition::Ack
            }
        })
        .unwrap();

        for _ in 0..3 {
            bus.publish("x", "jobs", Message::json(&()).unwrap()).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn requeue_redelivers_with_incremented_count() {
        let bus = MessageBus::new();
        direct_topology(&bus, "jobs");

        let seen = Arc::new(AtomicU32::new(0));
        let seen_handler = seen.clone();
        bus.consume("jobs", move |delivery: Delivery| {
            let seen = seen_handler.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                if delivery.redelivered < 3 {
                    Disposition::Requeue
                } else {
                    Disposition::Ack
                }
            }
        })
        .unwrap();

        bus.publish("x", "jobs", Message::json(&()).unwrap()).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn dropped_messages_are_never_redelivered() {
        let bus = MessageBus::new();
        direct_topology(&bus, "jobs");

        let seen = Arc::new(AtomicU32::new(0));
        let seen_handler = seen.clone();
        bus.consume("jobs", move |_| {
            let seen = seen_handler.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                // A malformed body can never succeed.
                Disposition::Drop
            }
        })
        .unwrap();

        bus.publish("x", "jobs", Message::json(&"not the schema").unwrap())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_messages_are_discarded_at_delivery() {
        let bus = MessageBus::new();
        bus.declare_exchange("x", ExchangeKind::Direct).unwrap();
        bus.declare_queue("jobs", QueueOptions::with_ttl_secs(-1))
            .unwrap();
        bus.bind_queue("jobs", "x", "jobs").unwrap();

        bus.publish("x", "jobs", Message::json(&()).unwrap()).unwrap();

        let seen = Arc::new(AtomicU32::new(0));
        let seen_handler = seen.clone();
        bus.consume("jobs", move |_| {
            let seen = seen_handler.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Disposition::Ack
            }
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn a_panicking_handler_does_not_kill_the_consumer() {
        let bus = MessageBus::new();
        direct_topology(&bus, "jobs");

        let seen = Arc::new(AtomicU32::new(0));
        let seen_handler = seen.clone();
        bus.consume("jobs", move |delivery: Delivery| {
            let seen = seen_handler.clone();
            async move {
                if delivery.message.body.as_str() == Some("poison") {
                    panic!("poison message");
                }
                seen.fetch_add(1, Ordering::SeqCst);
                Disposition::Ack
            }
        })
        .unwrap();

        bus.publish("x", "jobs", Message::json(&"poison").unwrap())
            .unwrap();
        bus.publish("x", "jobs", Message::json(&"fine").unwrap())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unroutable_publish_is_an_error() {
        let bus = MessageBus::new();
        bus.declare_exchange("x", ExchangeKind::Direct).unwrap();

        assert!(
            bus.publish("x", "nowhere", Message::json(&()).unwrap())
                .is_err()
        );
    }

    #[tokio::test]
    async fn second_consumer_on_a_queue_is_refused() {
        let bus = MessageBus::new();
        direct_topology(&bus, "jobs");

        bus.consume("jobs", |_| async { Disposition::Ack }).unwrap();
        assert!(bus.consume("jobs", |_| async { Disposition::Ack }).is_err());
    }

    #[tokio::test]
    async fn deleting_a_queue_stops_its_consumer() {
        let bus = MessageBus::new();
        direct_topology(&bus, "jobs");

        let handle =
            bus.consume("jobs", |_| async { Disposition::Ack }).unwrap();
        bus.delete_queue("jobs");

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("consumer should stop when its queue is deleted")
            .unwrap();
    }
}
