//! In-process broker for tests
//!
//! Implements the [`Transport`] contract against a shared, purely in-memory
//! exchange/queue table. Topic bindings use the same wildcard semantics as
//! the real broker by reusing [`TopicPattern`], so multiple [`Services`]
//! wired to one [`MemoryBroker`] behave like services on a shared AMQP
//! broker, minus the network.
//!
//! [`Services`]: crate::Service

use super::{DeliveryStream, QueueOptions, Transport};
use crate::envelope::Envelope;
use crate::error::{ConnectionError, ConsumeError, PublishError};
use crate::topic::{Topic, TopicPattern};
use crate::EmptyResult;
use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Clone, Copy, PartialEq, Eq)]
enum ExchangeKind {
    Direct,
    Topic,
}

struct QueueState {
    options: QueueOptions,
    sender: mpsc::UnboundedSender<Envelope>,
    /// Taken by the first consumer
    receiver: Option<mpsc::UnboundedReceiver<Envelope>>,
}

struct Binding {
    exchange: String,
    key: String,
    queue: String,
}

impl Binding {
    fn matches(&self, exchange: &str, kind: ExchangeKind, routing_key: &str) -> bool {
        if self.exchange != exchange {
            return false;
        }

        match kind {
            ExchangeKind::Direct => self.key == routing_key,
            ExchangeKind::Topic => TopicPattern::from_routing_key(&self.key)
                .matches(&Topic::from_routing_key(routing_key)),
        }
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
}

/// Shared in-memory stand-in for the external broker
///
/// Cloning is cheap, all clones refer to the same exchange/queue table.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Creates an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new connection to this broker
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            state: self.state.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            declared: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// One simulated connection to a [`MemoryBroker`]
pub struct MemoryTransport {
    state: Arc<Mutex<BrokerState>>,
    closed: Arc<AtomicBool>,
    /// Queues declared over this connection, for auto-delete on shutdown
    declared: Arc<Mutex<Vec<String>>>,
}

impl MemoryTransport {
    fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().unwrap();

        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(ConnectionError::Setup(
                format!("exchange {} already declared with a different kind", name).into(),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_owned(), kind);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_topic_exchange(&self, name: &str) -> Result<(), ConnectionError> {
        self.declare_exchange(name, ExchangeKind::Topic)
    }

    async fn declare_direct_exchange(&self, name: &str) -> Result<(), ConnectionError> {
        self.declare_exchange(name, ExchangeKind::Direct)
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().unwrap();

        if !state.queues.contains_key(name) {
            let (sender, receiver) = mpsc::unbounded_channel();
            state.queues.insert(
                name.to_owned(),
                QueueState {
                    options,
                    sender,
                    receiver: Some(receiver),
                },
            );
        }

        self.declared.lock().unwrap().push(name.to_owned());
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().unwrap();

        if !state.queues.contains_key(queue) {
            return Err(ConnectionError::Setup(
                format!("cannot bind undeclared queue {}", queue).into(),
            ));
        }

        let duplicate = state.bindings.iter().any(|binding| {
            binding.queue == queue && binding.exchange == exchange && binding.key == routing_key
        });

        if !duplicate {
            state.bindings.push(Binding {
                exchange: exchange.to_owned(),
                key: routing_key.to_owned(),
                queue: queue.to_owned(),
            });
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), PublishError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PublishError::ChannelClosed);
        }

        let state = self.state.lock().unwrap();

        let kind = *state
            .exchanges
            .get(exchange)
            .ok_or_else(|| PublishError::Delivery(format!("unknown exchange {}", exchange).into()))?;

        // A queue reachable through multiple matching bindings still receives
        // the message exactly once, like on a real topic exchange.
        let targets: HashSet<&str> = state
            .bindings
            .iter()
            .filter(|binding| binding.matches(exchange, kind, routing_key))
            .map(|binding| binding.queue.as_str())
            .collect();

        for queue in targets {
            if let Some(queue_state) = state.queues.get(queue) {
                // A send error means the consumer is gone, the message is
                // simply dropped like on an expired queue.
                queue_state.sender.send(envelope.clone()).ok();
            }
        }

        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, ConsumeError> {
        let receiver = {
            let mut state = self.state.lock().unwrap();

            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| ConsumeError::Subscribe {
                    queue: queue.to_owned(),
                    source: "queue has not been declared".into(),
                })?;

            queue_state
                .receiver
                .take()
                .ok_or_else(|| ConsumeError::Subscribe {
                    queue: queue.to_owned(),
                    source: "queue is already being consumed".into(),
                })?
        };

        let stream = stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|envelope| (Ok(envelope), receiver))
        });

        Ok(stream.boxed())
    }

    async fn shutdown(&self) -> EmptyResult {
        self.closed.store(true, Ordering::SeqCst);

        let declared = std::mem::take(&mut *self.declared.lock().unwrap());
        let mut state = self.state.lock().unwrap();

        for name in declared {
            let delete = state
                .queues
                .get(&name)
                .map(|queue| queue.options.exclusive || queue.options.auto_delete)
                .unwrap_or(false);

            if delete {
                debug!("Deleting queue {} on connection shutdown", name);
                state.queues.remove(&name);
                state.bindings.retain(|binding| binding.queue != name);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::envelope::Headers;
    use pretty_assertions::assert_eq;

    fn event(path: &str) -> Envelope {
        Envelope::event(Topic::new(path), b"payload".to_vec(), Headers::new())
    }

    async fn next_path(stream: &mut DeliveryStream) -> String {
        stream.next().await.unwrap().unwrap().path.to_string()
    }

    #[tokio::test]
    async fn route_topic_publishes_to_matching_queues() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();

        transport.declare_topic_exchange("events").await.unwrap();
        transport
            .declare_queue("observer", QueueOptions::durable())
            .await
            .unwrap();
        transport
            .bind_queue("observer", "events", "user.*.created")
            .await
            .unwrap();

        transport
            .publish("events", "user.42.created", &event("/user/42/created"))
            .await
            .unwrap();
        transport
            .publish("events", "user.42.deleted", &event("/user/42/deleted"))
            .await
            .unwrap();
        transport
            .publish("events", "user.43.created", &event("/user/43/created"))
            .await
            .unwrap();

        let mut stream = transport.consume("observer").await.unwrap();
        assert_eq!(next_path(&mut stream).await, "/user/42/created");
        assert_eq!(next_path(&mut stream).await, "/user/43/created");
    }

    #[tokio::test]
    async fn deliver_once_despite_overlapping_bindings() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();

        transport.declare_topic_exchange("events").await.unwrap();
        transport
            .declare_queue("observer", QueueOptions::durable())
            .await
            .unwrap();
        transport
            .bind_queue("observer", "events", "user.#")
            .await
            .unwrap();
        transport
            .bind_queue("observer", "events", "user.*.created")
            .await
            .unwrap();

        transport
            .publish("events", "user.42.created", &event("/user/42/created"))
            .await
            .unwrap();
        transport
            .publish("events", "user.42.deleted", &event("/user/42/deleted"))
            .await
            .unwrap();

        let mut stream = transport.consume("observer").await.unwrap();
        assert_eq!(next_path(&mut stream).await, "/user/42/created");
        assert_eq!(next_path(&mut stream).await, "/user/42/deleted");
    }

    #[tokio::test]
    async fn match_direct_routing_keys_exactly() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();

        transport.declare_direct_exchange("rpc").await.unwrap();
        transport
            .declare_queue("auth", QueueOptions::durable())
            .await
            .unwrap();
        transport.bind_queue("auth", "rpc", "auth").await.unwrap();

        transport
            .publish("rpc", "auth", &event("/login"))
            .await
            .unwrap();
        transport
            .publish("rpc", "auth.something", &event("/other"))
            .await
            .unwrap();

        let mut stream = transport.consume("auth").await.unwrap();
        assert_eq!(next_path(&mut stream).await, "/login");
    }

    #[tokio::test]
    async fn delete_private_queues_on_shutdown() {
        let broker = MemoryBroker::new();
        let replier = broker.transport();
        let observer = broker.transport();

        replier.declare_direct_exchange("rpc").await.unwrap();
        replier
            .declare_queue("replies", QueueOptions::private())
            .await
            .unwrap();
        replier
            .bind_queue("replies", "rpc", "replies")
            .await
            .unwrap();

        replier.shutdown().await.unwrap();

        // Late replies into the deleted queue go nowhere but do not fail the sender
        observer
            .publish("rpc", "replies", &event("/late"))
            .await
            .unwrap();

        assert!(matches!(
            observer.consume("replies").await,
            Err(ConsumeError::Subscribe { .. })
        ));
        assert!(matches!(
            replier.publish("rpc", "replies", &event("/late")).await,
            Err(PublishError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn hand_each_queue_to_one_consumer_only() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();

        transport
            .declare_queue("work", QueueOptions::durable())
            .await
            .unwrap();

        let _stream = transport.consume("work").await.unwrap();
        assert!(matches!(
            transport.consume("work").await,
            Err(ConsumeError::Subscribe { .. })
        ));
    }
}
