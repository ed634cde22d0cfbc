//! Thin adapter over the external message broker
//!
//! The [`Transport`] trait is the only seam through which the upper layers
//! talk to the broker. It is intentionally minimal: idempotent topology
//! setup, raw envelope publish, and a stream of decoded inbound envelopes
//! per consumed queue. Delivery semantics, persistence and clustering remain
//! the broker's business.
//!
//! Two implementations are provided: [`AmqpTransport`] for production use
//! against an AMQP broker, and [`MemoryBroker`]/[`MemoryTransport`] which
//! keep everything in-process for tests.

mod amqp;
mod memory;

pub use amqp::AmqpTransport;
pub use memory::{MemoryBroker, MemoryTransport};

use crate::envelope::Envelope;
use crate::error::{ConnectionError, ConsumeError, PublishError};
use crate::EmptyResult;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of decoded inbound deliveries for a single queue
pub type DeliveryStream = BoxStream<'static, Result<Envelope, ConsumeError>>;

/// Declaration options for a queue
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueOptions {
    /// Queue survives broker restarts
    pub durable: bool,
    /// Queue belongs to this connection only
    pub exclusive: bool,
    /// Queue is deleted once its last consumer disconnects
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Options for a durable, shared work queue
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    /// Options for a private, self-cleaning reply queue
    pub fn private() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Abstract send/receive capability over one broker connection
///
/// Implementations own exactly one connection and channel per service
/// instance. All setup calls are idempotent so that any number of services
/// may declare the shared topology concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares a topic exchange, creating it if it does not exist yet
    async fn declare_topic_exchange(&self, name: &str) -> Result<(), ConnectionError>;

    /// Declares a direct exchange, creating it if it does not exist yet
    async fn declare_direct_exchange(&self, name: &str) -> Result<(), ConnectionError>;

    /// Declares a queue with the given options
    async fn declare_queue(&self, name: &str, options: QueueOptions)
        -> Result<(), ConnectionError>;

    /// Binds a queue to an exchange under a routing key
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ConnectionError>;

    /// Publishes an envelope to an exchange under a routing key
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), PublishError>;

    /// Starts consuming a queue, yielding decoded envelopes in delivery order
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, ConsumeError>;

    /// Releases the channel and connection
    ///
    /// Safe to call while deliveries are still being processed, the
    /// associated streams simply end.
    async fn shutdown(&self) -> EmptyResult;
}
