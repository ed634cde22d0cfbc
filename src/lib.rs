//! Communication layer for services in a distributed system
//!
//! In general, there are two modes of operation:
//!
//! 1. Publish and subscribe
//! 2. Command and response
//!
//! The first is used for event notifications which make up the event-driven
//! architecture. Whenever something noteworthy happens in a service, it may
//! publish an event to a hierarchical [`Topic`]. Every interested party can
//! subscribe with a wildcard-capable [`TopicPattern`] and react to matching
//! events. Delivery is fire-and-forget, no replies are involved.
//!
//! The second mode layers point-to-point calls on top of the same broker.
//! A [`Service`] may [`call`](Service::call) a command on another service by
//! name. Under the hood this publishes an [`Envelope`] carrying a unique
//! correlation identifier and a private reply-to address, then suspends the
//! calling task until a correlated reply arrives or a local deadline fires.
//! On the serving side, registered route handlers are dispatched concurrently
//! and their results (or failures) are sent back to the caller's reply queue.
//!
//! The broker itself is an external collaborator. All interaction with it
//! goes through the [`Transport`](transport::Transport) trait, with an
//! AMQP implementation for production use and an in-process one for tests.

#![deny(missing_docs)]

pub mod constants;
pub mod envelope;
pub mod error;
pub mod service;
pub mod topic;
pub mod transport;

mod rpc;

pub use envelope::{CorrelationId, Envelope, Headers};
pub use error::{CallError, ConnectionError, ConsumeError, PublishError, RemoteFault};
pub use service::{event_fn, route_fn, EventHandler, RouteHandler, Service, ServiceBuilder};
pub use topic::{Topic, TopicPattern};

/// Generic error type
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result with no value and a [`BoxedError`]
pub type EmptyResult = Result<(), BoxedError>;
