//! Named participant in the service network
//!
//! A [`Service`] is defined through its [`ServiceBuilder`]: handlers for
//! events ([`subscribe`](ServiceBuilder::subscribe)) and commands
//! ([`route`](ServiceBuilder::route)) are registered up front, then
//! [`connect`](ServiceBuilder::connect) wires the service to a broker and
//! starts its receive loops. The handler set of a running service is
//! immutable.
//!
//! Three queues are consumed per service instance: the shared command queue
//! addressed by service name, a private reply queue for call resolution, and
//! an event queue bound once per subscription pattern. Every handler
//! invocation runs on its own task so a slow handler never blocks delivery
//! of subsequent messages. Dispatch follows broker delivery order per queue,
//! handler completion order is unspecified.

use crate::constants::{self, EVENT_EXCHANGE, RPC_EXCHANGE};
use crate::envelope::{Envelope, Headers};
use crate::error::{CallError, ConnectionError, PublishError, RemoteFault};
use crate::rpc::PendingCalls;
use crate::topic::{Topic, TopicPattern};
use crate::transport::{DeliveryStream, QueueOptions, Transport};
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

/// Handler invoked for every event delivery matching its subscription pattern
///
/// The return value only feeds the observability sink: a returned error is
/// logged at the dispatch boundary and never propagates to the receive loop
/// or to other handlers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Processes one event delivery
    async fn handle(&self, path: Topic, headers: Headers, body: Vec<u8>) -> EmptyResult;
}

/// Handler invoked for commands addressed to its registered path
///
/// The returned body becomes the reply to the caller. A returned error is
/// still answered, as a fault reply, so the caller surfaces
/// [`CallError::Remote`] instead of timing out needlessly.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    /// Processes one command and produces the reply body
    async fn handle(&self, path: Topic, headers: Headers, body: Vec<u8>)
        -> Result<Vec<u8>, BoxedError>;
}

/// Wraps an async closure as an [`EventHandler`]
pub fn event_fn<F, Fut>(f: F) -> EventFn<F>
where
    F: Fn(Topic, Headers, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = EmptyResult> + Send + 'static,
{
    EventFn(f)
}

/// [`EventHandler`] implementation for plain async closures
pub struct EventFn<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for EventFn<F>
where
    F: Fn(Topic, Headers, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = EmptyResult> + Send + 'static,
{
    async fn handle(&self, path: Topic, headers: Headers, body: Vec<u8>) -> EmptyResult {
        (self.0)(path, headers, body).await
    }
}

/// Wraps an async closure as a [`RouteHandler`]
pub fn route_fn<F, Fut>(f: F) -> RouteFn<F>
where
    F: Fn(Topic, Headers, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>, BoxedError>> + Send + 'static,
{
    RouteFn(f)
}

/// [`RouteHandler`] implementation for plain async closures
pub struct RouteFn<F>(F);

#[async_trait]
impl<F, Fut> RouteHandler for RouteFn<F>
where
    F: Fn(Topic, Headers, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>, BoxedError>> + Send + 'static,
{
    async fn handle(
        &self,
        path: Topic,
        headers: Headers,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, BoxedError> {
        (self.0)(path, headers, body).await
    }
}

/// Definition of a service before it is connected to a broker
pub struct ServiceBuilder {
    name: String,
    subscriptions: Vec<(TopicPattern, Arc<dyn EventHandler>)>,
    routes: HashMap<Topic, Arc<dyn RouteHandler>>,
}

impl ServiceBuilder {
    /// Registers a handler for events matching the given wildcard pattern
    ///
    /// Multiple overlapping patterns may be registered, a matching event
    /// invokes every matching handler exactly once.
    pub fn subscribe<H>(mut self, pattern: &str, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        self.subscriptions
            .push((TopicPattern::new(pattern), Arc::new(handler)));
        self
    }

    /// Registers a handler for commands addressed to the given exact path
    ///
    /// # Panics
    /// Panics when a handler is already registered for this path, which is
    /// always a programming error in the service definition.
    pub fn route<H>(mut self, path: &str, handler: H) -> Self
    where
        H: RouteHandler + 'static,
    {
        let path = Topic::new(path);

        if self.routes.insert(path.clone(), Arc::new(handler)).is_some() {
            panic!("route for path {} is already registered", path);
        }

        self
    }

    /// Connects the service to a broker and starts processing deliveries
    ///
    /// Declares the shared exchanges, the service's command and event
    /// queues, and a private auto-deleted reply queue, binds one event
    /// binding per subscription pattern and spawns the receive loops.
    pub async fn connect<T>(self, transport: T) -> Result<Service, ConnectionError>
    where
        T: Transport + 'static,
    {
        let transport: Arc<dyn Transport> = Arc::new(transport);

        transport.declare_direct_exchange(RPC_EXCHANGE).await?;
        transport.declare_topic_exchange(EVENT_EXCHANGE).await?;

        let command_queue = constants::command_queue(&self.name);
        transport
            .declare_queue(&command_queue, QueueOptions::durable())
            .await?;
        transport
            .bind_queue(&command_queue, RPC_EXCHANGE, &command_queue)
            .await?;

        let reply_queue = constants::reply_queue(&self.name);
        transport
            .declare_queue(&reply_queue, QueueOptions::private())
            .await?;
        transport
            .bind_queue(&reply_queue, RPC_EXCHANGE, &reply_queue)
            .await?;

        let event_queue = constants::event_queue(&self.name);
        transport
            .declare_queue(&event_queue, QueueOptions::durable())
            .await?;
        for (pattern, _) in &self.subscriptions {
            transport
                .bind_queue(&event_queue, EVENT_EXCHANGE, &pattern.routing_key())
                .await?;
            debug!("[{}] Subscribed to {}", self.name, pattern);
        }

        let into_setup = |e| ConnectionError::Setup(Box::new(e));
        let commands = transport.consume(&command_queue).await.map_err(into_setup)?;
        let replies = transport.consume(&reply_queue).await.map_err(into_setup)?;
        let events = transport.consume(&event_queue).await.map_err(into_setup)?;

        debug!("[{}] Connected, receiving replies on {}", self.name, reply_queue);

        let inner = Arc::new(ServiceInner {
            name: self.name,
            reply_queue,
            transport,
            routes: self.routes,
            subscriptions: self.subscriptions,
            calls: PendingCalls::default(),
        });

        let loops = vec![
            tokio::spawn(command_loop(inner.clone(), commands)),
            tokio::spawn(reply_loop(inner.clone(), replies)),
            tokio::spawn(event_loop(inner.clone(), events)),
        ];

        Ok(Service {
            inner,
            loops: Mutex::new(loops),
        })
    }
}

struct ServiceInner {
    name: String,
    reply_queue: String,
    transport: Arc<dyn Transport>,
    routes: HashMap<Topic, Arc<dyn RouteHandler>>,
    subscriptions: Vec<(TopicPattern, Arc<dyn EventHandler>)>,
    calls: PendingCalls,
}

/// Running participant in the service network
pub struct Service {
    inner: Arc<ServiceInner>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    /// Starts the definition of a new service with the given name
    pub fn builder(name: &str) -> ServiceBuilder {
        ServiceBuilder {
            name: name.to_owned(),
            subscriptions: Vec::new(),
            routes: HashMap::new(),
        }
    }

    /// Name under which this service receives commands
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of calls currently awaiting a reply
    pub fn outstanding_calls(&self) -> usize {
        self.inner.calls.outstanding()
    }

    /// Publishes a fire-and-forget event
    ///
    /// The only side effect is the broker send, no acknowledgment from any
    /// subscriber is awaited.
    pub async fn publish(
        &self,
        path: &str,
        body: Vec<u8>,
        headers: Headers,
    ) -> Result<(), PublishError> {
        let topic = Topic::new(path);
        let routing_key = topic.routing_key();
        let envelope = Envelope::event(topic, body, headers);

        debug!("[{}] Publishing event {}", self.inner.name, envelope.path);
        self.inner
            .transport
            .publish(EVENT_EXCHANGE, &routing_key, &envelope)
            .await
    }

    /// Calls a command on the target service and awaits its reply
    ///
    /// Suspends only the calling task, exactly at the wait on the pending
    /// call's result slot. The deadline is enforced locally: even if the
    /// broker never delivers a reply, the call resolves to
    /// [`CallError::Timeout`] once `timeout` has elapsed. Should a reply and
    /// the deadline race, whichever transition is applied first wins and the
    /// other becomes a no-op.
    pub async fn call(
        &self,
        target: &str,
        path: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, CallError> {
        let (id, mut slot) = self.inner.calls.register();
        let envelope = Envelope::request(
            Topic::new(path),
            body,
            id.clone(),
            self.inner.reply_queue.clone(),
        );

        if let Err(e) = self
            .inner
            .transport
            .publish(RPC_EXCHANGE, target, &envelope)
            .await
        {
            self.inner.calls.abandon(&id);
            return Err(CallError::Connection(Box::new(e)));
        }

        debug!(
            "[{}] Sent command {} to {}, awaiting reply as {}",
            self.inner.name, envelope.path, target, id
        );

        match time::timeout(timeout, &mut slot).await {
            Ok(Ok(Ok(body))) => Ok(body),
            Ok(Ok(Err(fault))) => Err(CallError::Remote(fault)),
            Ok(Err(_closed)) => Err(CallError::Connection(
                "connection closed while awaiting reply".into(),
            )),
            Err(_elapsed) => {
                if self.inner.calls.abandon(&id) {
                    warn!(
                        "[{}] No reply for {} within {:?}",
                        self.inner.name, id, timeout
                    );
                    Err(CallError::Timeout(timeout))
                } else {
                    // A reply won the race right at the deadline, take it
                    match slot.await {
                        Ok(Ok(body)) => Ok(body),
                        Ok(Err(fault)) => Err(CallError::Remote(fault)),
                        Err(_closed) => Err(CallError::Connection(
                            "connection closed while awaiting reply".into(),
                        )),
                    }
                }
            }
        }
    }

    /// Sends a command to the target service without expecting a reply
    ///
    /// The remote handler runs normally, its result is discarded on the
    /// serving side.
    pub async fn cast(&self, target: &str, path: &str, body: Vec<u8>) -> Result<(), PublishError> {
        let envelope = Envelope::command(Topic::new(path), body);

        debug!(
            "[{}] Sent command {} to {} without expecting a reply",
            self.inner.name, envelope.path, target
        );
        self.inner
            .transport
            .publish(RPC_EXCHANGE, target, &envelope)
            .await
    }

    /// Stops the receive loops, fails all outstanding calls and releases the
    /// broker connection
    ///
    /// Waiting callers observe [`CallError::Connection`] instead of hanging
    /// past teardown. Handlers already in flight run to completion, replies
    /// they produce after the connection is gone are logged and dropped.
    pub async fn shutdown(&self) -> EmptyResult {
        debug!("[{}] Shutting down", self.inner.name);

        for task in self.loops.lock().unwrap().drain(..) {
            task.abort();
        }

        self.inner.calls.fail_all();
        self.inner.transport.shutdown().await
    }
}

async fn command_loop(inner: Arc<ServiceInner>, mut deliveries: DeliveryStream) {
    while let Some(delivery) = deliveries.next().await {
        match delivery {
            Ok(envelope) => dispatch_command(&inner, envelope),
            Err(e) => warn!("[{}] Failed to receive command: {}", inner.name, e),
        }
    }

    debug!("[{}] Command stream ended", inner.name);
}

/// Runs the route handler for one command on its own task and replies
///
/// Commands for unregistered paths are dropped, the caller runs into its
/// local deadline instead of receiving a protocol-level rejection.
fn dispatch_command(inner: &Arc<ServiceInner>, envelope: Envelope) {
    let handler = match inner.routes.get(&envelope.path) {
        Some(handler) => handler.clone(),
        None => {
            warn!(
                "[{}] No route for path {} registered, dropping command",
                inner.name, envelope.path
            );
            return;
        }
    };

    let inner = inner.clone();
    tokio::spawn(async move {
        let Envelope {
            path,
            headers,
            body,
            correlation_id,
            reply_to,
            ..
        } = envelope;

        let outcome = handler.handle(path.clone(), headers, body).await;

        let reply_to = match reply_to {
            Some(reply_to) => reply_to,
            None => {
                debug!(
                    "[{}] Not replying to {}, no reply address given",
                    inner.name, path
                );
                return;
            }
        };

        let reply = match outcome {
            Ok(body) => Envelope::reply(path, body, correlation_id),
            Err(e) => {
                let fault = RemoteFault::from_boxed(e);
                warn!("[{}] Route handler for {} failed: {}", inner.name, path, fault);
                Envelope::fault_reply(path, fault.to_wire(), correlation_id)
            }
        };

        if let Err(e) = inner
            .transport
            .publish(RPC_EXCHANGE, &reply_to, &reply)
            .await
        {
            warn!(
                "[{}] Failed to deliver reply to {}: {}",
                inner.name, reply_to, e
            );
        }
    });
}

async fn reply_loop(inner: Arc<ServiceInner>, mut deliveries: DeliveryStream) {
    while let Some(delivery) = deliveries.next().await {
        match delivery {
            Ok(envelope) => {
                let id = match envelope.correlation_id {
                    Some(id) => id,
                    None => {
                        warn!("[{}] Dropping uncorrelated reply", inner.name);
                        continue;
                    }
                };

                let outcome = if envelope.fault {
                    Err(RemoteFault::from_wire(&envelope.body))
                } else {
                    Ok(envelope.body)
                };

                // Late, duplicate or unknown replies are not an error condition
                if !inner.calls.resolve(&id, outcome) {
                    warn!("[{}] Dropping martian reply for {}", inner.name, id);
                }
            }
            Err(e) => warn!("[{}] Failed to receive reply: {}", inner.name, e),
        }
    }

    // Regular shutdown aborts this task, so the stream ending means the
    // broker dropped the channel underneath us. Fail the outstanding calls
    // instead of leaving them to expire at their full deadlines.
    let outstanding = inner.calls.outstanding();
    if outstanding > 0 {
        warn!(
            "[{}] Reply stream ended, failing {} outstanding calls",
            inner.name, outstanding
        );
        inner.calls.fail_all();
    } else {
        debug!("[{}] Reply stream ended", inner.name);
    }
}

async fn event_loop(inner: Arc<ServiceInner>, mut deliveries: DeliveryStream) {
    while let Some(delivery) = deliveries.next().await {
        match delivery {
            Ok(envelope) => dispatch_event(&inner, envelope),
            Err(e) => warn!("[{}] Failed to receive event: {}", inner.name, e),
        }
    }

    debug!("[{}] Event stream ended", inner.name);
}

/// Fans one event delivery out to every matching subscription
fn dispatch_event(inner: &Arc<ServiceInner>, envelope: Envelope) {
    let mut matched = false;

    for (pattern, handler) in &inner.subscriptions {
        if !pattern.matches(&envelope.path) {
            continue;
        }

        matched = true;
        let handler = handler.clone();
        let name = inner.name.clone();
        let envelope = envelope.clone();

        tokio::spawn(async move {
            if let Err(e) = handler
                .handle(envelope.path.clone(), envelope.headers, envelope.body)
                .await
            {
                warn!(
                    "[{}] Event handler for {} failed: {}",
                    name, envelope.path, e
                );
            }
        });
    }

    if !matched {
        warn!(
            "[{}] No subscription matches event {}, dropping it",
            inner.name, envelope.path
        );
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::error::ConsumeError;
    use crate::transport::{MemoryBroker, MemoryTransport};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::sync::oneshot;

    async fn connected(broker: &MemoryBroker, builder: ServiceBuilder) -> Service {
        builder.connect(broker.transport()).await.unwrap()
    }

    /// Delegating transport whose reply stream can be cut from the outside,
    /// simulating the broker dropping the channel underneath the service
    struct SeveringTransport {
        inner: MemoryTransport,
        cut: Mutex<Option<oneshot::Receiver<()>>>,
    }

    #[async_trait]
    impl Transport for SeveringTransport {
        async fn declare_topic_exchange(&self, name: &str) -> Result<(), ConnectionError> {
            self.inner.declare_topic_exchange(name).await
        }

        async fn declare_direct_exchange(&self, name: &str) -> Result<(), ConnectionError> {
            self.inner.declare_direct_exchange(name).await
        }

        async fn declare_queue(
            &self,
            name: &str,
            options: QueueOptions,
        ) -> Result<(), ConnectionError> {
            self.inner.declare_queue(name, options).await
        }

        async fn bind_queue(
            &self,
            queue: &str,
            exchange: &str,
            routing_key: &str,
        ) -> Result<(), ConnectionError> {
            self.inner.bind_queue(queue, exchange, routing_key).await
        }

        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            envelope: &Envelope,
        ) -> Result<(), PublishError> {
            self.inner.publish(exchange, routing_key, envelope).await
        }

        async fn consume(&self, queue: &str) -> Result<DeliveryStream, ConsumeError> {
            let stream = self.inner.consume(queue).await?;

            if queue.contains("-responses-") {
                if let Some(cut) = self.cut.lock().unwrap().take() {
                    return Ok(stream.take_until(cut).boxed());
                }
            }

            Ok(stream)
        }

        async fn shutdown(&self) -> EmptyResult {
            self.inner.shutdown().await
        }
    }

    fn echo_route() -> impl RouteHandler + 'static {
        route_fn(|_path, _headers, body| async move { Ok(body) })
    }

    #[tokio::test]
    async fn answer_calls_with_the_handlers_return_value() {
        let _ = pretty_env_logger::try_init();
        let broker = MemoryBroker::new();

        let _b = connected(
            &broker,
            Service::builder("b").route(
                "/bar",
                route_fn(|_path, _headers, body| async move {
                    assert_eq!(body, br#"{"data": "x"}"#.to_vec());
                    Ok(br#"{"value": 1}"#.to_vec())
                }),
            ),
        )
        .await;
        let a = connected(&broker, Service::builder("a")).await;

        let reply = a
            .call("b", "/bar", br#"{"data": "x"}"#.to_vec(), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(reply, br#"{"value": 1}"#.to_vec());
        assert_eq!(a.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn surface_remote_faults_to_the_caller() {
        let broker = MemoryBroker::new();

        let _b = connected(
            &broker,
            Service::builder("b").route(
                "/bar",
                route_fn(|_path, _headers, _body| async move {
                    Err::<Vec<u8>, BoxedError>("boom".into())
                }),
            ),
        )
        .await;
        let a = connected(&broker, Service::builder("a")).await;

        let result = a
            .call("b", "/bar", Vec::new(), Duration::from_secs(5))
            .await;

        match result {
            Err(CallError::Remote(fault)) => assert!(fault.to_string().contains("boom")),
            other => panic!("expected a remote fault, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn time_out_when_nobody_answers() {
        let broker = MemoryBroker::new();

        // b exists but has no route for the called path
        let _b = connected(&broker, Service::builder("b").route("/bar", echo_route())).await;
        let a = connected(&broker, Service::builder("a")).await;

        let timeout = Duration::from_millis(150);
        let started = Instant::now();
        let result = a.call("b", "/unregistered", Vec::new(), timeout).await;

        assert!(matches!(result, Err(CallError::Timeout(_))));
        assert!(started.elapsed() >= timeout);
        assert!(
            started.elapsed() < timeout + Duration::from_secs(2),
            "deadline fired far past the configured timeout"
        );
        assert_eq!(a.outstanding_calls(), 0, "pending call record leaked");
    }

    #[tokio::test]
    async fn keep_concurrent_calls_isolated() {
        let broker = MemoryBroker::new();

        let _b = connected(&broker, Service::builder("b").route("/echo", echo_route())).await;
        let a = connected(&broker, Service::builder("a")).await;

        let calls = (0..16).map(|index| {
            let a = &a;
            async move {
                let body = format!("payload-{}", index).into_bytes();
                let reply = a
                    .call("b", "/echo", body.clone(), Duration::from_secs(5))
                    .await
                    .unwrap();
                assert_eq!(reply, body);
            }
        });

        futures::future::join_all(calls).await;
        assert_eq!(a.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn fan_events_out_to_every_matching_subscriber_once() {
        let broker = MemoryBroker::new();

        let narrow = Arc::new(AtomicUsize::new(0));
        let wide = Arc::new(AtomicUsize::new(0));

        let narrow_counter = narrow.clone();
        let wide_counter = wide.clone();

        let _observer = connected(
            &broker,
            Service::builder("observer")
                .subscribe(
                    "/user/*/created",
                    event_fn(move |_path, _headers, _body| {
                        let counter = narrow_counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                )
                .subscribe(
                    "/user/#",
                    event_fn(move |_path, _headers, _body| {
                        let counter = wide_counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                ),
        )
        .await;
        let publisher = connected(&broker, Service::builder("publisher")).await;

        publisher
            .publish("/user/42/created", Vec::new(), Headers::new())
            .await
            .unwrap();
        publisher
            .publish("/user/42/deleted", Vec::new(), Headers::new())
            .await
            .unwrap();
        publisher
            .publish("/billing/invoice", Vec::new(), Headers::new())
            .await
            .unwrap();

        time::sleep(Duration::from_millis(100)).await;

        assert_eq!(narrow.load(Ordering::SeqCst), 1);
        assert_eq!(wide.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn keep_the_receive_loop_alive_past_handler_failures() {
        let broker = MemoryBroker::new();

        let deliveries = Arc::new(AtomicUsize::new(0));
        let counter = deliveries.clone();

        let _observer = connected(
            &broker,
            Service::builder("observer").subscribe(
                "/noisy/#",
                event_fn(move |_path, _headers, _body| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err("handler blew up".into())
                    }
                }),
            ),
        )
        .await;
        let publisher = connected(&broker, Service::builder("publisher")).await;

        publisher
            .publish("/noisy/1", Vec::new(), Headers::new())
            .await
            .unwrap();
        publisher
            .publish("/noisy/2", Vec::new(), Headers::new())
            .await
            .unwrap();

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(deliveries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drop_late_replies_after_a_timeout() {
        let broker = MemoryBroker::new();

        let _b = connected(
            &broker,
            Service::builder("b").route(
                "/slow",
                route_fn(|_path, _headers, body| async move {
                    time::sleep(Duration::from_millis(300)).await;
                    Ok(body)
                }),
            ),
        )
        .await;
        let a = connected(&broker, Service::builder("a")).await;

        let result = a
            .call("b", "/slow", Vec::new(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(CallError::Timeout(_))));
        assert_eq!(a.outstanding_calls(), 0);

        // The late reply arrives against an abandoned correlation id and is dropped
        time::sleep(Duration::from_millis(400)).await;
        assert_eq!(a.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn resolve_each_call_exactly_once_under_racing_deadlines() {
        let broker = MemoryBroker::new();

        let timeout = Duration::from_millis(30);
        let _b = connected(
            &broker,
            Service::builder("b").route(
                "/edge",
                route_fn(move |_path, _headers, body| async move {
                    time::sleep(Duration::from_millis(30)).await;
                    Ok(body)
                }),
            ),
        )
        .await;
        let a = connected(&broker, Service::builder("a")).await;

        // Reply and deadline land at essentially the same instant. Either
        // outcome is legal, but there must be exactly one and no leak.
        for round in 0..20 {
            let result = a
                .call("b", "/edge", vec![round], timeout)
                .await;

            match result {
                Ok(body) => assert_eq!(body, vec![round]),
                Err(CallError::Timeout(_)) => {}
                Err(other) => panic!("unexpected call failure: {}", other),
            }
            assert_eq!(a.outstanding_calls(), 0);
        }
    }

    #[tokio::test]
    async fn fail_outstanding_calls_on_shutdown() {
        let broker = MemoryBroker::new();

        let _b = connected(
            &broker,
            Service::builder("b").route(
                "/hang",
                route_fn(|_path, _headers, body| async move {
                    time::sleep(Duration::from_secs(60)).await;
                    Ok(body)
                }),
            ),
        )
        .await;
        let a = connected(&broker, Service::builder("a")).await;

        let (result, _) = tokio::join!(
            a.call("b", "/hang", Vec::new(), Duration::from_secs(30)),
            async {
                time::sleep(Duration::from_millis(50)).await;
                a.shutdown().await.unwrap();
            }
        );

        assert!(matches!(result, Err(CallError::Connection(_))));
        assert_eq!(a.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn fail_outstanding_calls_when_the_reply_stream_ends() {
        let broker = MemoryBroker::new();

        let _b = connected(
            &broker,
            Service::builder("b").route(
                "/hang",
                route_fn(|_path, _headers, body| async move {
                    time::sleep(Duration::from_secs(60)).await;
                    Ok(body)
                }),
            ),
        )
        .await;

        let (cut_tx, cut_rx) = oneshot::channel();
        let transport = SeveringTransport {
            inner: broker.transport(),
            cut: Mutex::new(Some(cut_rx)),
        };
        let a = Service::builder("a").connect(transport).await.unwrap();

        // The broker drops the reply channel while the call is in flight.
        // The call must fail promptly as a connection loss, not wait out
        // its full deadline and masquerade as a timeout.
        let started = Instant::now();
        let (result, _) = tokio::join!(
            a.call("b", "/hang", Vec::new(), Duration::from_secs(30)),
            async {
                time::sleep(Duration::from_millis(50)).await;
                cut_tx.send(()).ok();
            }
        );

        assert!(matches!(result, Err(CallError::Connection(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(a.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn run_handlers_for_casts_without_replying() {
        let broker = MemoryBroker::new();

        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();

        let _b = connected(
            &broker,
            Service::builder("b").route(
                "/job",
                route_fn(move |_path, _headers, _body| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(Vec::new())
                    }
                }),
            ),
        )
        .await;
        let a = connected(&broker, Service::builder("a")).await;

        a.cast("b", "/job", Vec::new()).await.unwrap();

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(a.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn reject_publishes_after_shutdown() {
        let broker = MemoryBroker::new();
        let a = connected(&broker, Service::builder("a")).await;

        a.shutdown().await.unwrap();

        assert!(matches!(
            a.publish("/anything", Vec::new(), Headers::new()).await,
            Err(PublishError::ChannelClosed)
        ));
    }
}
