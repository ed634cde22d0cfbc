//! Error taxonomy of the communication layer
//!
//! Transport failures ([`ConnectionError`], [`PublishError`], [`ConsumeError`])
//! are kept separate from call failures ([`CallError`]) so a caller can always
//! distinguish "no answer" from "answered with an error". A failing subscribe
//! handler is not represented here at all, it is caught and logged at the
//! dispatch boundary and never propagates.

use crate::BoxedError;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;
use thiserror::Error;

/// Failure to establish or keep a broker connection
///
/// Fatal to `connect`, the service cannot operate until it is resolved.
/// Retrying with backoff is left to the application.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The broker could not be reached or refused authentication
    #[error("broker unreachable or authentication failed")]
    Broker(#[source] BoxedError),
    /// Declaring or binding exchanges and queues failed
    #[error("broker topology setup failed")]
    Setup(#[source] BoxedError),
}

/// Failure to hand a message to the broker
#[derive(Error, Debug)]
pub enum PublishError {
    /// The channel or connection is no longer open
    #[error("channel closed")]
    ChannelClosed,
    /// The broker rejected or could not take the message
    #[error("failed to publish message")]
    Delivery(#[source] BoxedError),
}

/// Failure while consuming deliveries from a queue
#[derive(Error, Debug)]
pub enum ConsumeError {
    /// Starting the consumer on the queue failed
    #[error("failed to start consumer on queue {queue}")]
    Subscribe {
        /// Queue the consumer was supposed to attach to
        queue: String,
        /// Underlying transport failure
        #[source]
        source: BoxedError,
    },
    /// An inbound delivery could not be decoded into an [`Envelope`](crate::Envelope)
    #[error("failed to decode inbound delivery")]
    MalformedDelivery(#[source] BoxedError),
    /// The delivery stream itself failed
    #[error("delivery stream failed")]
    Stream(#[source] BoxedError),
}

/// Failure modes of [`Service::call`](crate::Service::call)
///
/// Exactly one of these is surfaced per failed call.
#[derive(Error, Debug)]
pub enum CallError {
    /// No reply arrived within the configured deadline
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    /// The remote handler ran and reported an error
    #[error("remote handler failed")]
    Remote(#[source] RemoteFault),
    /// The request could not be sent or the service shut down while waiting
    #[error("service connection unavailable")]
    Connection(#[source] BoxedError),
}

/// Type erased, serializable error which retains the error chain information
///
/// Used as the payload of error replies. The calling service does not know
/// the concrete error types of the serving side, but it can still embed this
/// in its own errors and display one meaningful stacktrace at the top level.
///
/// When the error from which this is created contains another `RemoteFault`
/// in its source chain, that chain is consumed and integrated so faults
/// forwarded across several hops collapse into a single cause list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteFault {
    causes: Vec<String>,
}

impl RemoteFault {
    /// Creates a new instance from any error type
    pub fn new<E: Error + 'static>(e: E) -> Self {
        (&e as &(dyn Error + 'static)).into()
    }

    /// Creates a new instance from a boxed error type
    pub fn from_boxed(e: BoxedError) -> Self {
        (e.as_ref() as &(dyn Error + 'static)).into()
    }

    /// Deserializes a fault from a reply body
    ///
    /// A body that does not parse is folded into a single opaque cause so a
    /// malformed error reply still surfaces as a fault rather than a panic.
    pub fn from_wire(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_else(|_| Self {
            causes: vec![String::from_utf8_lossy(body).into_owned()],
        })
    }

    /// Serializes the fault for transmission as a reply body
    pub fn to_wire(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
impl RemoteFault {
    fn new_with_causes(causes: Vec<String>) -> Self {
        Self { causes }
    }
}

impl Error for RemoteFault {}

impl Display for RemoteFault {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(first) = self.causes.first() {
            writeln!(f, "Error: {}", first)?;
        } else {
            writeln!(f, "Unknown error")?;
            return Ok(());
        }

        writeln!(f, "\nCaused by:")?;
        for (index, cause) in self.causes.iter().skip(1).enumerate() {
            writeln!(f, "    {}: {}", index, cause)?;
        }

        Ok(())
    }
}

impl From<&(dyn Error + 'static)> for RemoteFault {
    fn from(e: &(dyn Error + 'static)) -> Self {
        let mut source: Option<&(dyn Error + 'static)> = Some(e);
        let mut causes: Vec<String> = Vec::new();

        while let Some(error) = source {
            // Integrate any child RemoteFaults and use ToString for anything else
            if let Some(fault) = error.downcast_ref::<RemoteFault>() {
                let mut child_causes = fault.causes.clone();
                causes.append(&mut child_causes);
            } else {
                causes.push(error.to_string());
            }

            source = error.source();
        }

        Self { causes }
    }
}
