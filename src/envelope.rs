//! Unit of transport between services
//!
//! An [`Envelope`] carries an opaque payload along with the routing and
//! correlation metadata used by the higher layers. The payload is never
//! interpreted by this crate, any serialization codec may be plugged in as
//! long as both ends agree on it.

use crate::topic::Topic;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

/// User-defined string headers attached to an envelope
///
/// Insertion order is irrelevant and not preserved.
pub type Headers = HashMap<String, String>;

/// Unique token linking a command to its eventual reply
///
/// Generated once per call from a random 128-bit UUID, so concurrent
/// outstanding calls never collide for the lifetime of a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generates a fresh, collision-free identifier
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// String representation as transmitted on the wire
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for CorrelationId {
    fn from(raw: &str) -> Self {
        Self(raw.to_owned())
    }
}

/// Message envelope exchanged through the broker
///
/// The four constructor functions cover the message kinds the protocol
/// knows: events, command requests, command replies and fault replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Hierarchical destination path
    pub path: Topic,
    /// User-defined headers
    pub headers: Headers,
    /// Opaque payload bytes
    pub body: Vec<u8>,
    /// Correlation identifier, present only on command requests and replies
    pub correlation_id: Option<CorrelationId>,
    /// Private reply address of the requesting service, present only on
    /// command requests that expect a reply
    pub reply_to: Option<String>,
    /// Marks a reply as carrying a serialized fault instead of a result
    pub fault: bool,
}

impl Envelope {
    /// Fire-and-forget event notification
    pub fn event(path: Topic, body: Vec<u8>, headers: Headers) -> Self {
        Self {
            path,
            headers,
            body,
            correlation_id: None,
            reply_to: None,
            fault: false,
        }
    }

    /// Command request expecting a correlated reply at `reply_to`
    pub fn request(
        path: Topic,
        body: Vec<u8>,
        correlation_id: CorrelationId,
        reply_to: String,
    ) -> Self {
        Self {
            path,
            headers: Headers::new(),
            body,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            fault: false,
        }
    }

    /// Command request for which the caller does not expect a reply
    pub fn command(path: Topic, body: Vec<u8>) -> Self {
        Self {
            path,
            headers: Headers::new(),
            body,
            correlation_id: None,
            reply_to: None,
            fault: false,
        }
    }

    /// Successful reply to a command, tagged with the original correlation id
    pub fn reply(path: Topic, body: Vec<u8>, correlation_id: Option<CorrelationId>) -> Self {
        Self {
            path,
            headers: Headers::new(),
            body,
            correlation_id,
            reply_to: None,
            fault: false,
        }
    }

    /// Error reply to a command, carrying a serialized fault as its body
    pub fn fault_reply(path: Topic, body: Vec<u8>, correlation_id: Option<CorrelationId>) -> Self {
        Self {
            fault: true,
            ..Self::reply(path, body, correlation_id)
        }
    }
}
