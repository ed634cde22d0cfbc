//! Names making up the wire contract between services
//!
//! Every service in the network declares the same two exchanges and derives
//! its queue names from its own identity, so two services never need to
//! exchange configuration to talk to each other.

/// Direct exchange carrying commands and their replies
pub const RPC_EXCHANGE: &str = "rpc";

/// Topic exchange carrying fire-and-forget event notifications
pub const EVENT_EXCHANGE: &str = "events";

/// Reserved message header holding the hierarchical path of an envelope
///
/// User headers with this name are dropped on publish so they cannot
/// corrupt routing.
pub const PATH_HEADER: &str = "path";

/// Reserved message header marking a reply as an error reply
///
/// User headers with this name are dropped on publish so they cannot
/// corrupt fault detection.
pub const FAULT_HEADER: &str = "fault";

/// Queue name of the command queue for a given service
pub fn command_queue(service: &str) -> String {
    service.to_owned()
}

/// Queue name of the event queue for a given service
pub fn event_queue(service: &str) -> String {
    format!("{}-events", service)
}

/// Queue name of the private reply queue for a given service instance
///
/// Contains a random component so that multiple instances of the same
/// service never share replies.
pub fn reply_queue(service: &str) -> String {
    format!("{}-responses-{}", service, uuid::Uuid::new_v4())
}
