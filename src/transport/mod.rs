//! Transport collaborator contract.
//!
//! The routing core does not own sockets. It drives a reliable-datagram
//! transport through this trait and reacts to the two callbacks the
//! transport fires: one whole framed message per `on_message`, one lost
//! peer per `on_connection_lost`.

pub mod memory;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::common::Id;

/// Delivered once per framed inbound message.
pub type MessageReceived = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Delivered once per lost connection, with the lost connection id.
pub type ConnectionLost = Arc<dyn Fn(Id) + Send + Sync>;

/// Completion callback for a single send attempt.
pub type SendCallback = Box<dyn FnOnce(SendOutcome) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Transport verdict on one send attempt.
pub enum SendOutcome {
    Sent,
    /// Connection still believed live; the send may be retried.
    SendFailure,
    /// Unknown peer or closed connection; the connection is gone.
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The local/external endpoint pair offered for a new connection.
pub struct EndpointPair {
    pub local: SocketAddr,
    pub external: SocketAddr,
}

/// Reliable-datagram transport surface consumed by the routing core.
pub trait Transport: Send + Sync + 'static {
    /// Attempts the supplied endpoints in order and connects to the
    /// first that accepts, registering both callbacks. Returns the
    /// connection id of the chosen bootstrap peer.
    fn bootstrap(
        &self,
        endpoints: &[SocketAddr],
        on_message: MessageReceived,
        on_connection_lost: ConnectionLost,
    ) -> Option<Id>;

    /// The endpoint pair this node offers for a connection to `peer`.
    fn available_endpoint(&self, peer: &Id) -> Option<EndpointPair>;

    /// Opens a connection to `peer` at the supplied endpoints.
    fn add(&self, peer: Id, endpoints: EndpointPair, validation: Vec<u8>) -> SendOutcome;

    /// One send attempt; the outcome arrives on `callback`, possibly on
    /// another thread.
    fn send(&self, peer: &Id, bytes: Vec<u8>, callback: SendCallback);

    /// Tears the connection to `peer` down.
    fn remove(&self, peer: &Id);
}
