//! In-memory transport mesh.
//!
//! A [Mesh] is an explicit handle standing in for a real network: every
//! node registers a [MemoryTransport] endpoint on it, and tests wire
//! topologies, inject send failures and observe traffic without any
//! sockets. Delivery runs on one mesh thread, so messages between any
//! two endpoints arrive in FIFO order, off the sender's stack.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::trace;

use crate::common::Id;

use super::{
    ConnectionLost, EndpointPair, MessageReceived, SendCallback, SendOutcome, Transport,
};

enum Event {
    Message { to: Id, bytes: Vec<u8> },
    ConnectionLost { at: Id, lost: Id },
}

struct Registration {
    on_message: MessageReceived,
    on_connection_lost: ConnectionLost,
}

#[derive(Default)]
struct MeshInner {
    /// connection id → callbacks, for registered (bootstrapped) nodes.
    nodes: HashMap<Id, Registration>,
    /// listen address → connection id.
    addresses: HashMap<SocketAddr, Id>,
    /// Live directed connections; kept symmetric.
    connections: HashSet<(Id, Id)>,
    /// Injected transient failures remaining per (from, to).
    failing_sends: HashMap<(Id, Id), usize>,
}

/// An in-memory network shared by a set of [MemoryTransport] endpoints.
#[derive(Clone)]
pub struct Mesh {
    inner: Arc<Mutex<MeshInner>>,
    events: flume::Sender<Event>,
    next_port: Arc<AtomicU16>,
}

impl Mesh {
    pub fn new() -> Mesh {
        let (events, receiver) = flume::unbounded::<Event>();
        let inner: Arc<Mutex<MeshInner>> = Arc::default();

        let pump = inner.clone();
        thread::spawn(move || {
            while let Ok(event) = receiver.recv() {
                match event {
                    Event::Message { to, bytes } => {
                        let callback = {
                            let inner = pump.lock().unwrap();
                            inner.nodes.get(&to).map(|node| node.on_message.clone())
                        };
                        if let Some(on_message) = callback {
                            on_message(bytes);
                        }
                    }
                    Event::ConnectionLost { at, lost } => {
                        let callback = {
                            let inner = pump.lock().unwrap();
                            inner
                                .nodes
                                .get(&at)
                                .map(|node| node.on_connection_lost.clone())
                        };
                        if let Some(on_connection_lost) = callback {
                            on_connection_lost(lost);
                        }
                    }
                }
            }
        });

        Mesh {
            inner,
            events,
            next_port: Arc::new(AtomicU16::new(5000)),
        }
    }

    /// A fresh endpoint on this mesh for a node with `connection_id`.
    pub fn endpoint(&self, connection_id: Id) -> MemoryTransport {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        MemoryTransport {
            mesh: self.clone(),
            connection_id,
            address: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    // === Test helpers ===

    /// Creates a symmetric connection without a connect handshake.
    pub fn link(&self, a: &Id, b: &Id) {
        let mut inner = self.inner.lock().unwrap();
        inner.connections.insert((*a, *b));
        inner.connections.insert((*b, *a));
    }

    pub fn is_linked(&self, a: &Id, b: &Id) -> bool {
        self.inner.lock().unwrap().connections.contains(&(*a, *b))
    }

    /// The next `count` sends from `from` to `to` fail transiently.
    pub fn fail_sends(&self, from: Id, to: Id, count: usize) {
        self.inner
            .lock()
            .unwrap()
            .failing_sends
            .insert((from, to), count);
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Mesh::new()
    }
}

/// One node's endpoint on a [Mesh].
#[derive(Clone)]
pub struct MemoryTransport {
    mesh: Mesh,
    connection_id: Id,
    address: SocketAddr,
}

impl MemoryTransport {
    pub fn connection_id(&self) -> &Id {
        &self.connection_id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

impl Transport for MemoryTransport {
    fn bootstrap(
        &self,
        endpoints: &[SocketAddr],
        on_message: MessageReceived,
        on_connection_lost: ConnectionLost,
    ) -> Option<Id> {
        let mut inner = self.mesh.inner.lock().unwrap();

        inner.nodes.insert(
            self.connection_id,
            Registration {
                on_message,
                on_connection_lost,
            },
        );
        inner.addresses.insert(self.address, self.connection_id);

        for endpoint in endpoints {
            let Some(peer) = inner.addresses.get(endpoint).copied() else {
                continue;
            };
            if peer == self.connection_id {
                continue;
            }

            inner.connections.insert((self.connection_id, peer));
            inner.connections.insert((peer, self.connection_id));
            trace!(peer = ?peer, "Bootstrapped against mesh endpoint");
            return Some(peer);
        }

        None
    }

    fn available_endpoint(&self, _peer: &Id) -> Option<EndpointPair> {
        Some(EndpointPair {
            local: self.address,
            external: self.address,
        })
    }

    fn add(&self, peer: Id, endpoints: EndpointPair, _validation: Vec<u8>) -> SendOutcome {
        let mut inner = self.mesh.inner.lock().unwrap();

        let registered = inner.addresses.get(&endpoints.external) == Some(&peer)
            || inner.nodes.contains_key(&peer);
        if !registered {
            return SendOutcome::Terminal;
        }

        inner.connections.insert((self.connection_id, peer));
        inner.connections.insert((peer, self.connection_id));
        SendOutcome::Sent
    }

    fn send(&self, peer: &Id, bytes: Vec<u8>, callback: SendCallback) {
        let outcome = {
            let mut inner = self.mesh.inner.lock().unwrap();

            let mut injected = false;
            if let Some(remaining) = inner.failing_sends.get_mut(&(self.connection_id, *peer)) {
                if *remaining > 0 {
                    *remaining -= 1;
                    injected = true;
                }
            }

            if injected {
                SendOutcome::SendFailure
            } else if inner.connections.contains(&(self.connection_id, *peer))
                && inner.nodes.contains_key(peer)
            {
                SendOutcome::Sent
            } else {
                SendOutcome::Terminal
            }
        };

        if outcome == SendOutcome::Sent {
            let _ = self.mesh.events.send(Event::Message {
                to: *peer,
                bytes,
            });
        }

        callback(outcome);
    }

    fn remove(&self, peer: &Id) {
        let mut inner = self.mesh.inner.lock().unwrap();
        inner.connections.remove(&(self.connection_id, *peer));
        inner.connections.remove(&(*peer, self.connection_id));

        // The remote learns it lost us.
        let _ = self.mesh.events.send(Event::ConnectionLost {
            at: *peer,
            lost: self.connection_id,
        });
    }
}
