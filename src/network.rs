//! Outbound dispatch.
//!
//! Everything leaving this node flows through [Network]: single-attempt
//! direct sends, and the recursive send-toward-destination path with
//! bounded retries, route-history loop suppression and connection
//! teardown on exhaustion. Inbound callback threads never touch the
//! transport directly; they enqueue work onto the outbound pool and the
//! pool workers are the only threads allowed to sleep or block on a
//! send.

use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use tracing::{debug, error, info, trace, warn};

use crate::client_table::ClientTable;
use crate::common::{Id, NodeInfo};
use crate::config::{MAX_ROUTE_HISTORY, MAX_SEND_ATTEMPTS, SEND_RETRY_BACKOFF};
use crate::messages::Message;
use crate::routing_table::RoutingTable;
use crate::transport::{
    ConnectionLost, EndpointPair, MessageReceived, SendOutcome, Transport,
};
use crate::{Error, Result};

type Job = Box<dyn FnOnce() + Send>;

/// Fixed pool of outbound worker threads fed over a flume channel.
struct WorkerPool {
    sender: flume::Sender<Job>,
}

impl WorkerPool {
    fn new(workers: usize) -> WorkerPool {
        let (sender, receiver) = flume::unbounded::<Job>();

        for _ in 0..workers.max(2) {
            let receiver = receiver.clone();
            thread::spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            });
        }

        WorkerPool { sender }
    }

    fn execute(&self, job: Job) {
        let _ = self.sender.send(job);
    }
}

#[derive(Default)]
struct State {
    stopped: bool,
    bootstrap_connection_id: Option<Id>,
    connection_lost: Option<ConnectionLost>,
}

struct NetworkInner {
    this_node: Id,
    routing_table: Arc<Mutex<RoutingTable>>,
    client_table: Arc<Mutex<ClientTable>>,
    transport: Arc<dyn Transport>,
    state: RwLock<State>,
    pool: WorkerPool,
}

/// Cheaply clonable handle over the shared outbound state.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

impl Network {
    pub fn new(
        this_node: Id,
        routing_table: Arc<Mutex<RoutingTable>>,
        client_table: Arc<Mutex<ClientTable>>,
        transport: Arc<dyn Transport>,
        outbound_workers: usize,
    ) -> Network {
        Network {
            inner: Arc::new(NetworkInner {
                this_node,
                routing_table,
                client_table,
                transport,
                state: RwLock::new(State::default()),
                pool: WorkerPool::new(outbound_workers),
            }),
        }
    }

    // === Getters ===

    pub fn this_node(&self) -> &Id {
        &self.inner.this_node
    }

    pub fn bootstrap_connection_id(&self) -> Option<Id> {
        self.inner.state.read().unwrap().bootstrap_connection_id
    }

    pub fn stopped(&self) -> bool {
        self.inner.state.read().unwrap().stopped
    }

    // === Public Methods ===

    /// Connects to the first accepting bootstrap endpoint and registers
    /// the inbound callbacks.
    pub fn bootstrap(
        &self,
        endpoints: &[std::net::SocketAddr],
        on_message: MessageReceived,
        on_connection_lost: ConnectionLost,
    ) -> Result<Id> {
        {
            let mut state = self.inner.state.write().unwrap();
            state.connection_lost = Some(on_connection_lost.clone());
        }

        let chosen = self
            .inner
            .transport
            .bootstrap(endpoints, on_message, on_connection_lost)
            .ok_or(Error::NoBootstrapContacts)?;

        info!(peer = ?chosen, "Bootstrap successful");
        self.inner.state.write().unwrap().bootstrap_connection_id = Some(chosen);
        Ok(chosen)
    }

    /// Stops all outbound traffic. In-flight recursive sends observe the
    /// flag after their current attempt and return without rescheduling.
    pub fn stop(&self) {
        let mut state = self.inner.state.write().unwrap();
        state.stopped = true;
        debug!("Network stopped");
    }

    /// Invokes the registered connection-lost functor.
    pub fn on_connection_lost(&self, connection_id: Id) {
        let functor = self.inner.state.read().unwrap().connection_lost.clone();
        if let Some(functor) = functor {
            functor(connection_id);
        }
    }

    // === Transport pass-throughs used by the connect handshake ===

    pub fn available_endpoint(&self, peer: &Id) -> Option<EndpointPair> {
        self.inner.transport.available_endpoint(peer)
    }

    pub fn add_connection(
        &self,
        peer: Id,
        endpoints: EndpointPair,
        validation: Vec<u8>,
    ) -> SendOutcome {
        self.inner.transport.add(peer, endpoints, validation)
    }

    pub fn remove_connection(&self, peer: &Id) {
        self.inner.transport.remove(peer);
    }

    // === Sends ===

    /// One attempt at one peer; the outcome is logged, never retried.
    pub fn send_to_direct(&self, message: &Message, peer_id: Id, connection_id: Id) {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(error) => {
                error!(?error, message_id = message.id, "Dropping unserializable message");
                return;
            }
        };

        let network = self.clone();
        let message_id = message.id;
        self.inner.pool.execute(Box::new(move || {
            if network.stopped() {
                return;
            }
            network.inner.transport.send(
                &connection_id,
                bytes,
                Box::new(move |outcome| match outcome {
                    SendOutcome::Sent => {
                        trace!(peer = ?peer_id, message_id, "Direct send succeeded")
                    }
                    outcome => {
                        warn!(peer = ?peer_id, message_id, ?outcome, "Direct send failed")
                    }
                }),
            );
        }));
    }

    /// Single attempt on the caller's thread. Used by dispatchers that
    /// own their own queue and need sends to leave in queue order.
    pub(crate) fn send_now(&self, message: &Message, peer_id: Id, connection_id: Id) {
        if self.stopped() {
            return;
        }
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(error) => {
                error!(?error, message_id = message.id, "Dropping unserializable message");
                return;
            }
        };
        let message_id = message.id;
        self.inner.transport.send(
            &connection_id,
            bytes,
            Box::new(move |outcome| match outcome {
                SendOutcome::Sent => trace!(peer = ?peer_id, message_id, "Ordered send succeeded"),
                outcome => warn!(peer = ?peer_id, message_id, ?outcome, "Ordered send failed"),
            }),
        );
    }

    /// The recursive forwarder: fans out to client connections when the
    /// destination is a connected client, otherwise walks the routing
    /// table toward the destination.
    pub fn send_to_closest(&self, message: Message) {
        if let Some(destination) = message.destination_id {
            let clients = self
                .inner
                .client_table
                .lock()
                .unwrap()
                .nodes_info(&destination);
            if !clients.is_empty() && message.direct {
                trace!(
                    count = clients.len(),
                    message_id = message.id,
                    "Destination found in client table"
                );
                for client in clients {
                    self.send_to_direct(&message, client.node_id, client.connection_id);
                }
                return;
            }

            if !self.inner.routing_table.lock().unwrap().is_empty() {
                let network = self.clone();
                self.inner.pool.execute(Box::new(move || {
                    network.recursive_send(message, None, 0);
                }));
            } else {
                error!(
                    message_id = message.id,
                    destination = ?destination,
                    "No next hop; routing table is empty"
                );
            }
            return;
        }

        // Only relay responses may travel without a destination; the
        // relay id becomes the destination so the peer sees it as direct.
        if message.is_response() && message.relay_id.is_some() {
            let mut relayed = message;
            let relay_id = relayed.relay_id.expect("checked above");
            let connection = relayed.relay_connection_id.unwrap_or(relay_id);
            relayed.destination_id = Some(relay_id);
            self.send_to_direct(&relayed, relay_id, connection);
        } else {
            error!(message_id = message.id, "Unable to work out destination; aborting send");
        }
    }

    // === Private Methods ===

    /// Tail-iterative retry loop; runs on an outbound worker.
    fn recursive_send(
        &self,
        mut message: Message,
        mut last_attempt: Option<NodeInfo>,
        mut attempt: usize,
    ) {
        loop {
            if self.stopped() {
                return;
            }

            if attempt >= MAX_SEND_ATTEMPTS {
                if let Some(last) = last_attempt.take() {
                    warn!(
                        peer = ?last.node_id,
                        message_id = message.id,
                        "Retries exhausted; dropping connection"
                    );
                    self.inner.transport.remove(&last.connection_id);
                    self.on_connection_lost(last.connection_id);
                }
                attempt = 0;
            }

            if attempt > 0 {
                thread::sleep(SEND_RETRY_BACKOFF);
            }

            let Some(destination) = message.destination_id else {
                return;
            };

            let exclude: Vec<Id> = message
                .route_history
                .iter()
                .filter(|id| **id != self.inner.this_node)
                .copied()
                .collect();
            let ignore_exact_match = !message.direct;

            let next = self.inner.routing_table.lock().unwrap().closest_node(
                &destination,
                &exclude,
                ignore_exact_match,
            );
            let Some(next) = next else {
                error!(
                    message_id = message.id,
                    destination = ?destination,
                    "No candidate next hop; abandoning message"
                );
                return;
            };

            adjust_route_history(&mut message, &self.inner.this_node);

            let bytes = match message.to_bytes() {
                Ok(bytes) => bytes,
                Err(error) => {
                    error!(?error, message_id = message.id, "Dropping unserializable message");
                    return;
                }
            };

            let (tx, rx) = flume::bounded(1);
            self.inner.transport.send(
                &next.connection_id,
                bytes,
                Box::new(move |outcome| {
                    let _ = tx.send(outcome);
                }),
            );

            match rx.recv() {
                Ok(SendOutcome::Sent) => {
                    trace!(
                        peer = ?next.node_id,
                        destination = ?destination,
                        message_id = message.id,
                        "Forwarded toward destination"
                    );
                    return;
                }
                Ok(SendOutcome::SendFailure) => {
                    debug!(
                        peer = ?next.node_id,
                        message_id = message.id,
                        attempt = attempt + 1,
                        "Send failure; will retry"
                    );
                    last_attempt = Some(next);
                    attempt += 1;
                }
                Ok(SendOutcome::Terminal) | Err(_) => {
                    if self.stopped() {
                        return;
                    }
                    warn!(
                        peer = ?next.node_id,
                        message_id = message.id,
                        "Terminal send error; removing connection and re-routing"
                    );
                    self.inner.transport.remove(&next.connection_id);
                    self.on_connection_lost(next.connection_id);
                    last_attempt = None;
                    attempt = 0;
                }
            }
        }
    }
}

/// Appends this node to the message's route history, keeping the history
/// duplicate-free and bounded.
pub(crate) fn adjust_route_history(message: &mut Message, this_node: &Id) {
    if !message.route_history.contains(this_node) {
        message.route_history.push(*this_node);
        if message.route_history.len() > MAX_ROUTE_HISTORY {
            message.route_history.remove(0);
        }
    }
}
