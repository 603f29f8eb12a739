//! Pending-response bookkeeping.
//!
//! Every request that expects a reply registers its message id here;
//! the matching response completes the pending entry, and a sweeper
//! thread fails whatever outlives its deadline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::messages::Message;
use crate::{Error, Result};

const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Completion callback for an awaited response: the reply payload, a
/// timeout, or cancellation at shutdown.
pub type ResponseFunctor = Box<dyn FnOnce(Result<Vec<u8>>) + Send>;

struct Pending {
    deadline: Instant,
    functor: ResponseFunctor,
}

#[derive(Clone)]
pub struct Timer {
    pending: Arc<Mutex<HashMap<u32, Pending>>>,
    shutdown: flume::Sender<()>,
}

impl Timer {
    pub fn new() -> Timer {
        let pending: Arc<Mutex<HashMap<u32, Pending>>> = Arc::default();
        let (shutdown, sweep) = flume::bounded::<()>(1);

        let sweeping = pending.clone();
        thread::spawn(move || loop {
            match sweep.recv_timeout(SWEEP_INTERVAL) {
                Err(flume::RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    let expired: Vec<(u32, Pending)> = {
                        let mut pending = sweeping.lock().unwrap();
                        let ids: Vec<u32> = pending
                            .iter()
                            .filter(|(_, task)| task.deadline <= now)
                            .map(|(id, _)| *id)
                            .collect();
                        ids.into_iter()
                            .filter_map(|id| pending.remove(&id).map(|task| (id, task)))
                            .collect()
                    };

                    for (id, task) in expired {
                        debug!(message_id = id, "Response timed out");
                        (task.functor)(Err(Error::ResponseTimeout(id)));
                    }
                }
                // Shutdown signal or the timer handle went away.
                _ => return,
            }
        });

        Timer { pending, shutdown }
    }

    // === Public Methods ===

    /// Awaits the response to `message_id` for at most `timeout`.
    pub fn add_task(&self, message_id: u32, timeout: Duration, functor: ResponseFunctor) {
        let mut pending = self.pending.lock().unwrap();
        pending.insert(
            message_id,
            Pending {
                deadline: Instant::now() + timeout,
                functor,
            },
        );
    }

    /// Completes a pending entry with an inbound response. Returns false
    /// if nothing was waiting on this message id.
    pub fn add_response(&self, message: &Message) -> bool {
        let task = {
            let mut pending = self.pending.lock().unwrap();
            pending.remove(&message.id)
        };

        match task {
            Some(task) => {
                trace!(message_id = message.id, "Response completed pending task");
                (task.functor)(Ok(message.data.first().cloned().unwrap_or_default()));
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Fails every pending entry with cancellation and stops the sweeper.
    pub fn stop(&self) {
        let _ = self.shutdown.try_send(());

        let drained: Vec<Pending> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, task)| task).collect()
        };
        for task in drained {
            (task.functor)(Err(Error::Stopped));
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Timer::new()
    }
}
