use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message};
use dashmap::DashMap;
use metrics::counter;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Live connections of the relay. Every connection owns a bounded FIFO queue
/// drained by its own writer task; the registry only ever enqueues. A
/// connection whose queue cannot take a frame is evicted and told to close,
/// since silently skipping it would leave its peer waiting forever.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    connections: DashMap<Uuid, ConnectionEntry>,
    queue_depth: usize,
}

struct ConnectionEntry {
    sender: mpsc::Sender<Message>,
    closer: oneshot::Sender<CloseFrame<'static>>,
}

pub struct Registration {
    pub receiver: mpsc::Receiver<Message>,
    /// Resolves with the frame to close the socket with once the registry
    /// has let go of the connection. Errors when it was unregistered instead.
    pub closed: oneshot::Receiver<CloseFrame<'static>>,
    pub active_connections: usize,
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub bytes: usize,
    /// Receivers whose queue was full; they have been evicted.
    pub overflowed: usize,
    /// Receivers whose queue was gone; they have been evicted.
    pub closed: usize,
}

impl Registry {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: DashMap::new(),
                queue_depth: queue_depth.max(1),
            }),
        }
    }

    pub fn register(&self, connection_id: Uuid) -> Registration {
        let (sender, receiver) = mpsc::channel(self.inner.queue_depth);
        let (closer, closed) = oneshot::channel();
        self.inner
            .connections
            .insert(connection_id, ConnectionEntry { sender, closer });
        Registration {
            receiver,
            closed,
            active_connections: self.inner.connections.len(),
        }
    }

    /// Removes a connection. Nobody else is told about it.
    pub fn unregister(&self, connection_id: Uuid) -> usize {
        self.inner.connections.remove(&connection_id);
        self.inner.connections.len()
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    /// Enqueues `message` for every connection except `source_id`. A full or
    /// closed receiver never keeps the frame from reaching the others; it is
    /// evicted instead.
    pub fn broadcast(&self, source_id: Uuid, message: Message) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        // Collect first: no map guard may be held while evicting.
        let mut pending = Vec::with_capacity(self.inner.connections.len());
        for entry in self.inner.connections.iter() {
            if *entry.key() == source_id {
                trace!(connection_id = %source_id, "skip sender");
                continue;
            }
            pending.push((*entry.key(), entry.value().sender.clone()));
        }

        let bytes = message_len(&message);
        for (connection_id, sender) in pending {
            match sender.try_send(message.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    report.bytes += bytes;
                }
                Err(TrySendError::Full(_)) => {
                    report.overflowed += 1;
                    self.evict_overflowed(connection_id, source_id);
                }
                Err(TrySendError::Closed(_)) => {
                    report.closed += 1;
                    self.evict_closed(connection_id);
                }
            }
        }

        report
    }

    /// Asks every connection to close and forgets all of them.
    pub fn close_all(&self, reason: &'static str) -> usize {
        let ids: Vec<Uuid> = self
            .inner
            .connections
            .iter()
            .map(|entry| *entry.key())
            .collect();
        ids.into_iter()
            .filter(|id| self.close(*id, close_code::AWAY, reason))
            .count()
    }

    fn close(&self, connection_id: Uuid, code: u16, reason: &'static str) -> bool {
        match self.inner.connections.remove(&connection_id) {
            Some((_, entry)) => {
                let _ = entry.closer.send(CloseFrame {
                    code,
                    reason: Cow::Borrowed(reason),
                });
                true
            }
            None => false,
        }
    }

    fn evict_overflowed(&self, connection_id: Uuid, source_id: Uuid) {
        if self.close(connection_id, close_code::POLICY, "receiver queue overflow") {
            counter!("rendezvous_relay_overflow_evictions_total", 1);
            warn!(
                connection_id = %connection_id,
                source_id = %source_id,
                "receiver queue full; evicting connection"
            );
        }
    }

    fn evict_closed(&self, connection_id: Uuid) {
        let evicted = self
            .inner
            .connections
            .remove_if(&connection_id, |_, entry| entry.sender.is_closed())
            .is_some();
        if evicted {
            counter!("rendezvous_relay_evictions_total", 1);
            debug!(connection_id = %connection_id, "evicted connection with closed queue");
        }
    }
}

fn message_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(bytes) => bytes.len(),
        _ => 0,
    }
}
