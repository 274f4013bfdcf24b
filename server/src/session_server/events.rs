//! Event fan-out from document workers to connections.
//!
//! A worker emits each event once, addressed to the sessions attached to its
//! document. The `EventRegistry` holds one bounded queue per session; the
//! connection thread drains its queue and writes the events to the socket.
//! A full queue drops the event and counts it, and the connection tells its
//! client to resynchronize with a snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;

use parking_lot::Mutex;

use cosheet_engine::ChangeSet;

use super::coordinator::CoordinatorError;
use super::sessions::Presence;

/// Something a worker wants delivered to sessions.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    ChangeSet(Arc<ChangeSet>),
    Presence {
        document_id: String,
        version: u64,
        presence: Vec<Presence>,
    },
    /// A fire-and-forget request failed; sent to the submitting session only.
    Rejected {
        document_id: String,
        error: CoordinatorError,
    },
}

impl OutboundEvent {
    pub fn document_id(&self) -> &str {
        match self {
            OutboundEvent::ChangeSet(cs) => &cs.document_id,
            OutboundEvent::Presence { document_id, .. } => document_id,
            OutboundEvent::Rejected { document_id, .. } => document_id,
        }
    }
}

/// Delivery side of broadcasting. Implementations must not block the caller
/// on a slow recipient.
pub trait EventSink: Send + Sync {
    fn deliver(&self, recipients: &[String], event: OutboundEvent);
}

/// Receiving side of one session's queue.
pub struct SessionEvents {
    rx: Receiver<OutboundEvent>,
    dropped: Arc<AtomicU64>,
}

impl SessionEvents {
    /// Pending events, in delivery order. Non-blocking.
    pub fn poll(&self) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        events
    }

    /// Events dropped since the last call.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

struct SessionQueue {
    tx: SyncSender<OutboundEvent>,
    dropped: Arc<AtomicU64>,
}

/// Per-session bounded event queues.
/// Thread-safe for concurrent access from workers and connection threads.
#[derive(Clone)]
pub struct EventRegistry {
    queues: Arc<Mutex<HashMap<String, SessionQueue>>>,
    depth: usize,
    /// Metrics: total events dropped due to backpressure.
    dropped_events: Arc<AtomicU64>,
}

impl EventRegistry {
    pub fn new(depth: usize) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            depth: depth.max(1),
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a session and return its event queue.
    pub fn register(&self, session_id: &str) -> SessionEvents {
        let (tx, rx) = mpsc::sync_channel(self.depth);
        let dropped = Arc::new(AtomicU64::new(0));
        self.queues.lock().insert(
            session_id.to_string(),
            SessionQueue {
                tx,
                dropped: Arc::clone(&dropped),
            },
        );
        SessionEvents { rx, dropped }
    }

    pub fn unregister(&self, session_id: &str) {
        self.queues.lock().remove(session_id);
    }

    pub fn session_count(&self) -> usize {
        self.queues.lock().len()
    }

    /// Get total dropped events count (for metrics).
    pub fn dropped_events_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }
}

impl EventSink for EventRegistry {
    fn deliver(&self, recipients: &[String], event: OutboundEvent) {
        let queues = self.queues.lock();
        for session_id in recipients {
            let Some(queue) = queues.get(session_id) else {
                continue;
            };
            match queue.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    queue.dropped.fetch_add(1, Ordering::Relaxed);
                    self.dropped_events.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Event dropped for session {} (backpressure)", session_id);
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
}

/// Sink that keeps every delivery, for tests and embedders that poll.
#[derive(Default)]
pub struct RecordingSink {
    deliveries: Mutex<Vec<(String, OutboundEvent)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far, one entry per recipient.
    pub fn deliveries(&self) -> Vec<(String, OutboundEvent)> {
        self.deliveries.lock().clone()
    }

    /// Events delivered to one session, in order.
    pub fn events_for(&self, session_id: &str) -> Vec<OutboundEvent> {
        self.deliveries
            .lock()
            .iter()
            .filter(|(s, _)| s == session_id)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Change-sets delivered to one session, in order.
    pub fn change_sets_for(&self, session_id: &str) -> Vec<Arc<ChangeSet>> {
        self.events_for(session_id)
            .into_iter()
            .filter_map(|e| match e {
                OutboundEvent::ChangeSet(cs) => Some(cs),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.deliveries.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn deliver(&self, recipients: &[String], event: OutboundEvent) {
        let mut deliveries = self.deliveries.lock();
        for session_id in recipients {
            deliveries.push((session_id.clone(), event.clone()));
        }
    }
}
