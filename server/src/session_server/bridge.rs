//! Request types for gateway ↔ document worker communication.
//!
//! Each resident document is owned by one worker thread. Connection threads
//! never touch a `Document`; they send `DocumentRequest` messages through the
//! worker's mpsc queue, and requests that need an answer carry a oneshot
//! reply channel. Processing order is queue order, which is the document's
//! commit order.

use cosheet_engine::{Coord, Extent};

use super::coordinator::{CoordinatorError, JoinOutcome};

/// A simple oneshot channel for single-use responses.
/// Uses std::sync::mpsc under the hood.
pub mod oneshot {
    use std::sync::mpsc;
    use std::time::Duration;

    pub struct Sender<T>(mpsc::SyncSender<T>);
    pub struct Receiver<T>(mpsc::Receiver<T>);

    impl<T> Sender<T> {
        pub fn send(self, value: T) -> Result<(), T> {
            self.0.send(value).map_err(|e| e.0)
        }
    }

    impl<T> Receiver<T> {
        pub fn blocking_recv(self) -> Result<T, RecvError> {
            self.0.recv().map_err(|_| RecvError)
        }

        pub fn recv_timeout(self, timeout: Duration) -> Result<T, RecvError> {
            self.0.recv_timeout(timeout).map_err(|_| RecvError)
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct RecvError;

    pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
        // Buffer of 1 for oneshot semantics
        let (tx, rx) = mpsc::sync_channel(1);
        (Sender(tx), Receiver(rx))
    }
}

pub type Reply<T> = oneshot::Sender<Result<T, CoordinatorError>>;

/// Requests from connection threads to a document worker.
pub enum DocumentRequest {
    /// Attach a session and return the full table.
    Join {
        session_id: String,
        user_id: String,
        reply: Reply<JoinOutcome>,
    },
    /// Fire-and-forget; the effect (or a rejection) arrives as an event.
    Edit {
        session_id: String,
        coord: Coord,
        raw_input: String,
    },
    /// Fire-and-forget, like `Edit`.
    Resize { session_id: String, extent: Extent },
    Leave { session_id: String },
    /// Current table for an attached session.
    Snapshot {
        session_id: String,
        reply: Reply<JoinOutcome>,
    },
    /// Persist if dirty and stop.
    Shutdown { reply: Reply<()> },
}

impl DocumentRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            DocumentRequest::Join { .. } => "join",
            DocumentRequest::Edit { .. } => "edit",
            DocumentRequest::Resize { .. } => "resize",
            DocumentRequest::Leave { .. } => "leave",
            DocumentRequest::Snapshot { .. } => "snapshot",
            DocumentRequest::Shutdown { .. } => "shutdown",
        }
    }
}
