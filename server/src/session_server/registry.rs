//! Process-wide table of resident documents.
//!
//! Each entry is the request queue of one document worker. Entries are
//! created by a join, and removed by the worker itself when it unloads or
//! fails to load. Every send happens under the table lock, and a worker
//! only removes its entry under that lock after finding its queue empty, so
//! no request is ever sent to a worker that has stopped listening.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use cosheet_config::ServerSettings;
use cosheet_engine::{Coord, Extent};
use cosheet_io::DocumentStore;

use super::bridge::{oneshot, DocumentRequest};
use super::coordinator::{CoordinatorError, JoinOutcome};
use super::events::EventSink;
use super::worker::{self, WorkerContext};

/// Where a document is in its residency cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Not in memory.
    Inactive,
    /// Being fetched from the store on first join.
    Loading,
    /// Serving sessions.
    Active,
    /// No sessions; will persist and unload after the idle grace period.
    Draining,
}

/// Per-document parameters shared by every worker.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentOptions {
    /// Extent of a document that has never been saved.
    pub default_extent: Extent,
    /// Largest extent a resize may reach.
    pub limits: Extent,
    pub idle_grace: Duration,
    pub load_timeout: Duration,
}

impl DocumentOptions {
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            default_extent: Extent::new(settings.default_rows, settings.default_cols),
            limits: Extent::new(settings.max_rows, settings.max_cols),
            idle_grace: settings.idle_grace(),
            load_timeout: settings.load_timeout(),
        }
    }
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

pub(crate) struct Resident {
    pub(crate) tx: mpsc::Sender<DocumentRequest>,
    pub(crate) generation: u64,
    pub(crate) lifecycle: Lifecycle,
    thread: Option<JoinHandle<()>>,
}

pub(crate) type Residents = Arc<Mutex<HashMap<String, Resident>>>;

#[derive(Clone)]
pub struct DocumentRegistry {
    residents: Residents,
    store: Arc<dyn DocumentStore>,
    sink: Arc<dyn EventSink>,
    options: DocumentOptions,
    next_generation: Arc<AtomicU64>,
    shutting_down: Arc<AtomicBool>,
}

impl DocumentRegistry {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        sink: Arc<dyn EventSink>,
        options: DocumentOptions,
    ) -> Self {
        Self {
            residents: Arc::new(Mutex::new(HashMap::new())),
            store,
            sink,
            options,
            next_generation: Arc::new(AtomicU64::new(1)),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn options(&self) -> &DocumentOptions {
        &self.options
    }

    /// Attach a session, activating the document first if needed.
    ///
    /// Blocks until the document's worker has processed the join, which
    /// includes loading it (bounded by the load timeout).
    pub fn join(
        &self,
        document_id: &str,
        session_id: &str,
        user_id: &str,
    ) -> Result<JoinOutcome, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        {
            let mut residents = self.residents.lock();
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(CoordinatorError::ShuttingDown);
            }
            if !residents.contains_key(document_id) {
                self.spawn_worker(&mut residents, document_id)?;
            }
            let request = DocumentRequest::Join {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                reply,
            };
            Self::send_locked(&mut residents, document_id, request)?;
        }
        rx.blocking_recv().unwrap_or(Err(CoordinatorError::ShuttingDown))
    }

    /// Queue an edit. Its outcome is delivered as an event.
    pub fn edit(
        &self,
        document_id: &str,
        session_id: &str,
        coord: Coord,
        raw_input: &str,
    ) -> Result<(), CoordinatorError> {
        self.send(
            document_id,
            DocumentRequest::Edit {
                session_id: session_id.to_string(),
                coord,
                raw_input: raw_input.to_string(),
            },
        )
    }

    /// Queue a resize. Its outcome is delivered as an event.
    pub fn resize(
        &self,
        document_id: &str,
        session_id: &str,
        extent: Extent,
    ) -> Result<(), CoordinatorError> {
        self.send(
            document_id,
            DocumentRequest::Resize {
                session_id: session_id.to_string(),
                extent,
            },
        )
    }

    pub fn leave(&self, document_id: &str, session_id: &str) -> Result<(), CoordinatorError> {
        self.send(
            document_id,
            DocumentRequest::Leave {
                session_id: session_id.to_string(),
            },
        )
    }

    /// Current table of a resident document, as seen by an attached session.
    /// Observes every request queued before it.
    pub fn snapshot(
        &self,
        document_id: &str,
        session_id: &str,
    ) -> Result<JoinOutcome, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            document_id,
            DocumentRequest::Snapshot {
                session_id: session_id.to_string(),
                reply,
            },
        )?;
        rx.blocking_recv().unwrap_or(Err(CoordinatorError::ShuttingDown))
    }

    pub fn lifecycle(&self, document_id: &str) -> Lifecycle {
        self.residents
            .lock()
            .get(document_id)
            .map(|r| r.lifecycle)
            .unwrap_or(Lifecycle::Inactive)
    }

    /// Ids of resident documents, sorted.
    pub fn resident_documents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.residents.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Persist and stop every resident document. Later requests fail with
    /// `ShuttingDown`. Returns the number of documents that failed to persist.
    pub fn shutdown(&self) -> usize {
        let mut pending = Vec::new();
        {
            let mut residents = self.residents.lock();
            self.shutting_down.store(true, Ordering::SeqCst);
            for (id, resident) in residents.iter_mut() {
                let (reply, rx) = oneshot::channel();
                if resident.tx.send(DocumentRequest::Shutdown { reply }).is_ok() {
                    pending.push((id.clone(), rx, resident.thread.take()));
                }
            }
        }

        log::info!("shutting down {} resident documents", pending.len());
        let mut failures = 0;
        for (id, rx, thread) in pending {
            match rx.blocking_recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("document {}: not persisted at shutdown: {}", id, e);
                    failures += 1;
                }
                Err(_) => {
                    log::error!("document {}: worker stopped before shutdown", id);
                    failures += 1;
                }
            }
            if let Some(thread) = thread {
                let _ = thread.join();
            }
        }
        failures
    }

    fn send(&self, document_id: &str, request: DocumentRequest) -> Result<(), CoordinatorError> {
        let mut residents = self.residents.lock();
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(CoordinatorError::ShuttingDown);
        }
        Self::send_locked(&mut residents, document_id, request)
    }

    fn send_locked(
        residents: &mut HashMap<String, Resident>,
        document_id: &str,
        request: DocumentRequest,
    ) -> Result<(), CoordinatorError> {
        let Some(resident) = residents.get(document_id) else {
            return Err(CoordinatorError::NotAttached);
        };
        let kind = request.kind();
        if resident.tx.send(request).is_err() {
            log::error!("document {}: worker gone, dropping {} request", document_id, kind);
            residents.remove(document_id);
            return Err(CoordinatorError::NotAttached);
        }
        Ok(())
    }

    fn spawn_worker(
        &self,
        residents: &mut HashMap<String, Resident>,
        document_id: &str,
    ) -> Result<(), CoordinatorError> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        let ctx = WorkerContext {
            document_id: document_id.to_string(),
            generation,
            residents: Arc::clone(&self.residents),
            store: Arc::clone(&self.store),
            sink: Arc::clone(&self.sink),
            options: self.options.clone(),
        };
        let thread = thread::Builder::new()
            .name(format!("doc-{}", document_id))
            .spawn(move || worker::run(ctx, rx))
            .map_err(|e| {
                CoordinatorError::PersistenceUnavailable(format!("cannot start document worker: {}", e))
            })?;

        residents.insert(
            document_id.to_string(),
            Resident {
                tx,
                generation,
                lifecycle: Lifecycle::Loading,
                thread: Some(thread),
            },
        );
        log::info!("document {}: Loading", document_id);
        Ok(())
    }
}
