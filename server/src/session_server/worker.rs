//! Document worker: the serial actor behind one resident document.
//!
//! ```text
//! Inactive ──join──▶ Loading ──loaded──▶ Active ──last leave──▶ Draining
//!    ▲                  │                  ▲                      │  │
//!    │             timeout/error           └─────────join─────────┘  │
//!    ├──────────────────┘                                            │
//!    └──────────────────────idle grace, persisted────────────────────┘
//! ```
//!
//! Loading runs on a helper thread so a slow store cannot hold the worker
//! past the load timeout. Persistence happens only when draining or at
//! shutdown, never while an edit is being applied.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;

use cosheet_engine::{Document, Extent};
use cosheet_io::DocumentStore;

use super::bridge::{oneshot, DocumentRequest};
use super::coordinator::{Coordinator, CoordinatorError};
use super::events::{EventSink, OutboundEvent};
use super::registry::{DocumentOptions, Lifecycle, Resident, Residents};

pub(crate) struct WorkerContext {
    pub document_id: String,
    pub generation: u64,
    pub residents: Residents,
    pub store: Arc<dyn DocumentStore>,
    pub sink: Arc<dyn EventSink>,
    pub options: DocumentOptions,
}

impl WorkerContext {
    /// Remove this worker's registry entry, if it is still the current one.
    /// Caller holds the lock.
    fn remove_self(&self, residents: &mut HashMap<String, Resident>) {
        if residents
            .get(&self.document_id)
            .is_some_and(|r| r.generation == self.generation)
        {
            residents.remove(&self.document_id);
        }
    }
}

pub(crate) fn run(ctx: WorkerContext, rx: Receiver<DocumentRequest>) {
    match load(&ctx) {
        Ok(doc) => {
            let coordinator = Coordinator::new(doc, Arc::clone(&ctx.sink));
            let mut worker = DocumentWorker {
                ctx,
                rx,
                coordinator,
                lifecycle: Lifecycle::Loading,
            };
            worker.serve();
        }
        Err(e) => {
            log::warn!("document {}: load failed: {}", ctx.document_id, e);
            ctx.remove_self(&mut ctx.residents.lock());
            // The entry is gone, so nothing new can be queued; answer what was.
            while let Ok(request) = rx.try_recv() {
                fail_request(&ctx, request, e.clone());
            }
            log::info!("document {}: Inactive", ctx.document_id);
        }
    }
}

fn load(ctx: &WorkerContext) -> Result<Document, CoordinatorError> {
    let (tx, rx) = oneshot::channel();
    let store = Arc::clone(&ctx.store);
    let id = ctx.document_id.clone();
    thread::Builder::new()
        .name(format!("load-{}", ctx.document_id))
        .spawn(move || {
            let _ = tx.send(store.load_document(&id));
        })
        .map_err(|e| CoordinatorError::PersistenceUnavailable(e.to_string()))?;

    let timeout = ctx.options.load_timeout;
    let options = &ctx.options;
    match rx.recv_timeout(timeout) {
        Err(_) => Err(CoordinatorError::LoadTimeout(timeout)),
        Ok(Err(e)) => Err(CoordinatorError::PersistenceUnavailable(e.to_string())),
        Ok(Ok(None)) => {
            log::info!(
                "document {}: not in store, creating {} document",
                ctx.document_id,
                options.default_extent
            );
            Ok(Document::new(&ctx.document_id, options.default_extent, options.limits))
        }
        Ok(Ok(Some(record))) => {
            // A document saved under larger limits keeps its extent.
            let limits = Extent::new(
                options.limits.rows.max(record.extent.rows),
                options.limits.cols.max(record.extent.cols),
            );
            let (doc, report) = Document::from_record(&ctx.document_id, &record, limits);
            log::debug!("document {}: {}", ctx.document_id, report.log_line());
            Ok(doc)
        }
    }
}

/// Answer a request that will never be processed.
fn fail_request(ctx: &WorkerContext, request: DocumentRequest, error: CoordinatorError) {
    match request {
        DocumentRequest::Join { reply, .. } | DocumentRequest::Snapshot { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        DocumentRequest::Edit { session_id, .. } | DocumentRequest::Resize { session_id, .. } => {
            ctx.sink.deliver(
                &[session_id],
                OutboundEvent::Rejected {
                    document_id: ctx.document_id.clone(),
                    error,
                },
            );
        }
        DocumentRequest::Leave { .. } => {}
        DocumentRequest::Shutdown { reply } => {
            let _ = reply.send(Ok(()));
        }
    }
}

enum Unload {
    Done,
    Retry,
    Pending(DocumentRequest),
}

struct DocumentWorker {
    ctx: WorkerContext,
    rx: Receiver<DocumentRequest>,
    coordinator: Coordinator,
    lifecycle: Lifecycle,
}

impl DocumentWorker {
    fn serve(&mut self) {
        loop {
            let request = if self.coordinator.has_sessions() {
                self.set_lifecycle(Lifecycle::Active);
                match self.rx.recv() {
                    Ok(request) => request,
                    Err(_) => return self.exit(),
                }
            } else if let Some(request) = self.first_request() {
                request
            } else {
                self.set_lifecycle(Lifecycle::Draining);
                match self.rx.recv_timeout(self.ctx.options.idle_grace) {
                    Ok(request) => request,
                    Err(RecvTimeoutError::Timeout) => match self.try_unload() {
                        Unload::Done => return,
                        Unload::Retry => continue,
                        Unload::Pending(request) => request,
                    },
                    Err(RecvTimeoutError::Disconnected) => return self.exit(),
                }
            };

            if !self.handle(request) {
                return;
            }
        }
    }

    /// The join that activated the document is already queued when loading
    /// finishes; take it without passing through Draining.
    fn first_request(&self) -> Option<DocumentRequest> {
        if self.lifecycle == Lifecycle::Loading {
            self.rx.try_recv().ok()
        } else {
            None
        }
    }

    /// Returns false once the worker should stop.
    fn handle(&mut self, request: DocumentRequest) -> bool {
        match request {
            DocumentRequest::Join {
                session_id,
                user_id,
                reply,
            } => {
                let outcome = self.coordinator.join(&session_id, &user_id);
                let _ = reply.send(Ok(outcome));
            }
            DocumentRequest::Edit {
                session_id,
                coord,
                raw_input,
            } => {
                if let Err(e) = self.coordinator.apply_edit(&session_id, coord, &raw_input) {
                    self.coordinator.reject(&session_id, e);
                }
            }
            DocumentRequest::Resize { session_id, extent } => {
                if let Err(e) = self.coordinator.resize(&session_id, extent) {
                    self.coordinator.reject(&session_id, e);
                }
            }
            DocumentRequest::Leave { session_id } => {
                if self.coordinator.leave(&session_id).is_err() {
                    log::debug!(
                        "document {}: leave from unattached session {}",
                        self.ctx.document_id,
                        session_id
                    );
                }
            }
            DocumentRequest::Snapshot { session_id, reply } => {
                let _ = reply.send(self.coordinator.snapshot(&session_id));
            }
            DocumentRequest::Shutdown { reply } => {
                let result = self.persist();
                self.ctx.remove_self(&mut self.ctx.residents.lock());
                while let Ok(request) = self.rx.try_recv() {
                    fail_request(&self.ctx, request, CoordinatorError::ShuttingDown);
                }
                let _ = reply.send(result);
                log::info!("document {}: stopped", self.ctx.document_id);
                return false;
            }
        }
        true
    }

    fn persist(&mut self) -> Result<(), CoordinatorError> {
        if !self.coordinator.is_dirty() {
            return Ok(());
        }
        let record = self.coordinator.document().to_record();
        self.ctx
            .store
            .save_document(&self.ctx.document_id, &record)
            .map_err(|e| CoordinatorError::PersistenceUnavailable(e.to_string()))?;
        self.coordinator.mark_clean();
        log::info!(
            "document {}: persisted version {} ({} cells)",
            self.ctx.document_id,
            record.version,
            record.cells.len()
        );
        Ok(())
    }

    fn try_unload(&mut self) -> Unload {
        if let Err(e) = self.persist() {
            log::error!("document {}: staying resident: {}", self.ctx.document_id, e);
            return Unload::Retry;
        }
        let mut residents = self.ctx.residents.lock();
        match self.rx.try_recv() {
            Ok(request) => Unload::Pending(request),
            Err(_) => {
                self.ctx.remove_self(&mut residents);
                log::info!("document {}: Inactive", self.ctx.document_id);
                Unload::Done
            }
        }
    }

    /// The registry dropped its end of the queue.
    fn exit(&mut self) {
        if let Err(e) = self.persist() {
            log::error!("document {}: lost unsaved changes: {}", self.ctx.document_id, e);
        }
    }

    fn set_lifecycle(&mut self, lifecycle: Lifecycle) {
        if self.lifecycle == lifecycle {
            return;
        }
        self.lifecycle = lifecycle;
        if let Some(resident) = self.ctx.residents.lock().get_mut(&self.ctx.document_id) {
            if resident.generation == self.ctx.generation {
                resident.lifecycle = lifecycle;
            }
        }
        log::info!("document {}: {:?}", self.ctx.document_id, lifecycle);
    }
}
