// Process-local document store

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use cosheet_engine::DocumentRecord;

use crate::{DocumentStore, StoreError};

/// Keeps saved documents in a map. Used when no database is configured and
/// by tests, which can slow loads down or make saves fail.
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, DocumentRecord>>,
    load_delay: Mutex<Option<Duration>>,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every load sleeps for `delay` before answering.
    pub fn with_load_delay(self, delay: Duration) -> Self {
        self.set_load_delay(Some(delay));
        self
    }

    pub fn set_load_delay(&self, delay: Option<Duration>) {
        *self.load_delay.lock() = delay;
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn contains(&self, document_id: &str) -> bool {
        self.documents.lock().contains_key(document_id)
    }
}

impl DocumentStore for MemoryStore {
    fn load_document(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let delay = *self.load_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("loads disabled".into()));
        }
        Ok(self.documents.lock().get(document_id).cloned())
    }

    fn save_document(&self, document_id: &str, record: &DocumentRecord) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("saves disabled".into()));
        }
        self.documents.lock().insert(document_id.to_string(), record.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
