// Document persistence

pub mod memory;
pub mod sqlite;

use std::fmt;
use std::sync::Arc;

use cosheet_engine::DocumentRecord;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Storage schema version, recorded in the SQLite `meta` table.
/// Increment when the schema changes in a way that old versions can't read.
pub const STORE_FORMAT_VERSION: u32 = 2;

/// Durable home for documents.
///
/// Called only when a document is activated (load) or drained (save), never
/// on the edit path. A document that was never saved loads as `Ok(None)`.
pub trait DocumentStore: Send + Sync {
    fn load_document(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError>;
    fn save_document(&self, document_id: &str, record: &DocumentRecord) -> Result<(), StoreError>;
}

impl<T: DocumentStore + ?Sized> DocumentStore for Arc<T> {
    fn load_document(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        (**self).load_document(document_id)
    }

    fn save_document(&self, document_id: &str, record: &DocumentRecord) -> Result<(), StoreError> {
        (**self).save_document(document_id, record)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or the operation failed.
    Unavailable(String),
    /// Stored data could not be turned back into a document.
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {}", msg),
            StoreError::Corrupt(msg) => write!(f, "stored document is corrupt: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}
