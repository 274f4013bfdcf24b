//! Cosheet Collaboration Protocol v1 Wire Format
//!
//! This crate defines the canonical protocol types exchanged between
//! spreadsheet clients and the collaboration server.
//! The wire format is JSONL (newline-delimited JSON) over TCP.
//!
//! # Protocol Version
//!
//! This is **protocol v1**. Changes to the wire format require:
//! 1. Version bump in PROTOCOL_VERSION
//! 2. New golden vectors in `crates/protocol/tests/golden/`
//! 3. Backward compatibility handling
//!
//! # Session flow
//!
//! ```text
//! client                          server
//!   hello {token}          ──▶
//!                          ◀──    welcome {session_id, user_id, role}
//!   join {document_id}     ──▶
//!                          ◀──    joined {cells, version, presence}
//!   edit {row, col, raw}   ──▶                      (no direct reply)
//!                          ◀──    change_set {version, cells}   (to every attached session)
//!                          ◀──    presence_update {presence}
//! ```
//!
//! Clients reconcile by version alone: discard a change-set whose version is
//! not newer than the last one applied, and send `snapshot` on a gap.

use serde::{Deserialize, Serialize};

/// Current protocol version. Increment for breaking changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum length of one JSONL line, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

// =============================================================================
// Client → Server Messages
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello(HelloMessage),
    Join(JoinMessage),
    Edit(EditMessage),
    Resize(ResizeMessage),
    Leave(LeaveMessage),
    Snapshot(SnapshotMessage),
    Ping(PingMessage),
}

/// Initial handshake from client. Must be the first message on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloMessage {
    pub id: String,
    pub token: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
}

fn default_protocol_version() -> u32 {
    1
}

/// Attach this session to a document (detaching it from any other).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinMessage {
    pub id: String,
    pub document_id: String,
}

/// Set a cell's raw input. Fire-and-forget: the effect arrives as a change-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditMessage {
    pub document_id: String,
    pub row: usize,
    pub col: usize,
    pub raw_input: String,
}

/// Grow the document extent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeMessage {
    pub document_id: String,
    pub rows: usize,
    pub cols: usize,
}

/// Detach this session from a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveMessage {
    pub document_id: String,
}

/// Request the full current state of an attached document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMessage {
    pub id: String,
    pub document_id: String,
}

/// Ping for keepalive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingMessage {
    pub id: String,
}

// =============================================================================
// Server → Client Messages
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome(WelcomeMessage),
    Joined(DocumentStateMessage),
    Snapshot(DocumentStateMessage),
    ChangeSet(ChangeSetMessage),
    PresenceUpdate(PresenceUpdateMessage),
    EventsDropped(EventsDroppedMessage),
    Pong(PongMessage),
    Error(ErrorMessage),
}

/// Welcome response after successful hello.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomeMessage {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub role: Role,
    pub protocol_version: u32,
}

/// What an authenticated user may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Editor,
    Viewer,
}

/// Full document state, sent in reply to `join` and `snapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentStateMessage {
    pub id: String,
    pub document_id: String,
    pub version: u64,
    pub rows: usize,
    pub cols: usize,
    /// Non-empty cells in ascending (row, col) order.
    pub cells: Vec<CellPayload>,
    pub presence: Vec<PresenceEntry>,
}

/// Broadcast after every committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSetMessage {
    pub document_id: String,
    pub version: u64,
    pub rows: usize,
    pub cols: usize,
    /// Edited cell first, then changed dependents in evaluation order.
    pub cells: Vec<CellPayload>,
}

/// One cell's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellPayload {
    pub row: usize,
    pub col: usize,
    pub raw_input: String,
    pub kind: CellKind,
    pub value: CellValue,
    /// Client-ready rendering of `value`.
    pub display: String,
    pub version: u64,
}

/// Classification of a cell's raw input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Empty,
    String,
    Number,
    Boolean,
    Date,
    Formula,
}

/// Typed computed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Empty,
    Number(f64),
    Text(String),
    Boolean(bool),
    /// ISO `YYYY-MM-DD`
    Date(String),
    /// Error code: `cycle`, `ref`, `value`, `div0`, `parse`, `name`, `num`
    Error(String),
}

/// A session attached to a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub session_id: String,
    pub user_id: String,
}

/// Broadcast when the set of attached sessions changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdateMessage {
    pub document_id: String,
    pub version: u64,
    pub presence: Vec<PresenceEntry>,
}

/// Sent before the next delivered event when earlier events did not fit the
/// connection's outbound queue. The client should request a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsDroppedMessage {
    pub dropped_count: u64,
}

/// Pong response to ping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongMessage {
    pub id: String,
}

/// Error response. `id` echoes the request id when the failing message had one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub code: String,
    pub message: String,
}

/// Stable error codes carried by `ErrorMessage::code`.
pub mod codes {
    pub const AUTH_FAILED: &str = "auth_failed";
    pub const PROTOCOL_MISMATCH: &str = "protocol_mismatch";
    pub const NOT_AUTHENTICATED: &str = "not_authenticated";
    pub const PARSE_ERROR: &str = "parse_error";
    pub const MESSAGE_TOO_LARGE: &str = "message_too_large";
    pub const TOO_MANY_CONNECTIONS: &str = "too_many_connections";
    pub const LOAD_TIMEOUT: &str = "load_timeout";
    pub const PERSISTENCE_UNAVAILABLE: &str = "persistence_unavailable";
    pub const OUT_OF_BOUNDS: &str = "out_of_bounds";
    pub const INVALID_RESIZE: &str = "invalid_resize";
    pub const NOT_ATTACHED: &str = "not_attached";
    pub const READ_ONLY: &str = "read_only";
    pub const SHUTTING_DOWN: &str = "shutting_down";
}

impl ServerMessage {
    /// Build an error message.
    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorMessage {
            id,
            document_id: None,
            code: code.to_string(),
            message: message.into(),
        })
    }

    /// Document the message concerns, if any.
    pub fn document_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Joined(m) | ServerMessage::Snapshot(m) => Some(&m.document_id),
            ServerMessage::ChangeSet(m) => Some(&m.document_id),
            ServerMessage::PresenceUpdate(m) => Some(&m.document_id),
            ServerMessage::Error(m) => m.document_id.as_deref(),
            _ => None,
        }
    }
}
