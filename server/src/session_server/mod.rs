//! Collaboration server core.
//!
//! Clients connect over TCP, authenticate with `hello`, and attach to one
//! document at a time:
//!
//! - `server`: JSONL gateway, one thread per connection
//! - `hub`: session table plus role and attachment checks
//! - `registry` / `worker`: one serial actor per resident document
//! - `coordinator`: applies edits and fans change-sets out to attached sessions
//! - `events`: bounded per-session outbound queues

pub mod auth;
mod bridge;
mod coordinator;
mod events;
mod hub;
mod registry;
mod server;
mod sessions;
pub mod wire;
mod worker;

pub use auth::{Authenticator, Identity, TokenAuthenticator, TrustAuthenticator};
pub use coordinator::{Coordinator, CoordinatorError, JoinOutcome};
pub use events::{EventRegistry, EventSink, OutboundEvent, RecordingSink, SessionEvents};
pub use hub::SessionHub;
pub use registry::{DocumentOptions, DocumentRegistry, Lifecycle};
pub use server::{CollabServer, GatewayConfig, ServerMetrics};
pub use sessions::{Presence, SessionInfo, SessionManager};
