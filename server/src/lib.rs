//! Cosheet server: shared spreadsheet documents edited by many sessions.

pub mod session_server;
