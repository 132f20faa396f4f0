//! AudioHook Server Library Crate
//!
//! This library contains all the core logic for the AudioHook session server:
//! configuration, the shared application state, the concurrent session
//! registry, the protocol dispatcher, and the WebSocket connection handling.
//! The `bin/server.rs` binary is a thin wrapper around this library.

pub mod audio;
pub mod config;
pub mod registry;
pub mod router;
pub mod state;
pub mod transport;
pub mod ws;
