//! WebSocket Session Handling
//!
//! This module contains the core logic for driving AudioHook sessions over
//! WebSockets. It is structured into submodules for clarity:
//!
//! - `protocol`: Defines the JSON control-message format and media selection.
//! - `dispatch`: Validates sequencing and routes each control message to its handler.
//! - `session`: Manages the connection lifecycle, from upgrade to teardown.

pub mod dispatch;
pub mod protocol;
pub mod session;

pub use session::ws_handler;
