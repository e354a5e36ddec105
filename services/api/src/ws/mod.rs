//! WebSocket Session Management
//!
//! This module hosts live interview sessions over WebSockets. It is structured
//! into submodules:
//!
//! - `protocol`: Defines the JSON-based message format for client-server communication.
//! - `session`: Manages the WebSocket connection lifecycle, from handshake to termination.

pub mod protocol;
pub mod session;

pub use session::ws_handler;
