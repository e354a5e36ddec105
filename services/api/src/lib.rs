//! Rehearsal API Library Crate
//!
//! This library contains all the service logic for the interview rehearsal
//! backend, including the application state, database access, the sequencing
//! endpoint, API handlers, WebSocket session hosting, and routing. The `api`
//! binary is a thin wrapper around this library.

pub mod adapters;
pub mod catalog;
pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod orchestrator;
pub mod router;
pub mod state;
pub mod ws;
