//! Supervision and delivery daemon for the core worker.
//!
//! The daemon owns the core process, forwards chat messages to it with retry
//! and escalation, and drives automatic remediation when it keeps crashing.

pub mod api;
pub mod channel;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod health;
pub mod invoke;
pub mod remediation;
pub mod shutdown;
pub mod state;
pub mod supervisor;

pub use state::AppState;
