//! Stream Relay: durable streaming task engine.
//!
//! Jobs run on background workers and write every fragment they produce to a
//! per-job buffer backed by an append-only log. Any number of readers can
//! attach at any time, receive the history so far, then follow live output
//! until the job ends. Jobs left running by a crashed process are marked
//! interrupted on the next start.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod key;
pub mod store;
pub mod tasks;
pub mod telemetry;

pub use error::{Error, Result};
pub use key::JobKey;
