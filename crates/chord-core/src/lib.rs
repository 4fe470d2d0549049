//! Core of the chord bot: process orchestration, IPC routing, and the
//! process-wide services (database broker, stats book, stopwatch registry)
//! that shard workers reach only through message passing.
//!
//! Workers never touch these structures directly. Every mutation crosses the
//! manager's router, which is the sole ownership discipline for the shared
//! database connection, the three stats trees, and the stopwatch map.

pub mod alerts;
pub mod broker;
pub mod config;
pub mod domain;
pub mod errors;
pub mod ipc;
pub mod logging;
pub mod manager;
pub mod shard;
pub mod stats;
pub mod stopwatch;

pub use errors::{Error, Result};
