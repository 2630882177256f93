//! Availability monitoring engine.
//!
//! Turns noisy reachability samples into confirmed power transitions,
//! notifies subscribers through the cooldown gate and keeps the per-entity
//! state durable across restarts.

mod dispatch;
mod engine;
mod state;

pub use dispatch::*;
pub use engine::*;
pub use state::*;

use thiserror::Error;

/// Per-entity processing errors. None of them abort a fleet tick.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("invalid state for {entity_id}: {source}")]
    Invariant {
        entity_id: String,
        #[source]
        source: InvariantError,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("background task failed: {0}")]
    Task(String),
}

#[cfg(test)]
pub(crate) use engine::testing;
