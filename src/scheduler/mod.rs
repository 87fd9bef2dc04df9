//! Bounded-concurrency execution of probe work over a target source.

pub mod engine;
pub mod queue;

pub use self::engine::{PoolStats, WorkerPool};
