//! Phase orchestration and retry engine for Ferry.
//!
//! This crate drives records through the six migration phases:
//! - A single per-record template (claim, plan, call, record) for every phase
//! - Resumable step-by-step creation of correspondences
//! - Bulk, selective and retry entry points returning a [`BatchResult`]
//! - A bounded worker pool for creation work that never drops tasks
//! - Statistics aggregated from the record store

mod config;
pub mod creation;
mod engine;
mod error;
mod executor;
pub mod phase;
mod pool;
mod result;
mod retry;
mod stats;

pub use config::{EngineConfig, PoolConfig};
pub use engine::MigrationEngine;
pub use error::{EngineError, PoolError};
pub use executor::{Override, PhaseExecutor};
pub use pool::{TaskHandle, WorkerPool};
pub use result::{BatchResult, BatchStatus, BatchTally, ItemOutcome};
pub use retry::RetryCoordinator;
pub use stats::{MigrationStatistics, MigrationTotals, PhaseStatistics, StatisticsAggregator};
