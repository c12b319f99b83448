//! Error types for the migration engine.

use thiserror::Error;

/// Errors from the worker pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool no longer accepts work.
    #[error("worker pool is shut down")]
    ShutDown,

    /// A task ended without producing a result.
    #[error("task panicked before completing")]
    TaskLost,
}

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Record store error.
    #[error("store error: {0}")]
    Store(#[from] ferry_store::StoreError),

    /// Worker pool error.
    #[error(transparent)]
    Pool(#[from] PoolError),
}
