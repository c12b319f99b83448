//! Error types for the record store.

use thiserror::Error;

use crate::record::{Phase, TransitionError};

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Payload or source body could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A status change was rejected by the state machine.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Record not found.
    #[error("record not found: {phase}/{source_id}")]
    NotFound { phase: Phase, source_id: String },

    /// A persisted column held a value the model does not recognise.
    #[error("corrupt column {column}: {value}")]
    Corrupt { column: &'static str, value: String },
}
