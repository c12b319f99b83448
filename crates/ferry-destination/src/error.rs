//! Error types for the destination client.

use thiserror::Error;

/// Errors that can occur when talking to the destination system.
#[derive(Debug, Error)]
pub enum DestinationError {
    /// HTTP request failed (connect, timeout, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No bearer token could be obtained.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Attachment upload failed.
    #[error("upload failed: {0}")]
    Upload(String),

    /// Invalid response from the server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}
