//! HTTP surface for Ferry.
//!
//! Everything lives under `/api/migration`:
//! - Triggers that run, selectively run or retry a phase
//! - Paginated record listings and single-record lookups
//! - Per-phase and overall statistics

mod error;
mod routes;

pub use error::WebError;
pub use routes::{AppState, create_router};
