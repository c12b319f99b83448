//! Durable migration record store for Ferry.
//!
//! This crate owns the persisted half of the migration:
//! - The per-phase `MigrationRecord` model and its status state machine
//! - The legacy source catalog (correspondences, transactions, comments)
//! - SQLite persistence with atomic per-record outcome writes
//! - Paginated, filterable reads for observability

mod db;
mod error;
mod query;
mod record;
mod source;

pub use db::{INTERRUPTED_ERROR, MigrationStore};
pub use error::StoreError;
pub use query::{
    ClaimGuard, Eligibility, OverrideAudit, Page, PageRequest, RecordQuery, StatusCounts,
};
pub use record::{
    MigrationRecord, NewRecord, Phase, RecordOutcome, RecordStatus, Transition, TransitionError,
    WorkItem,
};
pub use source::{
    ImportSummary, SourceAttachment, SourceBundle, SourceComment, SourceCorrespondence,
    SourceTransaction,
};
