//! Migration record types and the per-record status state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A migration phase. The sequence is fixed and linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Read and validate the legacy correspondence.
    Prepare,
    /// Create the correspondence in the destination system.
    Create,
    /// Replay assignment transactions.
    Assign,
    /// Replay non-assignment transactions as business-log entries.
    BusinessLog,
    /// Replay comments.
    Comment,
    /// Close correspondences that were final or archived.
    Close,
}

impl Phase {
    /// Every phase, in execution order.
    pub const ALL: [Phase; 6] = [
        Phase::Prepare,
        Phase::Create,
        Phase::Assign,
        Phase::BusinessLog,
        Phase::Comment,
        Phase::Close,
    ];

    /// Persisted name of the phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Prepare => "PREPARE",
            Phase::Create => "CREATE",
            Phase::Assign => "ASSIGN",
            Phase::BusinessLog => "BUSINESS_LOG",
            Phase::Comment => "COMMENT",
            Phase::Close => "CLOSE",
        }
    }

    /// URL path segment for the phase.
    pub fn slug(&self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::Create => "create",
            Phase::Assign => "assign",
            Phase::BusinessLog => "business-log",
            Phase::Comment => "comment",
            Phase::Close => "close",
        }
    }

    /// The phase whose SUCCESS gates this one.
    ///
    /// PREPARE gates CREATE; CREATE gates everything after it.
    pub fn dependency(&self) -> Option<Phase> {
        match self {
            Phase::Prepare => None,
            Phase::Create => Some(Phase::Prepare),
            Phase::Assign | Phase::BusinessLog | Phase::Comment | Phase::Close => {
                Some(Phase::Create)
            }
        }
    }

    /// Whether this phase needs the destination id produced by CREATE.
    pub fn needs_destination_id(&self) -> bool {
        self.dependency() == Some(Phase::Create)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "prepare" | "prepare-data" => Ok(Phase::Prepare),
            "create" | "creation" => Ok(Phase::Create),
            "assign" | "assignment" => Ok(Phase::Assign),
            "business-log" | "businesslog" => Ok(Phase::BusinessLog),
            "comment" | "comments" => Ok(Phase::Comment),
            "close" | "closing" => Ok(Phase::Close),
            _ => Err(format!("unknown phase: {}", s)),
        }
    }
}

/// Outcome status of one record within one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    /// Waiting to be processed.
    #[default]
    Pending,
    /// Claimed by a running executor.
    InProgress,
    /// Destination operation succeeded.
    Success,
    /// Last attempt failed.
    Failed,
    /// Nothing to migrate for this record.
    Skipped,
}

/// An event that moves a record between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Claim a PENDING or FAILED record for processing.
    Begin,
    /// Claim any non-terminal or SUCCESS record on an operator's explicit request.
    BeginOverride,
    /// Record the destination operation succeeded.
    Succeed,
    /// Record the destination operation failed.
    Fail,
    /// Record that there was nothing to do.
    Skip,
    /// Release a claim left behind by a process that stopped mid-attempt.
    Interrupt,
}

impl Transition {
    /// Whether applying this transition completes an attempt.
    pub fn completes_attempt(&self) -> bool {
        matches!(
            self,
            Transition::Succeed | Transition::Fail | Transition::Skip | Transition::Interrupt
        )
    }
}

/// A rejected status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition {transition:?} from {from}")]
pub struct TransitionError {
    pub from: RecordStatus,
    pub transition: Transition,
}

impl RecordStatus {
    /// Persisted name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "PENDING",
            RecordStatus::InProgress => "IN_PROGRESS",
            RecordStatus::Success => "SUCCESS",
            RecordStatus::Failed => "FAILED",
            RecordStatus::Skipped => "SKIPPED",
        }
    }

    /// Apply a transition, rejecting anything the state machine does not allow.
    pub fn apply(self, transition: Transition) -> Result<RecordStatus, TransitionError> {
        use RecordStatus::*;
        use Transition::*;

        let next = match (self, transition) {
            (Pending | Failed, Begin) => Some(InProgress),
            (Pending | Failed | Success, BeginOverride) => Some(InProgress),
            (InProgress, Succeed) => Some(Success),
            (InProgress, Fail | Interrupt) => Some(Failed),
            (InProgress, Skip) => Some(Skipped),
            _ => None,
        };

        next.ok_or(TransitionError {
            from: self,
            transition,
        })
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "PENDING" => Ok(RecordStatus::Pending),
            "IN_PROGRESS" => Ok(RecordStatus::InProgress),
            "SUCCESS" | "COMPLETED" => Ok(RecordStatus::Success),
            "FAILED" | "ERROR" => Ok(RecordStatus::Failed),
            "SKIPPED" => Ok(RecordStatus::Skipped),
            _ => Err(format!("unknown status: {}", s)),
        }
    }
}

/// Migration state of one legacy entity within one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    /// Phase this record belongs to.
    pub phase: Phase,
    /// Legacy identifier, unique within the phase.
    pub source_id: String,
    /// Legacy correspondence this record belongs to (join key across phases).
    pub correspondence_id: String,
    /// Identifier assigned by the destination system, once known.
    pub destination_id: Option<String>,
    /// Current status.
    pub status: RecordStatus,
    /// Completed attempts. Never decreases.
    pub attempt_count: u32,
    /// Most recent failure or skip reason.
    pub last_error: Option<String>,
    /// Phase-specific data used to build the destination request.
    pub payload: serde_json::Value,
    /// Last step reached by a multi-step phase; kept across failures so a
    /// retry can resume there.
    pub step: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationRecord {
    /// FAILED with attempts remaining.
    pub fn is_retryable(&self, max_attempts: u32) -> bool {
        self.status == RecordStatus::Failed && self.attempt_count < max_attempts
    }

    /// FAILED with no attempts remaining.
    pub fn is_permanently_failed(&self, max_attempts: u32) -> bool {
        self.status == RecordStatus::Failed && self.attempt_count >= max_attempts
    }
}

/// A record to be created in PENDING status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub phase: Phase,
    pub source_id: String,
    pub correspondence_id: String,
    pub payload: serde_json::Value,
}

impl NewRecord {
    pub fn new(
        phase: Phase,
        source_id: impl Into<String>,
        correspondence_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            phase,
            source_id: source_id.into(),
            correspondence_id: correspondence_id.into(),
            payload,
        }
    }
}

/// Classified result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Success { destination_id: Option<String> },
    Failure { error: String },
    Skipped { reason: String },
}

impl RecordOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        RecordOutcome::Failure {
            error: error.into(),
        }
    }

    /// The state machine event this outcome applies.
    pub fn transition(&self) -> Transition {
        match self {
            RecordOutcome::Success { .. } => Transition::Succeed,
            RecordOutcome::Failure { .. } => Transition::Fail,
            RecordOutcome::Skipped { .. } => Transition::Skip,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RecordOutcome::Success { .. })
    }
}

/// A record selected for processing, with what its dependency produced.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub record: MigrationRecord,
    /// Destination id of the CREATE record for this correspondence.
    pub upstream_destination_id: Option<String>,
    /// Whether the gating phase record is SUCCESS (and has a destination id when required).
    pub dependency_ready: bool,
}
