//! On-demand retry of failed records.

use tracing::info;

use ferry_store::{Eligibility, Phase};

use crate::executor::PhaseExecutor;
use crate::result::BatchResult;

/// Re-runs FAILED records that still have attempts left.
///
/// Retries go through the same per-record path as bulk runs, so a record
/// at the attempt limit is never claimed and never reaches the destination.
#[derive(Clone)]
pub struct RetryCoordinator {
    executor: PhaseExecutor,
}

impl RetryCoordinator {
    pub fn new(executor: PhaseExecutor) -> Self {
        Self { executor }
    }

    #[tracing::instrument(skip(self), fields(run_id = %uuid::Uuid::new_v4()))]
    pub async fn retry_phase(&self, phase: Phase) -> BatchResult {
        let eligibility = Eligibility::Retryable {
            max_attempts: self.executor.config().max_attempts,
        };
        self.executor
            .run_eligible(phase, eligibility, &format!("{} retry", phase))
            .await
    }

    /// Retry every phase in phase order and merge the results.
    pub async fn retry_all(&self) -> BatchResult {
        let mut results = Vec::with_capacity(Phase::ALL.len());
        for phase in Phase::ALL {
            results.push((phase, self.retry_phase(phase).await));
        }

        let merged = BatchResult::merge("Retry of all phases", results);
        info!(
            status = ?merged.status,
            successful = merged.successful_count,
            failed = merged.failed_count,
            "retry of all phases finished"
        );
        merged
    }
}
