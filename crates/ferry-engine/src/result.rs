//! Aggregate results of a batch run.

use serde::{Deserialize, Serialize};

use ferry_store::Phase;

/// Overall outcome of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// No record failed (including an empty batch).
    Success,
    /// Some records failed, some succeeded.
    PartialSuccess,
    /// Every processed record failed.
    Failed,
    /// The batch could not start.
    Error,
}

/// What a batch run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub status: BatchStatus,
    pub message: String,
    pub total_records: usize,
    pub successful_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    /// One `"<source_id>: <reason>"` entry per failed record.
    pub errors: Vec<String>,
}

impl BatchResult {
    /// A batch that could not start.
    pub fn error(phase: Phase, reason: impl std::fmt::Display) -> Self {
        Self {
            status: BatchStatus::Error,
            message: format!("{} could not start: {}", phase, reason),
            total_records: 0,
            successful_count: 0,
            failed_count: 0,
            skipped_count: 0,
            errors: vec![reason.to_string()],
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == BatchStatus::Error
    }

    /// Combine per-phase results into one.
    ///
    /// Phases that could not start contribute their error; the merged batch is
    /// ERROR only when no phase processed anything and at least one could not start.
    pub fn merge(label: &str, results: impl IntoIterator<Item = (Phase, BatchResult)>) -> Self {
        let mut tally = BatchTally::default();
        let mut start_errors = Vec::new();

        for (phase, result) in results {
            if result.is_error() {
                start_errors.extend(result.errors.into_iter().map(|e| format!("{}: {}", phase, e)));
                continue;
            }
            tally.successful += result.successful_count;
            tally.failed += result.failed_count;
            tally.skipped += result.skipped_count;
            tally.errors.extend(result.errors);
        }

        if !start_errors.is_empty() && tally.total() == 0 {
            return Self {
                status: BatchStatus::Error,
                message: format!("{} could not start", label),
                total_records: 0,
                successful_count: 0,
                failed_count: 0,
                skipped_count: 0,
                errors: start_errors,
            };
        }

        tally.errors.extend(start_errors);
        tally.finish(label)
    }
}

/// Per-record outcome as seen by a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    Failed(String),
    Skipped,
}

/// Running counts for a batch in progress.
#[derive(Debug, Default)]
pub struct BatchTally {
    successful: usize,
    failed: usize,
    skipped: usize,
    errors: Vec<String>,
}

impl BatchTally {
    pub fn record(&mut self, source_id: &str, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Succeeded => self.successful += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Failed(reason) => self.fail(source_id, reason),
        }
    }

    pub fn fail(&mut self, source_id: &str, reason: impl std::fmt::Display) {
        self.failed += 1;
        self.errors.push(format!("{}: {}", source_id, reason));
    }

    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    fn total(&self) -> usize {
        self.successful + self.failed + self.skipped
    }

    pub fn finish(self, label: &str) -> BatchResult {
        let status = if self.failed == 0 {
            BatchStatus::Success
        } else if self.successful > 0 {
            BatchStatus::PartialSuccess
        } else {
            BatchStatus::Failed
        };

        BatchResult {
            status,
            message: format!(
                "{} completed. Successful: {}, Failed: {}, Skipped: {}",
                label, self.successful, self.failed, self.skipped
            ),
            total_records: self.total(),
            successful_count: self.successful,
            failed_count: self.failed,
            skipped_count: self.skipped,
            errors: self.errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_empty_batch_is_success() {
        let result = BatchTally::default().finish("CREATE");
        assert_eq!(result.status, BatchStatus::Success);
        assert_eq!(result.total_records, 0);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_all_failed_is_failed() {
        let mut tally = BatchTally::default();
        tally.record("a", ItemOutcome::Failed("HTTP 500".into()));
        tally.skip();
        let result = tally.finish("ASSIGN");
        assert_eq!(result.status, BatchStatus::Failed);
        assert_eq!(result.errors, vec!["a: HTTP 500".to_string()]);
    }

    #[test]
    fn test_merge_keeps_start_errors() {
        let mut ok = BatchTally::default();
        ok.record("a", ItemOutcome::Succeeded);
        let merged = BatchResult::merge(
            "retry",
            vec![
                (Phase::Create, ok.finish("CREATE")),
                (Phase::Close, BatchResult::error(Phase::Close, "disk I/O error")),
            ],
        );
        assert_eq!(merged.status, BatchStatus::Success);
        assert_eq!(merged.successful_count, 1);
        assert_eq!(merged.errors, vec!["CLOSE: disk I/O error".to_string()]);

        let failed = BatchResult::merge(
            "retry",
            vec![(Phase::Close, BatchResult::error(Phase::Close, "locked"))],
        );
        assert_eq!(failed.status, BatchStatus::Error);
    }

    proptest! {
        #[test]
        fn counts_match_outcomes(outcomes in proptest::collection::vec(0u8..3, 0..40)) {
            let mut tally = BatchTally::default();
            for (i, kind) in outcomes.iter().enumerate() {
                let outcome = match kind {
                    0 => ItemOutcome::Succeeded,
                    1 => ItemOutcome::Failed("boom".into()),
                    _ => ItemOutcome::Skipped,
                };
                tally.record(&format!("r-{}", i), outcome);
            }
            let result = tally.finish("COMMENT");

            let n_ok = outcomes.iter().filter(|k| **k == 0).count();
            let n_fail = outcomes.iter().filter(|k| **k == 1).count();
            prop_assert_eq!(result.successful_count, n_ok);
            prop_assert_eq!(result.failed_count, n_fail);
            prop_assert_eq!(result.errors.len(), n_fail);
            prop_assert_eq!(result.total_records, outcomes.len());

            let expected = match (n_ok, n_fail) {
                (_, 0) => BatchStatus::Success,
                (0, _) => BatchStatus::Failed,
                _ => BatchStatus::PartialSuccess,
            };
            prop_assert_eq!(result.status, expected);
        }
    }
}
