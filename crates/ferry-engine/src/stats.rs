//! Per-phase and overall migration statistics.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use ferry_store::{MigrationStore, Phase, StatusCounts};

/// Counts for one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseStatistics {
    pub phase: Phase,
    #[serde(flatten)]
    pub counts: StatusCounts,
    /// Set when the counts could not be read; the counts are then zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Totals across every phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationTotals {
    /// SUCCESS records.
    pub completed: u64,
    /// FAILED records, retryable or not.
    pub failed: u64,
    /// PENDING and IN_PROGRESS records.
    pub in_progress: u64,
    pub permanently_failed: u64,
    pub skipped: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatistics {
    pub phases: Vec<PhaseStatistics>,
    pub totals: MigrationTotals,
    pub errors: Vec<String>,
}

/// Reads status counts from the store. Never fails as a whole.
#[derive(Clone)]
pub struct StatisticsAggregator {
    store: Arc<MigrationStore>,
    max_attempts: u32,
}

impl StatisticsAggregator {
    pub fn new(store: Arc<MigrationStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts,
        }
    }

    pub fn phase(&self, phase: Phase) -> PhaseStatistics {
        match self.store.aggregate_counts(phase, self.max_attempts) {
            Ok(counts) => PhaseStatistics {
                phase,
                counts,
                error: None,
            },
            Err(e) => {
                warn!(%phase, error = %e, "failed to read phase statistics");
                PhaseStatistics {
                    phase,
                    counts: StatusCounts::default(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub fn overall(&self) -> MigrationStatistics {
        let phases: Vec<PhaseStatistics> = Phase::ALL.iter().map(|p| self.phase(*p)).collect();

        let mut totals = MigrationTotals::default();
        let mut errors = Vec::new();
        for stats in &phases {
            let c = &stats.counts;
            totals.completed += c.success;
            totals.failed += c.failed + c.permanently_failed;
            totals.in_progress += c.pending + c.in_progress;
            totals.permanently_failed += c.permanently_failed;
            totals.skipped += c.skipped;
            totals.total += c.total;
            if let Some(error) = &stats.error {
                errors.push(format!("{}: {}", stats.phase, error));
            }
        }

        MigrationStatistics {
            phases,
            totals,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_store::{NewRecord, RecordOutcome};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store() -> (TempDir, Arc<MigrationStore>) {
        let dir = TempDir::new().unwrap();
        let store = MigrationStore::open(dir.path().join("stats.db")).unwrap();
        (dir, Arc::new(store))
    }

    #[test]
    fn test_empty_store_is_all_zero() {
        let (_dir, store) = store();
        let stats = StatisticsAggregator::new(store, 3).overall();

        assert_eq!(stats.phases.len(), 6);
        assert_eq!(stats.totals, MigrationTotals::default());
        assert!(stats.errors.is_empty());
        assert!(stats.phases.iter().all(|p| p.error.is_none()));
    }

    #[test]
    fn test_unreadable_store_degrades_to_zero_counts() {
        let (dir, store) = store();
        store
            .seed(&[NewRecord::new(Phase::Prepare, "a", "a", serde_json::json!({}))])
            .unwrap();
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            std::fs::remove_file(entry.unwrap().path()).unwrap();
        }

        let aggregator = StatisticsAggregator::new(store, 3);
        let prepare = aggregator.phase(Phase::Prepare);
        assert!(prepare.error.is_some());
        assert_eq!(prepare.counts, StatusCounts::default());

        let stats = aggregator.overall();
        assert_eq!(stats.phases.len(), 6);
        assert_eq!(stats.totals, MigrationTotals::default());
        assert_eq!(stats.errors.len(), 6);
        assert!(stats.errors[0].starts_with("PREPARE: "));
        assert!(stats.phases.iter().all(|p| p.error.is_some()));
    }

    #[test]
    fn test_totals_fold_phases() {
        let (_dir, store) = store();
        store
            .seed(&[
                NewRecord::new(Phase::Prepare, "a", "a", serde_json::json!({})),
                NewRecord::new(Phase::Prepare, "b", "b", serde_json::json!({})),
                NewRecord::new(Phase::Create, "c", "c", serde_json::json!({})),
            ])
            .unwrap();

        let guard = ferry_store::ClaimGuard::runnable(1);
        assert!(store.claim(Phase::Prepare, "a", guard).unwrap());
        store
            .record_outcome(Phase::Prepare, "a", &RecordOutcome::Success { destination_id: None }, &[])
            .unwrap();
        assert!(store.claim(Phase::Create, "c", guard).unwrap());
        store
            .record_outcome(Phase::Create, "c", &RecordOutcome::failure("HTTP 500"), &[])
            .unwrap();

        let stats = StatisticsAggregator::new(store, 1).overall();
        assert_eq!(
            stats.totals,
            MigrationTotals {
                completed: 1,
                failed: 1,
                in_progress: 1,
                permanently_failed: 1,
                skipped: 0,
                total: 3,
            }
        );

        let json = serde_json::to_value(&stats.phases[1]).unwrap();
        assert_eq!(json["phase"], "CREATE");
        assert_eq!(json["permanentlyFailed"], 1);
        assert!(json.get("error").is_none());
    }
}
