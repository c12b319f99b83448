//! Phase executor: the per-record template shared by every phase.
//!
//! A record is claimed, planned, sent to the destination (unless the phase
//! resolves it locally) and its outcome written back in one transaction.
//! Record-level failures never escape this module; they are recorded on the
//! record and reported in the batch result.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use ferry_destination::Destination;
use ferry_store::{
    ClaimGuard, Eligibility, MigrationStore, NewRecord, OverrideAudit, PageRequest, Phase,
    RecordOutcome, RecordStatus, StoreError, WorkItem,
};

use crate::config::EngineConfig;
use crate::creation::{self, CreationRun, CreationStep};
use crate::phase::{self, Plan};
use crate::pool::WorkerPool;
use crate::result::{BatchResult, BatchTally, ItemOutcome};

/// An operator's request to re-process records that already succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Override {
    pub operator: String,
    pub reason: String,
}

/// Runs phases over eligible or explicitly named records.
#[derive(Clone)]
pub struct PhaseExecutor {
    store: Arc<MigrationStore>,
    destination: Arc<dyn Destination>,
    config: Arc<EngineConfig>,
    pool: Arc<WorkerPool>,
}

impl PhaseExecutor {
    pub fn new(
        store: Arc<MigrationStore>,
        destination: Arc<dyn Destination>,
        config: Arc<EngineConfig>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            store,
            destination,
            config,
            pool,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a phase over every eligible record.
    ///
    /// PREPARE first seeds a PENDING record for every source correspondence
    /// that does not have one yet.
    #[tracing::instrument(skip(self), fields(run_id = %uuid::Uuid::new_v4()))]
    pub async fn run_phase(&self, phase: Phase) -> BatchResult {
        if phase == Phase::Prepare {
            if let Err(e) = self.seed_prepare() {
                error!(error = %e, "failed to seed PREPARE records");
                return BatchResult::error(phase, format!("seeding failed: {}", e));
            }
        }

        let eligibility = Eligibility::Runnable {
            max_attempts: self.config.max_attempts,
        };
        self.run_eligible(phase, eligibility, &format!("{} phase", phase))
            .await
    }

    /// Run a phase over a snapshot of the records matching `eligibility`.
    pub(crate) async fn run_eligible(
        &self,
        phase: Phase,
        eligibility: Eligibility,
        label: &str,
    ) -> BatchResult {
        let items = match self
            .store
            .find_eligible(phase, eligibility, PageRequest::unbounded())
        {
            Ok(page) => page.content,
            Err(e) => {
                error!(%phase, error = %e, "could not read eligible records");
                return BatchResult::error(phase, format!("could not read eligible records: {}", e));
            }
        };

        info!(%phase, eligible = items.len(), "starting batch");
        let mut tally = BatchTally::default();
        self.execute(phase, items, eligibility.guard(), None, &mut tally)
            .await;

        let result = tally.finish(label);
        info!(
            %phase,
            status = ?result.status,
            successful = result.successful_count,
            failed = result.failed_count,
            skipped = result.skipped_count,
            "batch finished"
        );
        result
    }

    /// Run a phase over explicitly named records.
    ///
    /// Unknown ids and records whose dependency is not satisfied are reported
    /// as errors without being claimed. SUCCESS records are skipped unless an
    /// override is given, in which case each re-run is audited.
    #[tracing::instrument(skip(self, ids, override_by), fields(run_id = %uuid::Uuid::new_v4(), requested = ids.len()))]
    pub async fn run_selected(
        &self,
        phase: Phase,
        ids: &[String],
        override_by: Option<Override>,
    ) -> BatchResult {
        let found = match self.store.find_by_ids(phase, ids) {
            Ok(found) => found,
            Err(e) => {
                error!(%phase, error = %e, "could not read named records");
                return BatchResult::error(phase, format!("could not read named records: {}", e));
            }
        };

        let mut tally = BatchTally::default();
        let known: HashSet<&str> = found.iter().map(|i| i.record.source_id.as_str()).collect();
        let mut seen = HashSet::new();
        for id in ids {
            if seen.insert(id.as_str()) && !known.contains(id.as_str()) {
                tally.fail(id, "not found");
            }
        }

        let max_attempts = self.config.max_attempts;
        let guard = if override_by.is_some() {
            ClaimGuard::overridden(max_attempts)
        } else {
            ClaimGuard::selected(max_attempts)
        };

        let mut runnable = Vec::new();
        for item in found {
            let record = &item.record;
            if !guard.admits(record.status, record.attempt_count) {
                match record.status {
                    RecordStatus::Failed => tally.fail(
                        &record.source_id,
                        format!("attempt limit reached ({} of {})", record.attempt_count, max_attempts),
                    ),
                    status => {
                        debug!(source_id = %record.source_id, status = status.as_str(), "named record skipped");
                        tally.skip();
                    }
                }
                continue;
            }
            if !item.dependency_ready {
                let dependency = phase.dependency().map(|p| p.as_str()).unwrap_or("dependency");
                tally.fail(&record.source_id, format!("{} not completed", dependency));
                continue;
            }
            runnable.push(item);
        }

        self.execute(phase, runnable, guard, override_by, &mut tally)
            .await;
        tally.finish(&format!("{} selective run", phase))
    }

    fn seed_prepare(&self) -> Result<usize, StoreError> {
        let records: Vec<NewRecord> = self
            .store
            .source_correspondences()?
            .iter()
            .map(|c| NewRecord::new(Phase::Prepare, &c.guid, &c.guid, serde_json::json!({})))
            .collect();
        let seeded = self.store.seed(&records)?;
        info!(seeded, sources = records.len(), "seeded PREPARE records");
        Ok(seeded)
    }

    /// Process items: CREATE on the worker pool, other phases in order on this task.
    async fn execute(
        &self,
        phase: Phase,
        items: Vec<WorkItem>,
        guard: ClaimGuard,
        override_by: Option<Override>,
        tally: &mut BatchTally,
    ) {
        if phase != Phase::Create {
            for item in items {
                let source_id = item.record.source_id.clone();
                let outcome = self.process(phase, item, guard, override_by.as_ref()).await;
                tally.record(&source_id, outcome);
            }
            return;
        }

        let mut submitted = Vec::with_capacity(items.len());
        for item in items {
            let source_id = item.record.source_id.clone();
            let executor = self.clone();
            let override_by = override_by.clone();
            let task = async move {
                executor
                    .process(phase, item, guard, override_by.as_ref())
                    .await
            };
            match self.pool.submit(task).await {
                Ok(handle) => submitted.push((source_id, handle)),
                Err(e) => tally.fail(&source_id, e),
            }
        }

        let joined = join_all(
            submitted
                .into_iter()
                .map(|(source_id, handle)| async move { (source_id, handle.join().await) }),
        )
        .await;
        for (source_id, joined) in joined {
            match joined {
                Ok(outcome) => tally.record(&source_id, outcome),
                Err(e) => tally.fail(&source_id, e),
            }
        }
    }

    /// One attempt on one record.
    async fn process(
        &self,
        phase: Phase,
        item: WorkItem,
        guard: ClaimGuard,
        override_by: Option<&Override>,
    ) -> ItemOutcome {
        let source_id = item.record.source_id.clone();

        match self.store.claim(phase, &source_id, guard) {
            Ok(true) => {}
            Ok(false) => {
                debug!(%phase, %source_id, "record not claimed, skipping");
                return ItemOutcome::Skipped;
            }
            Err(e) => {
                error!(%phase, %source_id, error = %e, "claim failed");
                return ItemOutcome::Failed(format!("claim failed: {}", e));
            }
        }

        let (outcome, successors) = match self.audit_override(phase, &item, override_by) {
            Ok(()) => self.attempt(phase, &item).await,
            Err(e) => (RecordOutcome::failure(format!("override audit failed: {}", e)), Vec::new()),
        };

        match self
            .store
            .record_outcome(phase, &source_id, &outcome, &successors)
        {
            Ok(record) => {
                match &outcome {
                    RecordOutcome::Success { .. } => info!(
                        %phase,
                        %source_id,
                        destination_id = ?record.destination_id,
                        attempt = record.attempt_count,
                        spawned = successors.len(),
                        "record migrated"
                    ),
                    RecordOutcome::Failure { error } => warn!(
                        %phase,
                        %source_id,
                        attempt = record.attempt_count,
                        error = %error,
                        "record failed"
                    ),
                    RecordOutcome::Skipped { reason } => info!(
                        %phase,
                        %source_id,
                        reason = %reason,
                        "record skipped"
                    ),
                }
                match outcome {
                    RecordOutcome::Success { .. } => ItemOutcome::Succeeded,
                    RecordOutcome::Failure { error } => ItemOutcome::Failed(error),
                    RecordOutcome::Skipped { .. } => ItemOutcome::Skipped,
                }
            }
            Err(e) => {
                error!(%phase, %source_id, error = %e, "failed to record outcome, record left IN_PROGRESS");
                ItemOutcome::Failed(format!("outcome not recorded: {}", e))
            }
        }
    }

    fn audit_override(
        &self,
        phase: Phase,
        item: &WorkItem,
        override_by: Option<&Override>,
    ) -> Result<(), StoreError> {
        let (Some(by), RecordStatus::Success) = (override_by, item.record.status) else {
            return Ok(());
        };

        warn!(
            %phase,
            source_id = %item.record.source_id,
            operator = %by.operator,
            reason = %by.reason,
            "re-processing successful record by operator override"
        );
        self.store.record_override(&OverrideAudit {
            phase,
            source_id: item.record.source_id.clone(),
            operator: by.operator.clone(),
            reason: by.reason.clone(),
            previous_destination_id: item.record.destination_id.clone(),
            recorded_at: Utc::now(),
        })
    }

    async fn attempt(&self, phase: Phase, item: &WorkItem) -> (RecordOutcome, Vec<NewRecord>) {
        let plan = match phase::plan(phase, item, &self.store, &self.config) {
            Ok(plan) => plan,
            Err(e) => return (RecordOutcome::failure(format!("source read failed: {}", e)), Vec::new()),
        };

        match plan {
            Plan::Local {
                outcome,
                successors,
            } => (outcome, successors),
            Plan::Remote { call, successors } => {
                let operation = call.operation.clone();
                debug!(%phase, source_id = %item.record.source_id, %operation, "calling destination");
                let outcome = match self.destination.execute(call).await {
                    Ok(reply) => phase::classify(phase, &reply),
                    Err(e) => RecordOutcome::failure(format!("transport error: {}", e)),
                };
                (outcome, successors)
            }
            Plan::Creation { run, successors } => {
                let outcome = self.create(&item.record.source_id, run).await;
                (outcome, successors)
            }
        }
    }

    /// Run the remaining creation steps, saving progress before each one.
    async fn create(&self, source_id: &str, run: CreationRun) -> RecordOutcome {
        let phase = Phase::Create;
        let mut document_id = run.document_id.clone();
        if let (Some(step), Some(doc)) = (run.steps.first(), &document_id) {
            info!(%source_id, destination_id = %doc, %step, "resuming creation");
        }

        for &step in &run.steps {
            if let Err(e) = self
                .store
                .record_progress(phase, source_id, step.as_str(), document_id.as_deref())
            {
                return RecordOutcome::failure(format!("progress not recorded: {}", e));
            }

            let doc_id = document_id.as_deref().unwrap_or_default();
            let calls = match run.calls(step, doc_id, &self.config) {
                Ok(calls) => calls,
                Err(e) if step == CreationStep::CreateCorrespondence => return RecordOutcome::failure(e.to_string()),
                Err(e) => return RecordOutcome::failure(format!("{} failed: {}", step, e)),
            };

            for call in calls {
                debug!(%phase, %source_id, %step, operation = %call.operation, "calling destination");
                let reply = self.destination.execute(call).await;
                if step == CreationStep::CreateCorrespondence {
                    let outcome = match reply {
                        Ok(reply) => phase::classify(phase, &reply),
                        Err(e) => RecordOutcome::failure(format!("transport error: {}", e)),
                    };
                    match outcome {
                        RecordOutcome::Success { destination_id } => document_id = destination_id,
                        failed => return failed,
                    }
                    continue;
                }

                let error = match reply {
                    Ok(reply) => phase::reply_error(&reply),
                    Err(e) => Some(format!("transport error: {}", e)),
                };
                if let Some(error) = error {
                    return RecordOutcome::failure(format!("{} failed: {}", step, error));
                }
            }
        }

        if let Err(e) = self
            .store
            .record_progress(phase, source_id, creation::COMPLETED, document_id.as_deref())
        {
            return RecordOutcome::failure(format!("progress not recorded: {}", e));
        }
        RecordOutcome::Success {
            destination_id: document_id,
        }
    }
}
