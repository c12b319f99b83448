//! The migration engine facade used by the CLI and the HTTP surface.

use std::sync::Arc;

use tracing::debug;

use ferry_destination::Destination;
use ferry_store::{
    ImportSummary, MigrationRecord, MigrationStore, OverrideAudit, Page, Phase, RecordQuery,
    SourceBundle,
};

use crate::config::{EngineConfig, PoolConfig};
use crate::error::EngineError;
use crate::executor::{Override, PhaseExecutor};
use crate::pool::WorkerPool;
use crate::result::BatchResult;
use crate::retry::RetryCoordinator;
use crate::stats::{MigrationStatistics, PhaseStatistics, StatisticsAggregator};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Owns the store, the executor, the retry coordinator and the worker pool.
pub struct MigrationEngine {
    store: Arc<MigrationStore>,
    config: Arc<EngineConfig>,
    pool: Arc<WorkerPool>,
    executor: PhaseExecutor,
    retry: RetryCoordinator,
    stats: StatisticsAggregator,
}

impl MigrationEngine {
    pub fn new(
        store: Arc<MigrationStore>,
        destination: Arc<dyn Destination>,
        config: EngineConfig,
        pool_config: PoolConfig,
    ) -> Self {
        let config = Arc::new(config);
        let pool = Arc::new(WorkerPool::new(pool_config));
        let executor = PhaseExecutor::new(store.clone(), destination, config.clone(), pool.clone());
        let retry = RetryCoordinator::new(executor.clone());
        let stats = StatisticsAggregator::new(store.clone(), config.max_attempts);

        Self {
            store,
            config,
            pool,
            executor,
            retry,
            stats,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MigrationStore> {
        &self.store
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    pub async fn run_phase(&self, phase: Phase) -> BatchResult {
        self.executor.run_phase(phase).await
    }

    pub async fn run_selected(
        &self,
        phase: Phase,
        ids: &[String],
        override_by: Option<Override>,
    ) -> BatchResult {
        self.executor.run_selected(phase, ids, override_by).await
    }

    pub async fn retry_phase(&self, phase: Phase) -> BatchResult {
        self.retry.retry_phase(phase).await
    }

    pub async fn retry_all(&self) -> BatchResult {
        self.retry.retry_all().await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn statistics(&self) -> MigrationStatistics {
        self.stats.overall()
    }

    pub fn phase_statistics(&self, phase: Phase) -> PhaseStatistics {
        self.stats.phase(phase)
    }

    pub fn list_records(&self, phase: Phase, query: &RecordQuery) -> Result<Page<MigrationRecord>> {
        Ok(self.store.list_records(phase, query)?)
    }

    pub fn get_record(&self, phase: Phase, source_id: &str) -> Result<Option<MigrationRecord>> {
        Ok(self.store.get(phase, source_id)?)
    }

    pub fn overrides(&self, phase: Phase) -> Result<Vec<OverrideAudit>> {
        Ok(self.store.overrides(phase)?)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    pub fn import_source(&self, bundle: &SourceBundle) -> Result<ImportSummary> {
        Ok(self.store.import_source(bundle)?)
    }

    /// Fail records a previous process left IN_PROGRESS.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let recovered = self.store.recover_interrupted()?;
        if recovered == 0 {
            debug!("no interrupted records to recover");
        }
        Ok(recovered)
    }

    /// Stop the worker pool after queued work finishes.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
