//! SQLite persistence for migration records and the source catalog.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, named_params, params, params_from_iter};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::query::{
    ClaimGuard, Eligibility, OverrideAudit, Page, PageRequest, RecordQuery, StatusCounts,
};
use crate::record::{
    MigrationRecord, NewRecord, Phase, RecordOutcome, RecordStatus, WorkItem,
};
use crate::source::{
    ImportSummary, SourceBundle, SourceComment, SourceCorrespondence, SourceTransaction,
};

type Result<T> = std::result::Result<T, StoreError>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Error written to records found IN_PROGRESS at startup.
pub const INTERRUPTED_ERROR: &str = "interrupted before outcome was recorded";

const KIND_CORRESPONDENCE: &str = "correspondence";
const KIND_TRANSACTION: &str = "transaction";
const KIND_COMMENT: &str = "comment";

const RECORD_COLUMNS: &str = "r.phase, r.source_id, r.correspondence_id, r.destination_id, \
     r.status, r.attempt_count, r.last_error, r.payload, r.created_at, r.updated_at, r.step";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS migration_records (
        phase TEXT NOT NULL,
        source_id TEXT NOT NULL,
        correspondence_id TEXT NOT NULL,
        destination_id TEXT,
        status TEXT NOT NULL DEFAULT 'PENDING',
        attempt_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        payload TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        step TEXT,
        PRIMARY KEY (phase, source_id)
    );
    CREATE INDEX IF NOT EXISTS idx_records_eligible
        ON migration_records(phase, status, attempt_count, updated_at);
    CREATE INDEX IF NOT EXISTS idx_records_correspondence
        ON migration_records(phase, correspondence_id);

    CREATE TABLE IF NOT EXISTS source_items (
        kind TEXT NOT NULL,
        guid TEXT NOT NULL,
        correspondence_guid TEXT,
        body TEXT NOT NULL,
        imported_at TEXT NOT NULL,
        PRIMARY KEY (kind, guid)
    );
    CREATE INDEX IF NOT EXISTS idx_source_parent
        ON source_items(kind, correspondence_guid);

    CREATE TABLE IF NOT EXISTS override_audit (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        phase TEXT NOT NULL,
        source_id TEXT NOT NULL,
        operator TEXT NOT NULL,
        reason TEXT NOT NULL,
        previous_destination_id TEXT,
        recorded_at TEXT NOT NULL
    );
";

/// SQLite-backed migration store.
///
/// Writes are serialized through one connection. Reads open a fresh
/// read-only connection each call and rely on WAL to never block on writers.
pub struct MigrationStore {
    path: PathBuf,
    writer: Mutex<Connection>,
}

impl MigrationStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;

        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %path.display(), "migration store initialized");

        Ok(Self {
            path,
            writer: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reader(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    // =========================================================================
    // Source catalog
    // =========================================================================

    /// Import a legacy export. Items are replaced by guid.
    pub fn import_source(&self, bundle: &SourceBundle) -> Result<ImportSummary> {
        let now = timestamp(Utc::now());
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO source_items (kind, guid, correspondence_guid, body, imported_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for corr in &bundle.correspondences {
                stmt.execute(params![
                    KIND_CORRESPONDENCE,
                    corr.guid,
                    corr.guid,
                    serde_json::to_string(corr)?,
                    now
                ])?;
            }
            for txn in &bundle.transactions {
                stmt.execute(params![
                    KIND_TRANSACTION,
                    txn.guid,
                    txn.correspondence_guid,
                    serde_json::to_string(txn)?,
                    now
                ])?;
            }
            for comment in &bundle.comments {
                stmt.execute(params![
                    KIND_COMMENT,
                    comment.guid,
                    comment.correspondence_guid,
                    serde_json::to_string(comment)?,
                    now
                ])?;
            }
        }
        tx.commit()?;

        let summary = ImportSummary {
            correspondences: bundle.correspondences.len(),
            transactions: bundle.transactions.len(),
            comments: bundle.comments.len(),
        };
        info!(
            correspondences = summary.correspondences,
            transactions = summary.transactions,
            comments = summary.comments,
            "imported source bundle"
        );
        Ok(summary)
    }

    /// All source correspondences, ordered by guid.
    pub fn source_correspondences(&self) -> Result<Vec<SourceCorrespondence>> {
        self.source_items(KIND_CORRESPONDENCE, None)
    }

    pub fn source_correspondence(&self, guid: &str) -> Result<Option<SourceCorrespondence>> {
        let conn = self.reader()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM source_items WHERE kind = ?1 AND guid = ?2",
                params![KIND_CORRESPONDENCE, guid],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    /// Transactions recorded against one correspondence.
    pub fn source_transactions(&self, correspondence_guid: &str) -> Result<Vec<SourceTransaction>> {
        self.source_items(KIND_TRANSACTION, Some(correspondence_guid))
    }

    /// Comments recorded against one correspondence.
    pub fn source_comments(&self, correspondence_guid: &str) -> Result<Vec<SourceComment>> {
        self.source_items(KIND_COMMENT, Some(correspondence_guid))
    }

    fn source_items<T: DeserializeOwned>(&self, kind: &str, parent: Option<&str>) -> Result<Vec<T>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT body FROM source_items
             WHERE kind = ?1 AND (?2 IS NULL OR correspondence_guid = ?2)
             ORDER BY guid",
        )?;
        let bodies = stmt
            .query_map(params![kind, parent], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(StoreError::from))
            .collect()
    }

    // =========================================================================
    // Migration records: writes
    // =========================================================================

    /// Insert PENDING records that do not exist yet. Returns how many were inserted.
    pub fn seed(&self, records: &[NewRecord]) -> Result<usize> {
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        let inserted = insert_new(&tx, records, Utc::now())?;
        tx.commit()?;
        if inserted > 0 {
            debug!(inserted, "seeded records");
        }
        Ok(inserted)
    }

    /// Move a record to IN_PROGRESS if it still satisfies `guard`.
    ///
    /// Returns false when another invocation got there first or the record
    /// no longer qualifies.
    pub fn claim(&self, phase: Phase, source_id: &str, guard: ClaimGuard) -> Result<bool> {
        let conn = self.writer();
        let changed = conn.execute(
            &format!(
                "UPDATE migration_records AS r SET status = 'IN_PROGRESS', updated_at = :now
                 WHERE r.phase = :phase AND r.source_id = :source_id AND {}",
                GUARD_CLAUSE
            ),
            named_params! {
                ":now": timestamp(Utc::now()),
                ":phase": phase.as_str(),
                ":source_id": source_id,
                ":allow_pending": guard.allow_pending,
                ":allow_failed": guard.allow_failed,
                ":allow_success": guard.allow_success,
                ":max_attempts": guard.max_attempts,
            },
        )?;
        Ok(changed == 1)
    }

    /// Write the outcome of one attempt and spawn successor records, atomically.
    ///
    /// Successors are only inserted on success and never overwrite existing records.
    pub fn record_outcome(
        &self,
        phase: Phase,
        source_id: &str,
        outcome: &RecordOutcome,
        successors: &[NewRecord],
    ) -> Result<MigrationRecord> {
        let now = Utc::now();
        let mut conn = self.writer();
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM migration_records WHERE phase = ?1 AND source_id = ?2",
                params![phase.as_str(), source_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or_else(|| StoreError::NotFound {
            phase,
            source_id: source_id.to_string(),
        })?;
        let next = parse_status(&current)?.apply(outcome.transition())?;

        let (destination_id, last_error) = match outcome {
            RecordOutcome::Success { destination_id } => (destination_id.as_deref(), None),
            RecordOutcome::Failure { error } => (None, Some(error.as_str())),
            RecordOutcome::Skipped { reason } => (None, Some(reason.as_str())),
        };

        tx.execute(
            "UPDATE migration_records
             SET status = ?1, attempt_count = attempt_count + 1, last_error = ?2,
                 destination_id = COALESCE(?3, destination_id), updated_at = ?4
             WHERE phase = ?5 AND source_id = ?6",
            params![
                next.as_str(),
                last_error,
                destination_id,
                timestamp(now),
                phase.as_str(),
                source_id
            ],
        )?;

        if outcome.is_success() && !successors.is_empty() {
            let spawned = insert_new(&tx, successors, now)?;
            debug!(%phase, source_id, spawned, "spawned successor records");
        }

        let record = select_record(&tx, phase, source_id)?.ok_or_else(|| StoreError::NotFound {
            phase,
            source_id: source_id.to_string(),
        })?;
        tx.commit()?;
        Ok(record)
    }

    /// Save how far an IN_PROGRESS record got, and its destination id once known.
    ///
    /// Returns false when the record is no longer IN_PROGRESS.
    pub fn record_progress(
        &self,
        phase: Phase,
        source_id: &str,
        step: &str,
        destination_id: Option<&str>,
    ) -> Result<bool> {
        let conn = self.writer();
        let changed = conn.execute(
            "UPDATE migration_records
             SET step = ?1, destination_id = COALESCE(?2, destination_id), updated_at = ?3
             WHERE phase = ?4 AND source_id = ?5 AND status = 'IN_PROGRESS'",
            params![step, destination_id, timestamp(Utc::now()), phase.as_str(), source_id],
        )?;
        if changed == 1 {
            debug!(%phase, source_id, step, "recorded progress");
        }
        Ok(changed == 1)
    }

    /// Append an operator override to the audit trail.
    pub fn record_override(&self, audit: &OverrideAudit) -> Result<()> {
        let conn = self.writer();
        conn.execute(
            "INSERT INTO override_audit
             (phase, source_id, operator, reason, previous_destination_id, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                audit.phase.as_str(),
                audit.source_id,
                audit.operator,
                audit.reason,
                audit.previous_destination_id,
                timestamp(audit.recorded_at)
            ],
        )?;
        Ok(())
    }

    /// Fail every record left IN_PROGRESS by a process that stopped mid-attempt.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let conn = self.writer();
        let recovered = conn.execute(
            "UPDATE migration_records
             SET status = 'FAILED', attempt_count = attempt_count + 1, last_error = ?1, updated_at = ?2
             WHERE status = 'IN_PROGRESS'",
            params![INTERRUPTED_ERROR, timestamp(Utc::now())],
        )?;
        if recovered > 0 {
            warn!(recovered, "recovered interrupted records");
        }
        Ok(recovered)
    }

    // =========================================================================
    // Migration records: reads
    // =========================================================================

    /// Records a bulk run may process, oldest and least-attempted first.
    ///
    /// Only records whose gating phase record is SUCCESS (with a destination id
    /// where one is needed) are returned.
    pub fn find_eligible(
        &self,
        phase: Phase,
        eligibility: Eligibility,
        page: PageRequest,
    ) -> Result<Page<WorkItem>> {
        let guard = eligibility.guard();
        let conn = self.reader()?;
        let from = format!(
            "FROM migration_records r
             LEFT JOIN migration_records d
               ON d.phase = :dep_phase AND d.source_id = r.correspondence_id
             WHERE r.phase = :phase AND {} AND {}",
            GUARD_CLAUSE, DEPENDENCY_READY
        );
        let dep = phase.dependency().map(|d| d.as_str());
        let needs_destination = phase.needs_destination_id();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) {}", from),
            named_params! {
                ":phase": phase.as_str(),
                ":dep_phase": dep,
                ":needs_destination": needs_destination,
                ":allow_pending": guard.allow_pending,
                ":allow_failed": guard.allow_failed,
                ":allow_success": guard.allow_success,
                ":max_attempts": guard.max_attempts,
            },
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {}, d.status, d.destination_id {}
             ORDER BY r.attempt_count ASC, r.updated_at ASC, r.source_id ASC
             LIMIT :limit OFFSET :offset",
            RECORD_COLUMNS, from
        ))?;
        let rows = stmt
            .query_map(
                named_params! {
                    ":phase": phase.as_str(),
                    ":dep_phase": dep,
                    ":needs_destination": needs_destination,
                    ":allow_pending": guard.allow_pending,
                    ":allow_failed": guard.allow_failed,
                    ":allow_success": guard.allow_success,
                    ":max_attempts": guard.max_attempts,
                    ":limit": page.limit(),
                    ":offset": page.offset(),
                },
                work_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let items = rows
            .into_iter()
            .map(|row| row.into_item(phase))
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::new(items, total.max(0) as u64, page))
    }

    /// The named records that exist, in the order given. Duplicates are collapsed.
    pub fn find_by_ids(&self, phase: Phase, ids: &[String]) -> Result<Vec<WorkItem>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, d.status, d.destination_id
             FROM migration_records r
             LEFT JOIN migration_records d
               ON d.phase = :dep_phase AND d.source_id = r.correspondence_id
             WHERE r.phase = :phase AND r.source_id = :source_id",
            RECORD_COLUMNS
        ))?;

        let dep = phase.dependency().map(|d| d.as_str());
        let mut seen = std::collections::HashSet::new();
        let mut items = Vec::new();
        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            let row = stmt
                .query_row(
                    named_params! {
                        ":phase": phase.as_str(),
                        ":dep_phase": dep,
                        ":source_id": id,
                    },
                    work_row,
                )
                .optional()?;
            if let Some(row) = row {
                items.push(row.into_item(phase)?);
            }
        }
        Ok(items)
    }

    pub fn get(&self, phase: Phase, source_id: &str) -> Result<Option<MigrationRecord>> {
        let conn = self.reader()?;
        select_record(&conn, phase, source_id)
    }

    /// Paginated, filterable listing ordered by most recently updated.
    pub fn list_records(&self, phase: Phase, query: &RecordQuery) -> Result<Page<MigrationRecord>> {
        let mut clauses = vec!["r.phase = ?".to_string()];
        let mut values = vec![Value::Text(phase.as_str().to_string())];

        if let Some(status) = query.status {
            clauses.push("r.status = ?".to_string());
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(term) = query.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            clauses.push(
                "(r.source_id LIKE ? ESCAPE '\\' OR r.correspondence_id LIKE ? ESCAPE '\\' \
                  OR COALESCE(r.destination_id, '') LIKE ? ESCAPE '\\' \
                  OR COALESCE(r.last_error, '') LIKE ? ESCAPE '\\')"
                    .to_string(),
            );
            let pattern = contains_pattern(term);
            for _ in 0..4 {
                values.push(Value::Text(pattern.clone()));
            }
        }
        let where_clause = clauses.join(" AND ");

        let conn = self.reader()?;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM migration_records r WHERE {}", where_clause),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        values.push(Value::Integer(query.page.limit()));
        values.push(Value::Integer(query.page.offset()));
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM migration_records r WHERE {}
             ORDER BY r.updated_at DESC, r.source_id ASC LIMIT ? OFFSET ?",
            RECORD_COLUMNS, where_clause
        ))?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), record_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let records = rows
            .into_iter()
            .map(MigrationRecord::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page::new(records, total.max(0) as u64, query.page))
    }

    /// Per-status counts for one phase.
    pub fn aggregate_counts(&self, phase: Phase, max_attempts: u32) -> Result<StatusCounts> {
        let conn = self.reader()?;
        let counts = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'PENDING' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'IN_PROGRESS' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'SUCCESS' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'FAILED' AND attempt_count < ?2 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'FAILED' AND attempt_count >= ?2 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'SKIPPED' THEN 1 ELSE 0 END), 0),
                COUNT(*)
             FROM migration_records WHERE phase = ?1",
            params![phase.as_str(), max_attempts],
            |row| {
                Ok(StatusCounts {
                    pending: row.get::<_, i64>(0)? as u64,
                    in_progress: row.get::<_, i64>(1)? as u64,
                    success: row.get::<_, i64>(2)? as u64,
                    failed: row.get::<_, i64>(3)? as u64,
                    permanently_failed: row.get::<_, i64>(4)? as u64,
                    skipped: row.get::<_, i64>(5)? as u64,
                    total: row.get::<_, i64>(6)? as u64,
                })
            },
        )?;
        Ok(counts)
    }

    /// The override trail for one phase, oldest first.
    pub fn overrides(&self, phase: Phase) -> Result<Vec<OverrideAudit>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT source_id, operator, reason, previous_destination_id, recorded_at
             FROM override_audit WHERE phase = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![phase.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(source_id, operator, reason, previous_destination_id, recorded_at)| {
                Ok(OverrideAudit {
                    phase,
                    source_id,
                    operator,
                    reason,
                    previous_destination_id,
                    recorded_at: parse_timestamp(&recorded_at)?,
                })
            })
            .collect()
    }
}

// =============================================================================
// SQL fragments
// =============================================================================

/// Status guard over alias `r`.
const GUARD_CLAUSE: &str = "((:allow_pending AND r.status = 'PENDING')
      OR (:allow_failed AND r.status = 'FAILED' AND r.attempt_count < :max_attempts)
      OR (:allow_success AND r.status = 'SUCCESS'))";

/// Gating record `d` is SUCCESS, with a destination id when the phase needs one.
const DEPENDENCY_READY: &str = "(:dep_phase IS NULL
      OR (d.status = 'SUCCESS' AND (NOT :needs_destination OR d.destination_id IS NOT NULL)))";

// =============================================================================
// Row mapping
// =============================================================================

struct RecordRow {
    phase: String,
    source_id: String,
    correspondence_id: String,
    destination_id: Option<String>,
    status: String,
    attempt_count: i64,
    last_error: Option<String>,
    payload: String,
    created_at: String,
    updated_at: String,
    step: Option<String>,
}

struct WorkRow {
    record: RecordRow,
    dep_status: Option<String>,
    dep_destination_id: Option<String>,
}

fn record_row(row: &Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        phase: row.get(0)?,
        source_id: row.get(1)?,
        correspondence_id: row.get(2)?,
        destination_id: row.get(3)?,
        status: row.get(4)?,
        attempt_count: row.get(5)?,
        last_error: row.get(6)?,
        payload: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        step: row.get(10)?,
    })
}

fn work_row(row: &Row<'_>) -> rusqlite::Result<WorkRow> {
    Ok(WorkRow {
        record: record_row(row)?,
        dep_status: row.get(11)?,
        dep_destination_id: row.get(12)?,
    })
}

impl WorkRow {
    fn into_item(self, phase: Phase) -> Result<WorkItem> {
        let dependency_ready = match phase.dependency() {
            None => true,
            Some(_) => {
                let succeeded = self.dep_status.as_deref() == Some(RecordStatus::Success.as_str());
                succeeded && (!phase.needs_destination_id() || self.dep_destination_id.is_some())
            }
        };
        Ok(WorkItem {
            record: MigrationRecord::try_from(self.record)?,
            upstream_destination_id: self.dep_destination_id,
            dependency_ready,
        })
    }
}

impl TryFrom<RecordRow> for MigrationRecord {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self> {
        Ok(MigrationRecord {
            phase: row.phase.parse().map_err(|_| StoreError::Corrupt {
                column: "phase",
                value: row.phase.clone(),
            })?,
            source_id: row.source_id,
            correspondence_id: row.correspondence_id,
            destination_id: row.destination_id,
            status: parse_status(&row.status)?,
            attempt_count: u32::try_from(row.attempt_count).map_err(|_| StoreError::Corrupt {
                column: "attempt_count",
                value: row.attempt_count.to_string(),
            })?,
            last_error: row.last_error,
            payload: serde_json::from_str(&row.payload)?,
            step: row.step,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

/// `%term%` with LIKE wildcards in `term` matched literally (escape `\`).
fn contains_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn select_record(conn: &Connection, phase: Phase, source_id: &str) -> Result<Option<MigrationRecord>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM migration_records r WHERE r.phase = ?1 AND r.source_id = ?2",
                RECORD_COLUMNS
            ),
            params![phase.as_str(), source_id],
            record_row,
        )
        .optional()?;
    row.map(MigrationRecord::try_from).transpose()
}

fn insert_new(conn: &Connection, records: &[NewRecord], now: DateTime<Utc>) -> Result<usize> {
    let now = timestamp(now);
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO migration_records
         (phase, source_id, correspondence_id, status, attempt_count, payload, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'PENDING', 0, ?4, ?5, ?5)",
    )?;
    let mut inserted = 0;
    for record in records {
        inserted += stmt.execute(params![
            record.phase.as_str(),
            record.source_id,
            record.correspondence_id,
            to_json(&record.payload)?,
            now
        ])?;
    }
    Ok(inserted)
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn parse_status(value: &str) -> Result<RecordStatus> {
    value.parse().map_err(|_| StoreError::Corrupt {
        column: "status",
        value: value.to_string(),
    })
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt {
            column: "timestamp",
            value: value.to_string(),
        })
}
