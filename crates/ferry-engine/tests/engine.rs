//! End-to-end engine behaviour against a scripted destination.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use ferry_destination::{Destination, DestinationError, OperationCall, OperationReply};
use ferry_engine::{BatchStatus, EngineConfig, MigrationEngine, Override, PoolConfig};
use ferry_store::{
    MigrationStore, NewRecord, Phase, RecordStatus, SourceAttachment, SourceBundle, SourceComment,
    SourceCorrespondence, SourceTransaction,
};

type Responder = dyn Fn(&OperationCall) -> Result<OperationReply, DestinationError> + Send + Sync;

/// Records every call and answers with a fixed script.
struct ScriptedDestination {
    calls: Mutex<Vec<OperationCall>>,
    respond: Box<Responder>,
}

impl ScriptedDestination {
    fn new(
        respond: impl Fn(&OperationCall) -> Result<OperationReply, DestinationError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    /// Every CREATE gets `doc-<guid>`; everything else an empty 200.
    fn succeeding() -> Arc<Self> {
        Self::new(|call| Ok(ok_reply(call)))
    }

    fn calls(&self) -> Vec<OperationCall> {
        self.calls.lock().unwrap().clone()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// How many documents were created.
    fn creations(&self) -> usize {
        self.operation_count("Create_Application")
    }

    fn operation_count(&self, suffix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.operation.ends_with(suffix))
            .count()
    }
}

#[async_trait]
impl Destination for ScriptedDestination {
    async fn execute(&self, call: OperationCall) -> Result<OperationReply, DestinationError> {
        let reply = (self.respond)(&call);
        self.calls.lock().unwrap().push(call);
        reply
    }
}

fn guid(call: &OperationCall) -> String {
    call.params
        .get("guid")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn ok_reply(call: &OperationCall) -> OperationReply {
    if call.operation.ends_with("Create_Application") {
        OperationReply::new(200, json!({"uid": format!("doc-{}", guid(call))}).to_string())
    } else {
        OperationReply::new(200, "{}")
    }
}

struct Harness {
    _dir: TempDir,
    engine: MigrationEngine,
    store: Arc<MigrationStore>,
}

fn harness(destination: Arc<ScriptedDestination>, max_attempts: u32) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MigrationStore::open(dir.path().join("ferry.db")).unwrap());
    let config = EngineConfig {
        max_attempts,
        ..Default::default()
    };
    let pool = PoolConfig {
        core_size: 2,
        max_size: 3,
        queue_capacity: 2,
        keep_alive: Duration::from_millis(50),
        name_prefix: "test-creation-".to_string(),
    };
    let engine = MigrationEngine::new(store.clone(), destination, config, pool);
    Harness {
        _dir: dir,
        engine,
        store,
    }
}

fn correspondence(guid: &str) -> SourceCorrespondence {
    SourceCorrespondence {
        guid: guid.to_string(),
        subject: Some(format!("Subject {}", guid)),
        ..Default::default()
    }
}

fn bundle(guids: &[&str]) -> SourceBundle {
    SourceBundle {
        correspondences: guids.iter().map(|g| correspondence(g)).collect(),
        ..Default::default()
    }
}

async fn prepared(h: &Harness, source: &SourceBundle) {
    h.engine.import_source(source).unwrap();
    let result = h.engine.run_phase(Phase::Prepare).await;
    assert_eq!(result.status, BatchStatus::Success, "{:?}", result);
}

#[tokio::test]
async fn test_partial_failure_in_creation() {
    let destination = ScriptedDestination::new(|call| {
        if guid(call) == "B" {
            Ok(OperationReply::new(500, "duplicate document"))
        } else {
            Ok(ok_reply(call))
        }
    });
    let h = harness(destination.clone(), 3);
    prepared(&h, &bundle(&["A", "B", "C"])).await;

    let result = h.engine.run_phase(Phase::Create).await;

    assert_eq!(result.status, BatchStatus::PartialSuccess);
    assert_eq!(result.total_records, 3);
    assert_eq!(result.successful_count, 2);
    assert_eq!(result.failed_count, 1);
    assert_eq!(result.errors, vec!["B: HTTP 500: duplicate document".to_string()]);

    let b = h.store.get(Phase::Create, "B").unwrap().unwrap();
    assert_eq!(b.status, RecordStatus::Failed);
    assert_eq!(b.attempt_count, 1);
    assert_eq!(b.destination_id, None);

    let a = h.store.get(Phase::Create, "A").unwrap().unwrap();
    assert_eq!(a.status, RecordStatus::Success);
    assert_eq!(a.destination_id.as_deref(), Some("doc-A"));
    assert_eq!(a.last_error, None);
    assert_eq!(a.step.as_deref(), Some("COMPLETED"));
    assert_eq!(destination.creations(), 3);
}

#[tokio::test]
async fn test_second_bulk_run_processes_nothing() {
    let destination = ScriptedDestination::succeeding();
    let h = harness(destination.clone(), 3);
    prepared(&h, &bundle(&["A", "B"])).await;

    let first = h.engine.run_phase(Phase::Create).await;
    assert_eq!(first.successful_count, 2);

    let second = h.engine.run_phase(Phase::Create).await;
    assert_eq!(second.status, BatchStatus::Success);
    assert_eq!(second.total_records, 0);
    assert_eq!(destination.creations(), 2);

    let again = h.engine.run_phase(Phase::Prepare).await;
    assert_eq!(again.total_records, 0);
}

#[tokio::test]
async fn test_selective_run_with_unknown_and_successful_ids() {
    let destination = ScriptedDestination::succeeding();
    let h = harness(destination.clone(), 3);
    prepared(&h, &bundle(&["A"])).await;
    h.engine.run_phase(Phase::Create).await;
    let calls_before = destination.call_count();

    let ids = vec!["A".to_string(), "ghost".to_string(), "ghost".to_string()];
    let result = h.engine.run_selected(Phase::Create, &ids, None).await;

    assert_eq!(result.failed_count, 1);
    assert_eq!(result.skipped_count, 1);
    assert_eq!(result.errors, vec!["ghost: not found".to_string()]);
    assert_eq!(result.status, BatchStatus::Failed);
    assert_eq!(destination.call_count(), calls_before);
}

#[tokio::test]
async fn test_override_reprocesses_and_audits() {
    let destination = ScriptedDestination::succeeding();
    let h = harness(destination.clone(), 3);
    prepared(&h, &bundle(&["A"])).await;
    h.engine.run_phase(Phase::Create).await;

    let by = Override {
        operator: "alice".to_string(),
        reason: "document deleted in destination".to_string(),
    };
    let result = h
        .engine
        .run_selected(Phase::Create, &["A".to_string()], Some(by))
        .await;

    assert_eq!(result.status, BatchStatus::Success);
    assert_eq!(result.successful_count, 1);
    assert_eq!(destination.creations(), 2);

    let audit = h.engine.overrides(Phase::Create).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].operator, "alice");
    assert_eq!(audit[0].previous_destination_id.as_deref(), Some("doc-A"));

    let a = h.store.get(Phase::Create, "A").unwrap().unwrap();
    assert_eq!(a.status, RecordStatus::Success);
    assert_eq!(a.attempt_count, 2);
}

#[tokio::test]
async fn test_exhausted_record_is_not_retried() {
    let destination = ScriptedDestination::new(|_| Ok(OperationReply::new(503, "unavailable")));
    let h = harness(destination.clone(), 1);
    prepared(&h, &bundle(&["A"])).await;

    let first = h.engine.run_phase(Phase::Create).await;
    assert_eq!(first.status, BatchStatus::Failed);
    assert_eq!(destination.call_count(), 1);

    let retry = h.engine.retry_phase(Phase::Create).await;
    assert_eq!(retry.total_records, 0);

    let named = h
        .engine
        .run_selected(Phase::Create, &["A".to_string()], None)
        .await;
    assert_eq!(named.failed_count, 1);
    assert!(named.errors[0].contains("attempt limit reached"));

    assert_eq!(destination.call_count(), 1);
    let a = h.store.get(Phase::Create, "A").unwrap().unwrap();
    assert_eq!(a.attempt_count, 1);
    assert_eq!(a.status, RecordStatus::Failed);

    let stats = h.engine.phase_statistics(Phase::Create);
    assert_eq!(stats.counts.permanently_failed, 1);
    assert_eq!(stats.counts.failed, 0);
}

#[tokio::test]
async fn test_retry_accumulates_attempts() {
    let failures = Arc::new(Mutex::new(1));
    let remaining = failures.clone();
    let destination = ScriptedDestination::new(move |call| {
        let mut remaining = remaining.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            Err(DestinationError::InvalidResponse("connection reset".to_string()))
        } else {
            Ok(ok_reply(call))
        }
    });
    let h = harness(destination, 3);
    prepared(&h, &bundle(&["A"])).await;

    let first = h.engine.run_phase(Phase::Create).await;
    assert!(first.errors[0].starts_with("A: transport error"));

    let retry = h.engine.retry_all().await;
    assert_eq!(retry.status, BatchStatus::Success);
    assert_eq!(retry.successful_count, 1);

    let a = h.store.get(Phase::Create, "A").unwrap().unwrap();
    assert_eq!(a.status, RecordStatus::Success);
    assert_eq!(a.attempt_count, 2);
    assert_eq!(a.last_error, None);
}

#[tokio::test]
async fn test_creation_without_document_id_fails() {
    let destination = ScriptedDestination::new(|_| Ok(OperationReply::new(200, "{}")));
    let h = harness(destination, 3);
    let mut source = bundle(&["A"]);
    source.transactions.push(SourceTransaction {
        guid: "tx-1".to_string(),
        correspondence_guid: "A".to_string(),
        action_id: 12,
        ..Default::default()
    });
    prepared(&h, &source).await;

    let result = h.engine.run_phase(Phase::Create).await;
    assert_eq!(result.errors, vec!["A: no document id in response".to_string()]);
    assert_eq!(h.store.get(Phase::Assign, "tx-1").unwrap(), None);
}

#[tokio::test]
async fn test_successors_follow_creation() {
    let destination = ScriptedDestination::succeeding();
    let h = harness(destination.clone(), 3);

    let mut source = bundle(&["A"]);
    source.correspondences[0].is_final = true;
    source.transactions = vec![
        SourceTransaction {
            guid: "tx-assign".to_string(),
            correspondence_guid: "A".to_string(),
            action_id: 12,
            to_user: Some("clerk".to_string()),
            ..Default::default()
        },
        SourceTransaction {
            guid: "tx-log".to_string(),
            correspondence_guid: "A".to_string(),
            action_id: 3,
            action_name: Some("Forward".to_string()),
            notes: Some("<p>sent on</p>".to_string()),
            ..Default::default()
        },
    ];
    source.comments = vec![SourceComment {
        guid: "cm-1".to_string(),
        correspondence_guid: "A".to_string(),
        text: Some("Noted".to_string()),
        ..Default::default()
    }];
    prepared(&h, &source).await;

    h.engine.run_phase(Phase::Create).await;
    for phase in [Phase::Assign, Phase::BusinessLog, Phase::Comment, Phase::Close] {
        let result = h.engine.run_phase(phase).await;
        assert_eq!(result.status, BatchStatus::Success, "{}", phase);
        assert_eq!(result.successful_count, 1, "{}", phase);
    }

    let calls = destination.calls();
    let operations: Vec<&str> = calls.iter().map(|c| c.operation.as_str()).collect();
    assert_eq!(
        operations,
        vec![
            "AC_UA_IncomingCorrespondence_Create_Application",
            "AC_UA_IncomingCorrespondence_ReadyToRegister",
            "AC_UA_IncomingCorrespondence_Register_WithReference",
            "AC_UA_IncomingCorrespondence_StartWork",
            "AC_UA_Correspondence_SetOwner",
            "AC_UA_Assignment_Create",
            "Document.CreateBusinessLog",
            "Document.CreateCustomComment",
            "AC_UA_IncomingCorrespondence_Close",
        ]
    );
    assert!(calls[1..].iter().all(|c| c.params["docID"] == "doc-A"));
    assert_eq!(calls[6].params["eventComment"], "sent on");
    assert_eq!(calls[5].body()["context"]["assignment"]["assign:assignee"], json!(["clerk"]));

    let stats = h.engine.statistics();
    assert_eq!(stats.totals.completed, 6);
    assert_eq!(stats.totals.total, 6);
}

#[tokio::test]
async fn test_dependent_phase_waits_for_creation() {
    let destination = ScriptedDestination::succeeding();
    let h = harness(destination.clone(), 3);
    prepared(&h, &bundle(&["A"])).await;
    h.store
        .seed(&[NewRecord::new(Phase::Assign, "tx-early", "A", json!({"guid": "tx-early"}))])
        .unwrap();

    let bulk = h.engine.run_phase(Phase::Assign).await;
    assert_eq!(bulk.total_records, 0);

    let named = h
        .engine
        .run_selected(Phase::Assign, &["tx-early".to_string()], None)
        .await;
    assert_eq!(named.errors, vec!["tx-early: CREATE not completed".to_string()]);
    assert_eq!(destination.call_count(), 0);

    let record = h.store.get(Phase::Assign, "tx-early").unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Pending);
    assert_eq!(record.attempt_count, 0);
}

#[tokio::test]
async fn test_excluded_correspondence_is_skipped() {
    let destination = ScriptedDestination::succeeding();
    let h = harness(destination.clone(), 3);
    let mut source = bundle(&["A", "D"]);
    source.correspondences[1].deleted = true;
    h.engine.import_source(&source).unwrap();

    let result = h.engine.run_phase(Phase::Prepare).await;
    assert_eq!(result.status, BatchStatus::Success);
    assert_eq!(result.successful_count, 1);
    assert_eq!(result.skipped_count, 1);

    let d = h.store.get(Phase::Prepare, "D").unwrap().unwrap();
    assert_eq!(d.status, RecordStatus::Skipped);
    assert_eq!(d.last_error.as_deref(), Some("correspondence is deleted"));
    assert_eq!(h.store.get(Phase::Create, "D").unwrap(), None);
}

#[tokio::test]
async fn test_statistics_on_empty_store() {
    let h = harness(ScriptedDestination::succeeding(), 3);
    let stats = h.engine.statistics();

    assert!(stats.errors.is_empty());
    assert_eq!(stats.totals.total, 0);
    assert_eq!(stats.totals.completed, 0);
    assert!(stats.phases.iter().all(|p| p.counts.total == 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_runs_never_double_process() {
    let destination = ScriptedDestination::succeeding();
    let h = Arc::new(harness(destination.clone(), 3));
    let guids: Vec<String> = (0..30).map(|i| format!("c-{:02}", i)).collect();
    let refs: Vec<&str> = guids.iter().map(String::as_str).collect();
    prepared(&h, &bundle(&refs)).await;

    let (first, second) = tokio::join!(
        h.engine.run_phase(Phase::Create),
        h.engine.run_phase(Phase::Create)
    );

    assert_eq!(first.successful_count + second.successful_count, 30);
    assert_eq!(destination.creations(), 30);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_creation_walks_every_step() {
    let destination = ScriptedDestination::succeeding();
    let h = harness(destination.clone(), 3);
    let mut source = bundle(&["A"]);
    source.correspondences[0].other_attachments = vec![SourceAttachment {
        guid: Some("att-1".to_string()),
        file_name: "annex.pdf".to_string(),
        content: "aGVsbG8=".to_string(),
        ..Default::default()
    }];
    source.correspondences[0].manual_attachments = Some("1 folder".to_string());
    prepared(&h, &source).await;

    let result = h.engine.run_phase(Phase::Create).await;
    assert_eq!(result.status, BatchStatus::Success);

    let operations: Vec<String> = destination.calls().into_iter().map(|c| c.operation).collect();
    assert_eq!(
        operations,
        vec![
            "AC_UA_IncomingCorrespondence_Create_Application",
            "AC_UA_Correspondence_Attach_Create",
            "AC_UA_PhysicalAttachment_Add",
            "AC_UA_IncomingCorrespondence_ReadyToRegister",
            "AC_UA_IncomingCorrespondence_Register_WithReference",
            "AC_UA_IncomingCorrespondence_StartWork",
            "AC_UA_Correspondence_SetOwner",
        ]
    );
    let a = h.store.get(Phase::Create, "A").unwrap().unwrap();
    assert_eq!(a.destination_id.as_deref(), Some("doc-A"));
    assert_eq!(a.step.as_deref(), Some("COMPLETED"));
}

#[tokio::test]
async fn test_failed_step_resumes_without_recreating() {
    let failures = Arc::new(Mutex::new(1));
    let remaining = failures.clone();
    let destination = ScriptedDestination::new(move |call| {
        let mut remaining = remaining.lock().unwrap();
        if call.operation.ends_with("StartWork") && *remaining > 0 {
            *remaining -= 1;
            Ok(OperationReply::new(500, "workflow busy"))
        } else {
            Ok(ok_reply(call))
        }
    });
    let h = harness(destination.clone(), 3);
    let mut source = bundle(&["A"]);
    source.transactions.push(SourceTransaction {
        guid: "tx-1".to_string(),
        correspondence_guid: "A".to_string(),
        action_id: 12,
        ..Default::default()
    });
    prepared(&h, &source).await;

    let first = h.engine.run_phase(Phase::Create).await;
    assert_eq!(first.errors, vec!["A: START_WORK failed: HTTP 500: workflow busy".to_string()]);
    let a = h.store.get(Phase::Create, "A").unwrap().unwrap();
    assert_eq!(a.status, RecordStatus::Failed);
    assert_eq!(a.destination_id.as_deref(), Some("doc-A"));
    assert_eq!(a.step.as_deref(), Some("START_WORK"));
    assert_eq!(h.store.get(Phase::Assign, "tx-1").unwrap(), None);

    let retry = h.engine.retry_phase(Phase::Create).await;
    assert_eq!(retry.status, BatchStatus::Success);

    assert_eq!(destination.creations(), 1);
    assert_eq!(destination.operation_count("StartWork"), 2);
    assert_eq!(destination.operation_count("ReadyToRegister"), 1);
    let a = h.store.get(Phase::Create, "A").unwrap().unwrap();
    assert_eq!(a.status, RecordStatus::Success);
    assert_eq!(a.destination_id.as_deref(), Some("doc-A"));
    assert_eq!(a.attempt_count, 2);
    assert!(h.store.get(Phase::Assign, "tx-1").unwrap().is_some());
}
