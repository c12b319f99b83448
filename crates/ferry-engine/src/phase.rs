//! Per-phase request building and reply classification.
//!
//! Every phase runs through the same template in the executor; this module
//! supplies the two phase-specific pieces: what to send (or resolve locally)
//! for a work item, and how to read the destination's reply.

use std::sync::LazyLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use ferry_destination::{DestinationError, FileAttachment, OperationCall, OperationReply};
use ferry_store::{
    MigrationStore, NewRecord, Phase, RecordOutcome, SourceAttachment, SourceComment,
    SourceCorrespondence, SourceTransaction, StoreError, WorkItem,
};

use crate::config::EngineConfig;
use crate::creation::CreationRun;

pub const CREATE_OPERATION: &str = "AC_UA_IncomingCorrespondence_Create_Application";
pub const ASSIGN_OPERATION: &str = "AC_UA_Assignment_Create";
pub const BUSINESS_LOG_OPERATION: &str = "Document.CreateBusinessLog";
pub const COMMENT_OPERATION: &str = "Document.CreateCustomComment";
pub const CLOSE_OPERATION: &str = "AC_UA_IncomingCorrespondence_Close";

/// Context object that carries the correspondence fields and its file.
pub(crate) const CORRESPONDENCE_CONTEXT: &str = "incCorrespondence";

/// Reply bodies quoted in errors are cut to this many characters.
const MAX_ERROR_BODY: usize = 500;

/// Payload of a CREATE record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePayload {
    pub correspondence: SourceCorrespondence,
    pub need_to_close: bool,
}

/// Payload of a CLOSE record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePayload {
    pub close_date: Option<DateTime<Utc>>,
    pub creating_user: Option<String>,
}

/// What to do for one claimed work item.
#[derive(Debug)]
pub enum Plan {
    /// Resolved without calling the destination.
    Local {
        outcome: RecordOutcome,
        successors: Vec<NewRecord>,
    },
    /// Call the destination; `successors` are spawned if the call succeeds.
    Remote {
        call: OperationCall,
        successors: Vec<NewRecord>,
    },
    /// Create the correspondence step by step; `successors` are spawned once
    /// every step has succeeded.
    Creation {
        run: CreationRun,
        successors: Vec<NewRecord>,
    },
}

impl Plan {
    fn fail(reason: impl Into<String>) -> Self {
        Plan::Local {
            outcome: RecordOutcome::failure(reason),
            successors: Vec::new(),
        }
    }
}

/// Build the plan for a claimed work item.
///
/// Source reads happen here, before any remote call, so a remote success is
/// never followed by a failed lookup of its successors.
pub fn plan(
    phase: Phase,
    item: &WorkItem,
    store: &MigrationStore,
    config: &EngineConfig,
) -> Result<Plan, StoreError> {
    let record = &item.record;
    let doc_id = item.upstream_destination_id.as_deref();

    if phase.needs_destination_id() && doc_id.is_none() {
        return Ok(Plan::fail("no destination id for the created correspondence"));
    }
    let doc_id = doc_id.unwrap_or_default();

    match phase {
        Phase::Prepare => prepare(&record.source_id, store),
        Phase::Create => {
            let payload: CreatePayload = match decode(&record.payload) {
                Ok(payload) => payload,
                Err(plan) => return Ok(plan),
            };
            create(payload, item, store)
        }
        Phase::Assign => Ok(match decode::<SourceTransaction>(&record.payload) {
            Ok(tx) => remote(assign_call(&tx, doc_id, config)),
            Err(plan) => plan,
        }),
        Phase::BusinessLog => Ok(match decode::<SourceTransaction>(&record.payload) {
            Ok(tx) => remote(business_log_call(&tx, doc_id, config)),
            Err(plan) => plan,
        }),
        Phase::Comment => Ok(match decode::<SourceComment>(&record.payload) {
            Ok(comment) => remote(comment_call(&comment, doc_id, config)),
            Err(plan) => plan,
        }),
        Phase::Close => Ok(match decode::<ClosePayload>(&record.payload) {
            Ok(close) => remote(close_call(&close, doc_id, config)),
            Err(plan) => plan,
        }),
    }
}

fn remote(call: OperationCall) -> Plan {
    Plan::Remote {
        call,
        successors: Vec::new(),
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T, Plan> {
    serde_json::from_value(payload.clone()).map_err(|e| Plan::fail(format!("invalid payload: {}", e)))
}

// =============================================================================
// PREPARE
// =============================================================================

fn prepare(guid: &str, store: &MigrationStore) -> Result<Plan, StoreError> {
    let Some(correspondence) = store.source_correspondence(guid)? else {
        return Ok(Plan::fail("source correspondence not found"));
    };

    if let Some(reason) = correspondence.exclusion_reason() {
        return Ok(Plan::Local {
            outcome: RecordOutcome::Skipped {
                reason: reason.to_string(),
            },
            successors: Vec::new(),
        });
    }

    let need_to_close = correspondence.needs_closing();
    let payload = CreatePayload {
        correspondence,
        need_to_close,
    };
    Ok(Plan::Local {
        outcome: RecordOutcome::Success {
            destination_id: None,
        },
        successors: vec![NewRecord::new(
            Phase::Create,
            guid,
            guid,
            serde_json::to_value(&payload)?,
        )],
    })
}

// =============================================================================
// CREATE
// =============================================================================

fn create(payload: CreatePayload, item: &WorkItem, store: &MigrationStore) -> Result<Plan, StoreError> {
    let corr = &payload.correspondence;
    let guid = corr.guid.as_str();

    let mut successors = Vec::new();
    for tx in store.source_transactions(guid)? {
        let phase = if tx.is_assignment() {
            Phase::Assign
        } else {
            Phase::BusinessLog
        };
        successors.push(NewRecord::new(phase, &tx.guid, guid, serde_json::to_value(&tx)?));
    }
    for comment in store.source_comments(guid)? {
        successors.push(NewRecord::new(
            Phase::Comment,
            &comment.guid,
            guid,
            serde_json::to_value(&comment)?,
        ));
    }
    if payload.need_to_close {
        let close = ClosePayload {
            close_date: corr.close_date,
            creating_user: corr.creating_user.clone(),
        };
        successors.push(NewRecord::new(Phase::Close, guid, guid, serde_json::to_value(&close)?));
    }

    Ok(Plan::Creation {
        run: CreationRun::new(payload, &item.record),
        successors,
    })
}

/// Decode a source file for upload into the `context_key` context object.
pub(crate) fn file_attachment(
    file: &SourceAttachment,
    context_key: &str,
) -> Result<FileAttachment, DestinationError> {
    FileAttachment::from_base64(
        &file.file_name,
        file.mime_type.as_deref().unwrap_or("application/octet-stream"),
        &file.content,
        context_key,
    )
}

pub fn create_call(corr: &SourceCorrespondence, config: &EngineConfig) -> OperationCall {
    OperationCall::new(CREATE_OPERATION)
        .param("asUser", user(corr.creating_user.as_deref(), config))
        .param("guid", corr.guid.as_str())
        .param("docDate", format_date(corr.document_date))
        .context(CORRESPONDENCE_CONTEXT, correspondence_fields(corr, config))
}

/// Correspondence fields as the destination names them.
pub(crate) fn correspondence_fields(corr: &SourceCorrespondence, config: &EngineConfig) -> Value {
    let document_date = format_date(corr.document_date);
    json!({
        "corr:subject": corr.subject.clone().unwrap_or_default(),
        "corr:externalCorrespondenceNumber": corr.external_reference.clone().unwrap_or_default(),
        "corr:remarks": corr.notes.as_deref().map(clean_html).unwrap_or_default(),
        "corr:referenceNumber": corr.reference_number.clone().unwrap_or_default(),
        "corr:category": map_category(corr.category.as_deref()),
        "corr:secrecyLevel": corr.secrecy_level.clone().unwrap_or_else(|| "Normal".to_string()),
        "corr:priority": corr.priority.clone().unwrap_or_else(|| "N".to_string()),
        "corr:gDueDate": corr.due_date.map(|d| format_date(Some(d))),
        "corr:requireReply": corr.require_reply,
        "corr:from": "",
        "corr:fromAgency": corr.sending_agency.clone().unwrap_or_default(),
        "corr:gDocumentDate": document_date,
        "corr:gDate": document_date,
        "corr:delivery": "unknown",
        "corr:to": department(corr.target_department.as_deref(), config),
        "corr:toAgency": config.tenant,
    })
}

// =============================================================================
// ASSIGN, BUSINESS_LOG, COMMENT, CLOSE
// =============================================================================

pub fn assign_call(tx: &SourceTransaction, doc_id: &str, config: &EngineConfig) -> OperationCall {
    let dept = department(tx.to_department.as_deref(), config);
    let assignee = non_blank(tx.to_user.as_deref()).unwrap_or(&dept).to_string();
    let action_date = format_date(tx.action_date);

    OperationCall::new(ASSIGN_OPERATION)
        .param("asUser", config.default_user.as_str())
        .param("docID", doc_id)
        .param("docDate", action_date.as_str())
        .param("guid", tx.guid.as_str())
        .param("docCreator", user(tx.from_user.as_deref(), config))
        .param("updateProp", json!({}))
        .context(
            "assignment",
            json!({
                "title": format!("assignment-{}", tx.guid),
                "assign:assignee": [assignee],
                "assign:department": dept,
                "assign:dueDate": action_date,
                "assign:action": map_action(tx.decision.as_deref()),
                "assign:private": false,
                "assign:canReAssign": false,
            }),
        )
        .context("tenantId", config.tenant.as_str())
        .context("isReadOnly", "true")
}

pub fn business_log_call(tx: &SourceTransaction, doc_id: &str, config: &EngineConfig) -> OperationCall {
    let action_date = format_date(tx.action_date);

    OperationCall::new(BUSINESS_LOG_OPERATION)
        .param("docID", doc_id)
        .param("docDate", action_date.as_str())
        .param("guid", tx.guid.as_str())
        .param("eventCategory", "document")
        .param("eventName", tx.action_name.clone().unwrap_or_else(|| format!("action-{}", tx.action_id)))
        .param("eventDate", action_date.as_str())
        .param("eventTypes", "userEvent")
        .param("eventComment", tx.notes.as_deref().map(clean_html).unwrap_or_default())
        .param("documentTypes", "IncomingCorrespondence")
        .param("extendedInfo", Value::Null)
        .param("currentLifeCycle", "draft")
        .param("person", user(tx.from_user.as_deref(), config))
}

pub fn comment_call(comment: &SourceComment, doc_id: &str, config: &EngineConfig) -> OperationCall {
    let date = format_date(comment.created_date);

    OperationCall::new(COMMENT_OPERATION)
        .param("docID", doc_id)
        .param("docDate", date.as_str())
        .param("guid", comment.guid.as_str())
        .param("author", user(comment.author.as_deref(), config))
        .param("date", date.as_str())
        .param("text", comment.text.as_deref().map(clean_html).unwrap_or_default())
}

pub fn close_call(close: &ClosePayload, doc_id: &str, config: &EngineConfig) -> OperationCall {
    let creator = user(close.creating_user.as_deref(), config);

    OperationCall::new(CLOSE_OPERATION)
        .param("asUser", creator.as_str())
        .param("docID", doc_id)
        .param("docCreator", creator.as_str())
        .param("updateProp", json!({"corr:closeDate": format_date(close.close_date)}))
        .context("tenantId", config.tenant.as_str())
}

// =============================================================================
// Reply classification
// =============================================================================

/// Turn a destination reply into a record outcome.
pub fn classify(phase: Phase, reply: &OperationReply) -> RecordOutcome {
    if let Some(error) = reply_error(reply) {
        return RecordOutcome::failure(error);
    }

    let body = reply.json();
    let destination_id = body
        .as_ref()
        .and_then(|b| b.get("uid"))
        .and_then(Value::as_str)
        .filter(|uid| !uid.is_empty())
        .map(str::to_string);

    if phase == Phase::Create && destination_id.is_none() {
        return RecordOutcome::failure("no document id in response");
    }

    RecordOutcome::Success { destination_id }
}

/// Why a reply counts as a failure, if it does.
pub fn reply_error(reply: &OperationReply) -> Option<String> {
    if !reply.is_success() {
        return Some(format!("HTTP {}: {}", reply.status, truncate(&reply.body)));
    }

    let body = reply.json()?;
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        return Some(format!("operation reported failure: {}", truncate(&reply.body)));
    }
    ["error", "errorMessage"].into_iter().find_map(|key| {
        body.get(key)
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .map(|message| format!("operation error: {}", message))
    })
}

fn truncate(body: &str) -> String {
    if body.chars().count() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let cut: String = body.chars().take(MAX_ERROR_BODY).collect();
    format!("{}...", cut)
}

// =============================================================================
// Field mapping
// =============================================================================

static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Strip tags and collapse whitespace.
pub fn clean_html(text: &str) -> String {
    let stripped = HTML_TAG.replace_all(text, " ");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">");
    WHITESPACE.replace_all(decoded.trim(), " ").into_owned()
}

/// Destination date format: UTC, second precision, `Z` suffix.
pub fn format_date(date: Option<DateTime<Utc>>) -> String {
    date.unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Legacy decision GUID to assignment action.
pub fn map_action(decision: Option<&str>) -> &'static str {
    match decision.map(|d| d.trim().to_ascii_lowercase()).as_deref() {
        Some("5ed900bc-a5f1-41cd-8f4f-0f05b7ef67c2") => "ForInformation",
        Some("1225fe27-5841-48e6-a47b-4cc9d9770fa6") => "Toproceed",
        Some("a93aa474-7a3a-4d9a-8c15-6a3bcd706b51") => "ToTakeNeededAction",
        Some("5379d40a-2726-4372-ab80-9564586e0458") => "FYI",
        Some("2fb05e63-896a-4c9b-a99f-bca4deccc6ac") => "ForSaving",
        _ => "ForAdvice",
    }
}

/// Legacy category GUID to category code.
pub fn map_category(category: Option<&str>) -> &'static str {
    match category.map(|c| c.trim().to_ascii_lowercase()).as_deref() {
        Some("01b1a89b-dff0-4040-878e-02c3fd4d7925") => "AwardDecision",
        Some("06841b0a-f569-40c5-91d5-276c7f8c532b") => "AccessPermit",
        Some("00a91759-734c-4be5-8a11-96e69dfae5a0") => "WorkAssignment",
        Some("29f2cf7c-3a43-44cb-9ac7-b5570c760c60") => "Promotion",
        Some("0bfa3e9c-682b-41c4-a275-ba395b52b0f7") => "Circular",
        Some("26878084-7736-4935-88cb-d4312c2324f9") => "Private",
        Some("87b623f9-eeeb-4829-8f8e-dc54d1fb242e") => "PurchaseContract",
        Some("6dcc58c0-ebca-46b0-afb1-e96a4f1ebb7c") => "PeriodicReport",
        _ => "General",
    }
}

pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub(crate) fn user(value: Option<&str>, config: &EngineConfig) -> String {
    non_blank(value).unwrap_or(&config.default_user).to_string()
}

pub(crate) fn department(value: Option<&str>, config: &EngineConfig) -> String {
    non_blank(value).unwrap_or(&config.default_department).to_string()
}
