//! Step-by-step creation of a correspondence in the destination.
//!
//! Creating the document is only the first step. The follow-up steps attach
//! the remaining files and walk the document through registration. The
//! executor saves the step it is about to run on the record, so an attempt
//! that fails after the document exists resumes from that step on retry
//! instead of creating the document a second time.

use std::fmt;
use std::str::FromStr;

use serde_json::json;

use ferry_destination::{DestinationError, FileAttachment, OperationCall};
use ferry_store::{MigrationRecord, RecordStatus};

use crate::config::EngineConfig;
use crate::phase::{self, CreatePayload, CORRESPONDENCE_CONTEXT};

pub const ATTACH_OPERATION: &str = "AC_UA_Correspondence_Attach_Create";
pub const PHYSICAL_ATTACHMENT_OPERATION: &str = "AC_UA_PhysicalAttachment_Add";
pub const READY_TO_REGISTER_OPERATION: &str = "AC_UA_IncomingCorrespondence_ReadyToRegister";
pub const REGISTER_OPERATION: &str = "AC_UA_IncomingCorrespondence_Register_WithReference";
pub const START_WORK_OPERATION: &str = "AC_UA_IncomingCorrespondence_StartWork";
pub const SET_OWNER_OPERATION: &str = "AC_UA_Correspondence_SetOwner";

/// Step saved once every creation step has succeeded.
pub const COMPLETED: &str = "COMPLETED";

/// Context object that receives an additional attachment's file.
const ATTACHMENT_CONTEXT: &str = "attachment";

/// One step of creating a correspondence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CreationStep {
    CreateCorrespondence,
    UploadOtherAttachments,
    CreatePhysicalAttachment,
    SetReadyToRegister,
    RegisterWithReference,
    StartWork,
    SetOwner,
}

impl CreationStep {
    pub const ALL: [CreationStep; 7] = [
        CreationStep::CreateCorrespondence,
        CreationStep::UploadOtherAttachments,
        CreationStep::CreatePhysicalAttachment,
        CreationStep::SetReadyToRegister,
        CreationStep::RegisterWithReference,
        CreationStep::StartWork,
        CreationStep::SetOwner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CreationStep::CreateCorrespondence => "CREATE_CORRESPONDENCE",
            CreationStep::UploadOtherAttachments => "UPLOAD_OTHER_ATTACHMENTS",
            CreationStep::CreatePhysicalAttachment => "CREATE_PHYSICAL_ATTACHMENT",
            CreationStep::SetReadyToRegister => "SET_READY_TO_REGISTER",
            CreationStep::RegisterWithReference => "REGISTER_WITH_REFERENCE",
            CreationStep::StartWork => "START_WORK",
            CreationStep::SetOwner => "SET_OWNER",
        }
    }
}

impl fmt::Display for CreationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CreationStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CreationStep::ALL
            .into_iter()
            .find(|step| step.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown creation step: {}", s))
    }
}

/// The steps one attempt runs for a CREATE record.
#[derive(Debug)]
pub struct CreationRun {
    pub payload: CreatePayload,
    /// Steps still to run, in order.
    pub steps: Vec<CreationStep>,
    /// Document created by an earlier attempt, when resuming.
    pub document_id: Option<String>,
}

impl CreationRun {
    /// Plan the attempt from the record as it was before the claim.
    ///
    /// A FAILED record that already has a document and got past the create
    /// step resumes at the step it stopped on. Anything else, including a
    /// SUCCESS record re-run by override, starts from the create step.
    pub fn new(payload: CreatePayload, record: &MigrationRecord) -> Self {
        let resume = match (record.status, record.destination_id.as_deref(), record.step.as_deref()) {
            (RecordStatus::Failed, Some(document_id), Some(saved)) => {
                remaining_steps(saved).map(|steps| (document_id.to_string(), steps))
            }
            _ => None,
        };

        match resume {
            Some((document_id, steps)) => Self {
                payload,
                steps,
                document_id: Some(document_id),
            },
            None => Self {
                payload,
                steps: CreationStep::ALL.to_vec(),
                document_id: None,
            },
        }
    }

    /// The create call, with the primary file attached.
    fn create_call(&self, config: &EngineConfig) -> Result<OperationCall, DestinationError> {
        let corr = &self.payload.correspondence;
        let attachment = corr
            .attachment
            .as_ref()
            .map(|file| phase::file_attachment(file, CORRESPONDENCE_CONTEXT))
            .transpose()?;
        Ok(phase::create_call(corr, config).attach(attachment))
    }

    /// Calls for one step. Every step but the create step runs against
    /// `doc_id`.
    ///
    /// A step may need no calls at all, such as a correspondence without
    /// additional or paper attachments.
    pub fn calls(
        &self,
        step: CreationStep,
        doc_id: &str,
        config: &EngineConfig,
    ) -> Result<Vec<OperationCall>, DestinationError> {
        let corr = &self.payload.correspondence;
        let creator = phase::user(corr.creating_user.as_deref(), config);

        let calls = match step {
            CreationStep::CreateCorrespondence => vec![self.create_call(config)?],
            CreationStep::UploadOtherAttachments => {
                let mut calls = Vec::with_capacity(corr.other_attachments.len());
                for (index, file) in corr.other_attachments.iter().enumerate() {
                    let guid = phase::non_blank(file.guid.as_deref())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("{}-attachment-{}", corr.guid, index + 1));
                    let upload = phase::file_attachment(file, ATTACHMENT_CONTEXT)?;
                    let call = attach_call(upload, &guid, file.caption.as_deref(), doc_id, &creator, config)
                        .param("docDate", phase::format_date(corr.document_date));
                    calls.push(call);
                }
                calls
            }
            CreationStep::CreatePhysicalAttachment => match phase::non_blank(corr.manual_attachments.as_deref()) {
                Some(description) => vec![
                    OperationCall::new(PHYSICAL_ATTACHMENT_OPERATION)
                        .param("docID", doc_id)
                        .param("asUser", config.default_user.as_str())
                        .param("docCreator", creator.as_str())
                        .context("physicalAttachments", description)
                        .context("tenantId", config.tenant.as_str()),
                ],
                None => Vec::new(),
            },
            CreationStep::SetReadyToRegister => vec![
                OperationCall::new(READY_TO_REGISTER_OPERATION)
                    .param("asUser", creator.as_str())
                    .param("docID", doc_id)
                    .context("tenantId", config.tenant.as_str()),
            ],
            CreationStep::RegisterWithReference => vec![
                OperationCall::new(REGISTER_OPERATION)
                    .param("asUser", creator.as_str())
                    .param("docID", doc_id)
                    .param("toDepartment", phase::department(corr.target_department.as_deref(), config))
                    .context(CORRESPONDENCE_CONTEXT, phase::correspondence_fields(corr, config))
                    .context("tenantId", config.tenant.as_str()),
            ],
            CreationStep::StartWork => vec![
                OperationCall::new(START_WORK_OPERATION)
                    .param("asUser", creator.as_str())
                    .param("docID", doc_id)
                    .context("tenantId", config.tenant.as_str()),
            ],
            CreationStep::SetOwner => vec![
                OperationCall::new(SET_OWNER_OPERATION)
                    .param("asUser", config.default_user.as_str())
                    .param("docID", doc_id)
                    .param("docCreator", creator.as_str())
                    .context("tenantId", config.tenant.as_str())
                    .context("docCreator", creator.as_str()),
            ],
        };
        Ok(calls)
    }
}

/// Steps left after stopping on `saved`, or `None` to start over.
///
/// After `COMPLETED` nothing is left and only the outcome is recorded.
fn remaining_steps(saved: &str) -> Option<Vec<CreationStep>> {
    if saved == COMPLETED {
        return Some(Vec::new());
    }
    match saved.parse::<CreationStep>() {
        Ok(CreationStep::CreateCorrespondence) | Err(_) => None,
        Ok(from) => Some(CreationStep::ALL.into_iter().filter(|step| *step >= from).collect()),
    }
}

fn attach_call(
    upload: FileAttachment,
    guid: &str,
    caption: Option<&str>,
    doc_id: &str,
    creator: &str,
    config: &EngineConfig,
) -> OperationCall {
    OperationCall::new(ATTACH_OPERATION)
        .param("asUser", config.default_user.as_str())
        .param("docID", doc_id)
        .param("guid", guid)
        .param("docCreator", creator)
        .context(
            ATTACHMENT_CONTEXT,
            json!({
                "title": upload.file_name,
                "corr_attach:attachmentId": guid,
                "corr_attach:remarks": caption.unwrap_or_default(),
                "corr_attach:isObject": false,
                "corr_attach:count": 1,
            }),
        )
        .context("tenantId", config.tenant.as_str())
        .attach(Some(upload))
}
