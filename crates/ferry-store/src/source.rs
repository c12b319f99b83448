//! Legacy source catalog types.
//!
//! These mirror what the legacy store exports. They are imported once as a
//! [`SourceBundle`] and read back by the PREPARE and CREATE phases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Legacy action id that denotes an assignment.
pub const ASSIGNMENT_ACTION: i64 = 12;

/// A legacy incoming correspondence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceCorrespondence {
    pub guid: String,
    pub subject: Option<String>,
    pub reference_number: Option<String>,
    pub external_reference: Option<String>,
    pub notes: Option<String>,
    pub document_date: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub category: Option<String>,
    pub secrecy_level: Option<String>,
    pub priority: Option<String>,
    pub sending_agency: Option<String>,
    pub target_department: Option<String>,
    pub require_reply: bool,
    pub creating_user: Option<String>,
    pub deleted: bool,
    pub draft: bool,
    pub canceled: bool,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub archived: bool,
    pub close_date: Option<DateTime<Utc>>,
    pub attachment: Option<SourceAttachment>,
    /// Attachments besides the primary file, added after creation.
    pub other_attachments: Vec<SourceAttachment>,
    /// Free-text description of paper attachments, if any.
    pub manual_attachments: Option<String>,
}

impl SourceCorrespondence {
    /// Why this correspondence should not be migrated, if anything.
    pub fn exclusion_reason(&self) -> Option<&'static str> {
        if self.deleted {
            Some("correspondence is deleted")
        } else if self.draft {
            Some("correspondence is a draft")
        } else if self.canceled {
            Some("correspondence is canceled")
        } else {
            None
        }
    }

    /// Final or archived correspondences are closed after creation.
    pub fn needs_closing(&self) -> bool {
        self.is_final || self.archived
    }
}

/// A file attached to a correspondence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceAttachment {
    #[serde(default)]
    pub guid: Option<String>,
    pub file_name: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Base64-encoded file content.
    pub content: String,
}

/// A legacy workflow transaction on a correspondence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceTransaction {
    pub guid: String,
    pub correspondence_guid: String,
    pub action_id: i64,
    pub action_name: Option<String>,
    pub from_user: Option<String>,
    pub to_user: Option<String>,
    pub to_department: Option<String>,
    pub decision: Option<String>,
    pub notes: Option<String>,
    pub action_date: Option<DateTime<Utc>>,
}

impl SourceTransaction {
    pub fn is_assignment(&self) -> bool {
        self.action_id == ASSIGNMENT_ACTION
    }
}

/// A legacy comment on a correspondence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceComment {
    pub guid: String,
    pub correspondence_guid: String,
    pub comment_type: Option<String>,
    pub text: Option<String>,
    pub author: Option<String>,
    pub created_date: Option<DateTime<Utc>>,
}

/// An export of the legacy store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceBundle {
    pub correspondences: Vec<SourceCorrespondence>,
    pub transactions: Vec<SourceTransaction>,
    pub comments: Vec<SourceComment>,
}

/// Counts of imported source items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub correspondences: usize,
    pub transactions: usize,
    pub comments: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_parses_camel_case() {
        let json = r#"{
            "correspondences": [{
                "guid": "c-1",
                "subject": "Budget request",
                "requireReply": true,
                "final": true,
                "attachment": {"fileName": "letter.pdf", "content": "aGVsbG8="},
                "otherAttachments": [{"guid": "att-2", "fileName": "annex.pdf", "content": "aGk="}],
                "manualAttachments": "1 folder"
            }],
            "transactions": [{"guid": "t-1", "correspondenceGuid": "c-1", "actionId": 12}],
            "comments": []
        }"#;

        let bundle: SourceBundle = serde_json::from_str(json).unwrap();
        let corr = &bundle.correspondences[0];
        assert!(corr.require_reply);
        assert!(corr.needs_closing());
        assert_eq!(corr.exclusion_reason(), None);
        assert_eq!(corr.attachment.as_ref().unwrap().file_name, "letter.pdf");
        assert_eq!(corr.other_attachments[0].guid.as_deref(), Some("att-2"));
        assert_eq!(corr.manual_attachments.as_deref(), Some("1 folder"));
        assert!(bundle.transactions[0].is_assignment());
    }

    #[test]
    fn test_exclusion_reasons() {
        let deleted = SourceCorrespondence {
            guid: "c-2".to_string(),
            deleted: true,
            draft: true,
            ..Default::default()
        };
        assert_eq!(deleted.exclusion_reason(), Some("correspondence is deleted"));

        let canceled = SourceCorrespondence {
            canceled: true,
            ..Default::default()
        };
        assert_eq!(canceled.exclusion_reason(), Some("correspondence is canceled"));
    }
}
