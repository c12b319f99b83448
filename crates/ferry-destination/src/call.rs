//! Operation calls, replies, and the destination trait.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value, json};

use crate::DestinationError;

/// Something that can run automation operations.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Run one operation. Any HTTP status is a reply; only transport faults are errors.
    async fn execute(&self, call: OperationCall) -> Result<OperationReply, DestinationError>;
}

/// A file uploaded ahead of the call and referenced from its context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttachment {
    pub file_name: String,
    pub mime_type: String,
    pub content: Vec<u8>,
    /// Context object that receives the `file:content` reference.
    pub context_key: String,
}

impl FileAttachment {
    /// Decode a base64 payload.
    pub fn from_base64(
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        encoded: &str,
        context_key: impl Into<String>,
    ) -> Result<Self, DestinationError> {
        let file_name = file_name.into();
        let content = STANDARD
            .decode(encoded.trim())
            .map_err(|e| DestinationError::Upload(format!("invalid base64 in {}: {}", file_name, e)))?;
        Ok(Self {
            file_name,
            mime_type: mime_type.into(),
            content,
            context_key: context_key.into(),
        })
    }
}

/// One automation operation: `{params: {operationName, ...}, context: {...}}`.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationCall {
    pub operation: String,
    pub params: Map<String, Value>,
    pub context: Map<String, Value>,
    pub attachment: Option<FileAttachment>,
}

impl OperationCall {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            params: Map::new(),
            context: Map::new(),
            attachment: None,
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn attach(mut self, attachment: Option<FileAttachment>) -> Self {
        self.attachment = attachment;
        self
    }

    /// Point the attachment's context object at an upload batch.
    pub fn bind_upload(&mut self, context_key: &str, batch_id: &str) {
        let target = self
            .context
            .entry(context_key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(object) = target {
            object.insert(
                "file:content".to_string(),
                json!({"upload-batch": batch_id, "upload-fileId": "0"}),
            );
        }
    }

    /// JSON request body.
    pub fn body(&self) -> Value {
        let mut params = self.params.clone();
        params.insert(
            "operationName".to_string(),
            Value::String(self.operation.clone()),
        );
        json!({
            "params": params,
            "context": self.context,
        })
    }
}

/// Raw reply to an operation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationReply {
    pub status: u16,
    pub body: String,
}

impl OperationReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parsed body, if it is JSON.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }
}
