//! HTTP client for the destination automation API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{Destination, DestinationError, FileAttachment, OperationCall, OperationReply, TokenProvider};

/// Where and how to reach the destination system.
#[derive(Debug, Clone)]
pub struct DestinationConfig {
    pub base_url: String,
    pub automation_path: String,
    pub upload_path: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Log request bodies at DEBUG.
    pub log_requests: bool,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            automation_path: "/nuxeo/api/v1/custom-automation/AC_Admin_RunOperation".to_string(),
            upload_path: "/nuxeo/api/v1/upload/".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            log_requests: false,
        }
    }
}

impl DestinationConfig {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn automation_url(&self) -> String {
        self.url(&self.automation_path)
    }

    /// Upload endpoint, always with a trailing slash.
    fn upload_url(&self) -> String {
        let url = self.url(&self.upload_path);
        if url.ends_with('/') {
            url
        } else {
            format!("{}/", url)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchCreated {
    batch_id: String,
}

/// Destination reached over HTTP with a bearer token.
pub struct DestinationClient {
    http: Client,
    config: DestinationConfig,
    tokens: Arc<dyn TokenProvider>,
}

impl DestinationClient {
    pub fn new(
        config: DestinationConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, DestinationError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            config,
            tokens,
        })
    }

    pub fn config(&self) -> &DestinationConfig {
        &self.config
    }

    async fn authorization(&self) -> Result<String, DestinationError> {
        Ok(format!("Bearer {}", self.tokens.bearer_token().await?))
    }

    async fn post_operation(&self, body: &serde_json::Value) -> Result<Response, DestinationError> {
        Ok(self
            .http
            .post(self.config.automation_url())
            .header("Authorization", self.authorization().await?)
            .json(body)
            .send()
            .await?)
    }

    /// Open an upload batch and return its id.
    async fn create_batch(&self) -> Result<String, DestinationError> {
        let url = self.config.upload_url();
        let response = self
            .http
            .post(&url)
            .header("Authorization", self.authorization().await?)
            .json(&serde_json::json!({}))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(DestinationError::Upload(format!(
                "batch creation failed ({}): {}",
                status, text
            )));
        }

        let created: BatchCreated = response
            .json()
            .await
            .map_err(|e| DestinationError::InvalidResponse(format!("batch response: {}", e)))?;
        debug!(batch_id = %created.batch_id, "created upload batch");
        Ok(created.batch_id)
    }

    /// Upload a file as file `0` of the batch.
    async fn upload_file(&self, batch_id: &str, file: &FileAttachment) -> Result<(), DestinationError> {
        let url = format!("{}{}/0", self.config.upload_url(), batch_id);
        let response = self
            .http
            .post(&url)
            .header("Authorization", self.authorization().await?)
            .header("Content-Type", "application/octet-stream")
            .header("X-File-Name", file.file_name.as_str())
            .header("X-File-Type", file.mime_type.as_str())
            .body(file.content.clone())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(DestinationError::Upload(format!(
                "upload of {} failed ({}): {}",
                file.file_name, status, text
            )));
        }

        info!(batch_id, file_name = %file.file_name, bytes = file.content.len(), "uploaded attachment");
        Ok(())
    }
}

#[async_trait]
impl Destination for DestinationClient {
    async fn execute(&self, mut call: OperationCall) -> Result<OperationReply, DestinationError> {
        if let Some(file) = call.attachment.take() {
            let batch_id = self.create_batch().await?;
            self.upload_file(&batch_id, &file).await?;
            call.bind_upload(&file.context_key, &batch_id);
        }

        let body = call.body();
        if self.config.log_requests {
            debug!(operation = %call.operation, body = %body, "destination request");
        }

        let mut response = self.post_operation(&body).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(operation = %call.operation, "destination rejected the token, retrying with a new one");
            self.tokens.invalidate().await;
            response = self.post_operation(&body).await?;
        }

        let status = response.status().as_u16();
        let text = response.text().await?;
        if self.config.log_requests {
            debug!(operation = %call.operation, status, body = %text, "destination response");
        }

        Ok(OperationReply::new(status, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        let config = DestinationConfig {
            base_url: "https://dest.example.com/".to_string(),
            upload_path: "/api/upload".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.automation_url(),
            "https://dest.example.com/nuxeo/api/v1/custom-automation/AC_Admin_RunOperation"
        );
        assert_eq!(config.upload_url(), "https://dest.example.com/api/upload/");
    }
}
