use crate::http::{HttpClient, HttpRequest};
use async_trait::async_trait;
pub use duocore::upload::PendingAttachment;
use duocore::upload::parse_upload_response;
use duocore::{Attachment, ErrorKind, ErrorNotice};
use log::{debug, warn};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("attachment is empty")]
    EmptyFile,
    #[error("upload failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("upload request failed: {0}")]
    Transport(String),
    #[error("invalid upload response: {0}")]
    InvalidResponse(String),
    #[error("no upload service configured")]
    NotConfigured,
}

impl UploadError {
    pub fn notice(&self) -> ErrorNotice {
        ErrorNotice::new(ErrorKind::Upload, self.to_string())
    }
}

/// External blob storage. Accepts a raw file and returns a retrievable URL.
#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    async fn upload(&self, file: PendingAttachment) -> Result<Attachment, UploadError>;
}

/// Posts the raw bytes to a storage endpoint.
pub struct HttpAttachmentUploader {
    http_client: Arc<dyn HttpClient>,
    endpoint: String,
}

impl HttpAttachmentUploader {
    pub fn new(http_client: Arc<dyn HttpClient>, endpoint: impl Into<String>) -> Self {
        Self {
            http_client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl AttachmentUploader for HttpAttachmentUploader {
    async fn upload(&self, file: PendingAttachment) -> Result<Attachment, UploadError> {
        if file.data.is_empty() {
            return Err(UploadError::EmptyFile);
        }
        debug!(target: "Upload", "Uploading {} ({} bytes)", file.name, file.data.len());

        let request = HttpRequest::post(&self.endpoint)
            .with_header("Content-Type", &file.mime_type)
            .with_header("X-File-Name", urlencoding::encode(&file.name))
            .with_body(file.data.clone());

        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        if !response.is_success() {
            let body = response.body_string().unwrap_or_default();
            warn!(target: "Upload", "Upload of {} failed with {}", file.name, response.status_code);
            return Err(UploadError::Status {
                status: response.status_code,
                body,
            });
        }

        let attachment = parse_upload_response(&response.body, &file)
            .map_err(|e| UploadError::InvalidResponse(e.to_string()))?;
        if attachment.url.is_empty() {
            return Err(UploadError::InvalidResponse(
                "response carried no url".to_string(),
            ));
        }
        Ok(attachment)
    }
}

/// Used when no storage endpoint is configured.
#[derive(Debug, Default, Clone)]
pub struct NoUploader;

#[async_trait]
impl AttachmentUploader for NoUploader {
    async fn upload(&self, _file: PendingAttachment) -> Result<Attachment, UploadError> {
        Err(UploadError::NotConfigured)
    }
}
