//! Attachment storage boundary: request shaping and response parsing.

use crate::types::message::Attachment;
use serde::Deserialize;
use std::fmt;

/// A local file waiting to be uploaded.
#[derive(Clone)]
pub struct PendingAttachment {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl PendingAttachment {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }
}

impl fmt::Debug for PendingAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAttachment")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct RawUploadResponse {
    secure_url: Option<String>,
    url: Option<String>,
    bytes: Option<u64>,
    #[serde(rename = "sizeBytes")]
    size_bytes: Option<u64>,
}

/// Parses the storage response into a resolved attachment.
///
/// The secure url wins over the plain one. When the service omits the size,
/// the local byte count is used.
pub fn parse_upload_response(
    body: &[u8],
    pending: &PendingAttachment,
) -> Result<Attachment, serde_json::Error> {
    let raw: RawUploadResponse = serde_json::from_slice(body)?;
    let url = raw
        .secure_url
        .filter(|u| !u.is_empty())
        .or(raw.url)
        .unwrap_or_default();
    Ok(Attachment {
        url,
        name: pending.name.clone(),
        mime_type: pending.mime_type.clone(),
        size_bytes: raw
            .bytes
            .or(raw.size_bytes)
            .unwrap_or(pending.data.len() as u64),
    })
}
