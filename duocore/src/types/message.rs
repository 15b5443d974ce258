use crate::types::user::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A file that has already been uploaded to the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

/// A chat message within a room. Immutable once appended to a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server or client assigned id. Absent for relays that only timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub sender_id: UserId,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Builds a message authored locally, with a fresh client-side id.
    pub fn outgoing(sender_id: UserId, content: MessageContent) -> Self {
        let (text, attachment) = match content {
            MessageContent::Text(text) => (text, None),
            MessageContent::Attachment(attachment) => (String::new(), Some(attachment)),
        };
        Self {
            id: Some(generate_message_id()),
            sender_id,
            text,
            attachment,
            timestamp: Utc::now(),
        }
    }

    /// Whether the message satisfies the "exactly one of text or attachment"
    /// rule. Inbound messages failing this are dropped by the registry.
    pub fn is_well_formed(&self) -> bool {
        let has_text = !self.text.trim().is_empty();
        let has_attachment = self.attachment.as_ref().is_some_and(|a| !a.url.is_empty());
        has_text != has_attachment
    }
}

/// Validated payload of an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Attachment(Attachment),
}

impl MessageContent {
    /// Checks the content rules before anything reaches the network.
    pub fn validate(text: &str, has_attachment: bool) -> Result<(), SendError> {
        let has_text = !text.trim().is_empty();
        match (has_text, has_attachment) {
            (false, false) => Err(SendError::EmptyContent),
            (true, true) => Err(SendError::TextWithAttachment),
            _ => Ok(()),
        }
    }

    pub fn from_parts(text: &str, attachment: Option<Attachment>) -> Result<Self, SendError> {
        Self::validate(text, attachment.is_some())?;
        match attachment {
            Some(attachment) if attachment.url.is_empty() => Err(SendError::UnresolvedAttachment),
            Some(attachment) => Ok(Self::Attachment(attachment)),
            None => Ok(Self::Text(text.to_string())),
        }
    }
}

/// Local send validation failures. Never reach the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("no active room")]
    NoActiveRoom,
    #[error("message has neither text nor attachment")]
    EmptyContent,
    #[error("message cannot carry both text and an attachment")]
    TextWithAttachment,
    #[error("attachment has no resolved url")]
    UnresolvedAttachment,
}

fn generate_message_id() -> String {
    let millis = Utc::now().timestamp_millis();
    format!("{:X}{:08X}", millis, rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment() -> Attachment {
        Attachment {
            url: "https://files.example.com/cat.png".to_string(),
            name: "cat.png".to_string(),
            mime_type: "image/png".to_string(),
            size_bytes: 2048,
        }
    }

    #[test]
    fn validation_rejects_empty_and_mixed_content() {
        assert_eq!(MessageContent::validate("   ", false), Err(SendError::EmptyContent));
        assert_eq!(MessageContent::validate("hi", true), Err(SendError::TextWithAttachment));
        assert!(MessageContent::validate("hi", false).is_ok());
        assert!(MessageContent::validate("", true).is_ok());
    }

    #[test]
    fn unresolved_attachment_is_rejected() {
        let mut pending = attachment();
        pending.url.clear();
        assert_eq!(
            MessageContent::from_parts("", Some(pending)),
            Err(SendError::UnresolvedAttachment)
        );
    }

    #[test]
    fn outgoing_text_message_has_no_attachment() {
        let msg = Message::outgoing(
            UserId::from("a@x.com"),
            MessageContent::Text("hello".to_string()),
        );
        assert_eq!(msg.text, "hello");
        assert!(msg.attachment.is_none());
        assert!(msg.id.is_some());
        assert!(msg.is_well_formed());
    }

    #[test]
    fn outgoing_ids_are_distinct() {
        let sender = UserId::from("a@x.com");
        let first = Message::outgoing(sender.clone(), MessageContent::Text("1".into()));
        let second = Message::outgoing(sender, MessageContent::Text("2".into()));
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn attachment_message_is_well_formed() {
        let msg = Message::outgoing(
            UserId::from("a@x.com"),
            MessageContent::Attachment(attachment()),
        );
        assert!(msg.text.is_empty());
        assert!(msg.is_well_formed());
    }
}
