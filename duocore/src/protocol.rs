//! Relay wire protocol.
//!
//! One JSON text frame per event, adjacently tagged as
//! `{"event": "<name>", "data": <payload>}` with camelCase fields.

use crate::types::call::{IceCandidate, SessionDescription};
use crate::types::message::Message;
use crate::types::room::RoomId;
use crate::types::user::UserId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame is not valid UTF-8")]
    NotUtf8,
}

/// A message together with the room it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessage {
    pub room_id: RoomId,
    #[serde(flatten)]
    pub message: Message,
}

/// Closed set of events the client consumes.
///
/// `Connected`, `Disconnected` and `ConnectError` are raised locally by the
/// connection manager and are never honoured when received on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum InboundEvent {
    Connected,
    Disconnected,
    #[serde(rename_all = "camelCase")]
    ConnectError {
        reason: String,
    },
    OnlineUsers(Vec<UserId>),
    #[serde(rename_all = "camelCase")]
    MessageHistory {
        room_id: RoomId,
        messages: Vec<Message>,
    },
    Message(RoomMessage),
    #[serde(rename_all = "camelCase")]
    Typing {
        room_id: RoomId,
        user_id: UserId,
        is_typing: bool,
    },
    #[serde(rename_all = "camelCase")]
    CallOffer {
        room_id: RoomId,
        sdp: SessionDescription,
        #[serde(default)]
        from: Option<UserId>,
        #[serde(default)]
        with_video: bool,
    },
    #[serde(rename_all = "camelCase")]
    CallAnswer {
        room_id: RoomId,
        sdp: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        room_id: RoomId,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    CallEnded {
        room_id: RoomId,
    },
}

impl InboundEvent {
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Disconnected | Self::ConnectError { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::ConnectError { .. } => "connectError",
            Self::OnlineUsers(_) => "onlineUsers",
            Self::MessageHistory { .. } => "messageHistory",
            Self::Message(_) => "message",
            Self::Typing { .. } => "typing",
            Self::CallOffer { .. } => "callOffer",
            Self::CallAnswer { .. } => "callAnswer",
            Self::IceCandidate { .. } => "iceCandidate",
            Self::CallEnded { .. } => "callEnded",
        }
    }
}

/// Closed set of events the client produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum OutboundEvent {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
        /// Asks the relay for a `messageHistory` snapshot.
        history: bool,
    },
    Message(RoomMessage),
    #[serde(rename_all = "camelCase")]
    Typing {
        room_id: RoomId,
        user_id: UserId,
        is_typing: bool,
    },
    #[serde(rename_all = "camelCase")]
    CallOffer {
        room_id: RoomId,
        sdp: SessionDescription,
        with_video: bool,
    },
    #[serde(rename_all = "camelCase")]
    CallAnswer {
        room_id: RoomId,
        sdp: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        room_id: RoomId,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    CallEnded {
        room_id: RoomId,
    },
}

impl OutboundEvent {
    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::JoinRoom { room_id, .. }
            | Self::Typing { room_id, .. }
            | Self::CallOffer { room_id, .. }
            | Self::CallAnswer { room_id, .. }
            | Self::IceCandidate { room_id, .. }
            | Self::CallEnded { room_id } => room_id,
            Self::Message(msg) => &msg.room_id,
        }
    }
}

pub fn encode_outbound(event: &OutboundEvent) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

pub fn decode_inbound(frame: &[u8]) -> Result<InboundEvent, ProtocolError> {
    let text = std::str::from_utf8(frame).map_err(|_| ProtocolError::NotUtf8)?;
    Ok(serde_json::from_str(text)?)
}
