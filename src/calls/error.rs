//! Call-related error types.

use super::media::MediaError;
use duocore::net::DeliveryError;
use duocore::{CallPhase, ErrorKind, ErrorNotice, InvalidTransition};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("a call is already in progress ({0:?})")]
    Busy(CallPhase),

    #[error("no active room to call in")]
    NoActiveRoom,

    #[error("media acquisition failed: {0}")]
    Media(#[from] MediaError),

    #[error("peer connection error: {0}")]
    PeerConnection(String),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("signaling delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    /// The call was ended while this operation was in flight.
    #[error("call was ended before the operation completed")]
    Cancelled,
}

impl CallError {
    /// The user-facing notice for this error, if it warrants one.
    ///
    /// Invalid transitions and `Busy` are returned to the caller only.
    /// Cancellation is user-initiated and never surfaced.
    pub fn notice(&self) -> Option<ErrorNotice> {
        let kind = match self {
            Self::InvalidTransition(_) | Self::Busy(_) | Self::Cancelled => return None,
            Self::Media(MediaError::PermissionDenied(_)) => ErrorKind::MediaPermission,
            Self::Media(MediaError::DeviceUnavailable(_)) => ErrorKind::MediaDevice,
            Self::PeerConnection(_) => ErrorKind::PeerConnection,
            Self::Signaling(_) | Self::NoActiveRoom => ErrorKind::Signaling,
            Self::Delivery(_) => ErrorKind::Transport,
        };
        Some(ErrorNotice::new(kind, self.to_string()))
    }
}
