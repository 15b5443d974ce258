use crate::calls::CallError;
use crate::upload::UploadError;
use duocore::auth::AuthError;
use duocore::net::DeliveryError;
use duocore::{ErrorKind, ErrorNotice, SendError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("gave up reconnecting after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    /// A disconnect happened while the connection attempt was in flight.
    #[error("connection attempt superseded")]
    Superseded,

    #[error("cannot send: {0}")]
    Send(#[from] SendError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
}

impl ClientError {
    pub fn notice(&self) -> Option<ErrorNotice> {
        let kind = match self {
            Self::Auth(_) => ErrorKind::Auth,
            Self::ReconnectExhausted { .. } => ErrorKind::Transport,
            Self::Superseded => return None,
            Self::Send(_) | Self::Delivery(_) => ErrorKind::Send,
            Self::Upload(_) => ErrorKind::Upload,
            Self::Call(e) => return e.notice(),
        };
        Some(ErrorNotice::new(kind, self.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_validation_maps_to_send_kind() {
        let notice = ClientError::from(SendError::NoActiveRoom).notice().unwrap();
        assert_eq!(notice.kind, ErrorKind::Send);
    }

    #[test]
    fn cancelled_call_is_not_reported() {
        assert!(ClientError::from(CallError::Cancelled).notice().is_none());
        assert!(ClientError::Superseded.notice().is_none());
    }

    #[test]
    fn expired_credential_is_an_auth_notice() {
        let notice = ClientError::from(AuthError::Expired).notice().unwrap();
        assert_eq!(notice.kind, ErrorKind::Auth);
        assert!(notice.detail.contains("expired"));
    }
}
