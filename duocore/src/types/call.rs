//! Call phase machine shared by every platform implementation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of the single in-flight call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum CallPhase {
    /// No local stream, no remote stream, no peer connection.
    #[default]
    Idle,
    /// Offer sent, waiting for the remote answer.
    Outgoing,
    /// Remote offer recorded, waiting for the local user to answer or reject.
    IncomingRinging,
    /// Offer/answer exchange completed.
    Connected,
}

impl CallPhase {
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn can_answer(self) -> bool {
        matches!(self, Self::IncomingRinging)
    }

    /// Validates a transition. Hang-up, remote end and failures return to
    /// `Idle` from any phase and do not go through this table.
    pub fn apply(self, transition: CallTransition) -> Result<CallPhase, InvalidTransition> {
        match (self, transition) {
            (Self::Idle, CallTransition::OfferSent) => Ok(Self::Outgoing),
            (Self::Idle, CallTransition::OfferReceived) => Ok(Self::IncomingRinging),
            (Self::IncomingRinging, CallTransition::LocalAnswered) => Ok(Self::Connected),
            (Self::Outgoing, CallTransition::RemoteAnswered) => Ok(Self::Connected),
            (Self::IncomingRinging, CallTransition::Rejected) => Ok(Self::Idle),
            (from, attempted) => Err(InvalidTransition { from, attempted }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    OfferSent,
    OfferReceived,
    LocalAnswered,
    RemoteAnswered,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: CallPhase,
    pub attempted: CallTransition,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid transition {:?} in phase {:?}", self.attempted, self.from)
    }
}

impl std::error::Error for InvalidTransition {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Opaque session description. The engine never inspects `sdp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TrackKind {
    Audio,
    Video,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outgoing_path_reaches_connected() {
        let phase = CallPhase::Idle
            .apply(CallTransition::OfferSent)
            .and_then(|p| p.apply(CallTransition::RemoteAnswered))
            .unwrap();
        assert_eq!(phase, CallPhase::Connected);
    }

    #[test]
    fn incoming_path_reaches_connected() {
        let ringing = CallPhase::Idle.apply(CallTransition::OfferReceived).unwrap();
        assert!(ringing.can_answer());
        assert_eq!(
            ringing.apply(CallTransition::LocalAnswered).unwrap(),
            CallPhase::Connected
        );
    }

    #[test]
    fn second_offer_is_rejected_outside_idle() {
        for phase in [CallPhase::Outgoing, CallPhase::IncomingRinging, CallPhase::Connected] {
            let err = phase.apply(CallTransition::OfferSent).unwrap_err();
            assert_eq!(err.from, phase);
            assert_eq!(err.attempted, CallTransition::OfferSent);
        }
    }

    #[test]
    fn answer_in_wrong_phase_is_invalid() {
        assert!(CallPhase::Idle.apply(CallTransition::RemoteAnswered).is_err());
        assert!(CallPhase::IncomingRinging.apply(CallTransition::RemoteAnswered).is_err());
        assert!(CallPhase::Outgoing.apply(CallTransition::LocalAnswered).is_err());
    }

    #[test]
    fn only_a_ringing_call_can_be_rejected() {
        assert_eq!(
            CallPhase::IncomingRinging.apply(CallTransition::Rejected),
            Ok(CallPhase::Idle)
        );
        assert!(CallPhase::Idle.apply(CallTransition::Rejected).is_err());
        assert!(CallPhase::Connected.apply(CallTransition::Rejected).is_err());
    }

    #[test]
    fn session_description_uses_type_tag() {
        let json = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "offer", "sdp": "v=0"}));
    }
}
