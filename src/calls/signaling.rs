//! Room-scoped envelope for call negotiation payloads.

use duocore::net::{DeliveryError, EventSink};
use duocore::protocol::{InboundEvent, OutboundEvent};
use duocore::{IceCandidate, RoomId, SessionDescription, UserId};
use log::debug;
use std::sync::Arc;

/// Inbound negotiation message, split out of the relay event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    Offer {
        room_id: RoomId,
        sdp: SessionDescription,
        from: Option<UserId>,
        with_video: bool,
    },
    Answer {
        room_id: RoomId,
        sdp: SessionDescription,
    },
    IceCandidate {
        room_id: RoomId,
        candidate: IceCandidate,
    },
    Ended {
        room_id: RoomId,
    },
}

impl SignalMessage {
    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::Offer { room_id, .. }
            | Self::Answer { room_id, .. }
            | Self::IceCandidate { room_id, .. }
            | Self::Ended { room_id } => room_id,
        }
    }
}

/// Forwards negotiation payloads without buffering or inspecting them.
#[derive(Clone)]
pub struct SignalRelay {
    sink: Arc<dyn EventSink>,
}

impl SignalRelay {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub async fn send_offer(
        &self,
        room_id: &RoomId,
        sdp: SessionDescription,
        with_video: bool,
    ) -> Result<(), DeliveryError> {
        debug!(target: "Signaling", "Sending offer to {room_id} (video: {with_video})");
        self.sink
            .send_event(OutboundEvent::CallOffer {
                room_id: room_id.clone(),
                sdp,
                with_video,
            })
            .await
    }

    pub async fn send_answer(
        &self,
        room_id: &RoomId,
        sdp: SessionDescription,
    ) -> Result<(), DeliveryError> {
        debug!(target: "Signaling", "Sending answer to {room_id}");
        self.sink
            .send_event(OutboundEvent::CallAnswer {
                room_id: room_id.clone(),
                sdp,
            })
            .await
    }

    pub async fn send_ice_candidate(
        &self,
        room_id: &RoomId,
        candidate: IceCandidate,
    ) -> Result<(), DeliveryError> {
        self.sink
            .send_event(OutboundEvent::IceCandidate {
                room_id: room_id.clone(),
                candidate,
            })
            .await
    }

    pub async fn send_call_ended(&self, room_id: &RoomId) -> Result<(), DeliveryError> {
        debug!(target: "Signaling", "Sending callEnded to {room_id}");
        self.sink
            .send_event(OutboundEvent::CallEnded {
                room_id: room_id.clone(),
            })
            .await
    }

    /// Splits negotiation events from everything else. Non-signaling events
    /// are handed back unchanged.
    pub fn route(event: InboundEvent) -> Result<SignalMessage, InboundEvent> {
        match event {
            InboundEvent::CallOffer {
                room_id,
                sdp,
                from,
                with_video,
            } => Ok(SignalMessage::Offer {
                room_id,
                sdp,
                from,
                with_video,
            }),
            InboundEvent::CallAnswer { room_id, sdp } => Ok(SignalMessage::Answer { room_id, sdp }),
            InboundEvent::IceCandidate { room_id, candidate } => {
                Ok(SignalMessage::IceCandidate { room_id, candidate })
            }
            InboundEvent::CallEnded { room_id } => Ok(SignalMessage::Ended { room_id }),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingSink;

    #[tokio::test]
    async fn offer_is_forwarded_unchanged() {
        let sink = Arc::new(RecordingSink::default());
        let relay = SignalRelay::new(sink.clone());
        let room = RoomId::from("r1");

        relay
            .send_offer(&room, SessionDescription::offer("v=0 opaque"), true)
            .await
            .unwrap();

        assert_eq!(
            sink.sent(),
            vec![OutboundEvent::CallOffer {
                room_id: room,
                sdp: SessionDescription::offer("v=0 opaque"),
                with_video: true,
            }]
        );
    }

    #[tokio::test]
    async fn send_failure_is_returned() {
        let sink = Arc::new(RecordingSink::disconnected());
        let relay = SignalRelay::new(sink);
        let err = relay.send_call_ended(&RoomId::from("r1")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotConnected));
    }

    #[test]
    fn route_separates_signaling_from_chat() {
        let ended = InboundEvent::CallEnded {
            room_id: "r1".into(),
        };
        assert_eq!(
            SignalRelay::route(ended),
            Ok(SignalMessage::Ended {
                room_id: "r1".into()
            })
        );

        let presence = InboundEvent::OnlineUsers(vec![]);
        assert_eq!(SignalRelay::route(presence.clone()), Err(presence));
    }
}
