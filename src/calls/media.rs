//! Capability seams over the platform media and peer-connection stacks.
//!
//! The call state machine only ever talks to these traits, so it can run
//! against fakes in tests and against a real WebRTC binding in an app.

use async_trait::async_trait;
use duocore::{IceCandidate, SessionDescription, TrackKind};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    /// Audio is always requested; video only when asked for.
    pub fn for_call(with_video: bool) -> Self {
        Self {
            audio: true,
            video: with_video,
        }
    }
}

/// A single local capture track.
pub trait MediaTrack: Send + Sync {
    fn kind(&self) -> TrackKind;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    /// Releases the device. Calling it on a stopped track is a no-op.
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

/// Local capture owned by the call session.
#[derive(Clone, Default)]
pub struct LocalStream {
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    fn of_kind(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Flips every track of `kind`. Returns the new enabled state, or `None`
    /// if the stream has no such track.
    pub fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let enabled = !self.of_kind(kind).next()?.is_enabled();
        for track in self.of_kind(kind) {
            track.set_enabled(enabled);
        }
        Some(enabled)
    }

    pub fn any_enabled(&self, kind: TrackKind) -> bool {
        self.of_kind(kind).any(|t| t.is_enabled())
    }

    /// Disables and stops every track.
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.set_enabled(false);
            track.stop();
        }
    }
}

/// Platform media-capture API.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError>;
}

/// Remote media delivered by the peer connection.
pub trait RemoteStream: Send + Sync {
    fn id(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks from the peer connection, delivered over a channel.
pub enum PeerEvent {
    LocalIceCandidate(IceCandidate),
    RemoteStream(Arc<dyn RemoteStream>),
    ConnectionState(PeerConnectionState),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn add_track(&self, track: Arc<dyn MediaTrack>) -> anyhow::Result<()>;
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    /// Tears the connection down. Closing twice is a no-op.
    fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create_peer_connection(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> anyhow::Result<Arc<dyn PeerConnection>>;
}

/// Stand-in for hosts without a capture backend. Every request fails.
#[derive(Debug, Default, Clone)]
pub struct NoMediaDevices;

#[async_trait]
impl MediaDevices for NoMediaDevices {
    async fn get_user_media(&self, _constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        Err(MediaError::DeviceUnavailable(
            "no capture backend configured".to_string(),
        ))
    }
}

/// Stand-in for hosts without a WebRTC stack.
#[derive(Debug, Default, Clone)]
pub struct NoPeerConnections;

#[async_trait]
impl PeerConnectionFactory for NoPeerConnections {
    async fn create_peer_connection(
        &self,
        _events: mpsc::UnboundedSender<PeerEvent>,
    ) -> anyhow::Result<Arc<dyn PeerConnection>> {
        Err(anyhow::anyhow!("no WebRTC stack configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeTrack;

    fn stream() -> LocalStream {
        LocalStream::new(vec![
            FakeTrack::arc(TrackKind::Audio),
            FakeTrack::arc(TrackKind::Video),
        ])
    }

    #[test]
    fn toggle_flips_only_matching_tracks() {
        let stream = stream();
        assert_eq!(stream.toggle(TrackKind::Audio), Some(false));
        assert!(!stream.any_enabled(TrackKind::Audio));
        assert!(stream.any_enabled(TrackKind::Video));

        assert_eq!(stream.toggle(TrackKind::Audio), Some(true));
        assert!(stream.any_enabled(TrackKind::Audio));
    }

    #[test]
    fn toggle_without_track_is_noop() {
        let audio_only = LocalStream::new(vec![FakeTrack::arc(TrackKind::Audio)]);
        assert_eq!(audio_only.toggle(TrackKind::Video), None);
        assert!(!audio_only.any_enabled(TrackKind::Video));
        assert!(audio_only.any_enabled(TrackKind::Audio));
    }

    #[test]
    fn stop_all_is_idempotent() {
        let stream = stream();
        stream.stop_all();
        stream.stop_all();
        assert!(stream.tracks().iter().all(|t| t.is_stopped() && !t.is_enabled()));
    }
}
