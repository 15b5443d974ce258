//! Fakes shared by the unit tests.

use crate::calls::media::{
    LocalStream, MediaConstraints, MediaDevices, MediaError, MediaTrack, PeerConnection,
    PeerConnectionFactory, PeerEvent, RemoteStream,
};
use async_trait::async_trait;
use duocore::net::{DeliveryError, EventSink};
use duocore::protocol::OutboundEvent;
use duocore::{ErrorNotice, Event, EventHandler, IceCandidate, SessionDescription, TrackKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// Records every outbound event instead of sending it.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<OutboundEvent>>,
    offline: bool,
}

impl RecordingSink {
    pub fn disconnected() -> Self {
        Self {
            sent: Mutex::default(),
            offline: true,
        }
    }

    pub fn sent(&self) -> Vec<OutboundEvent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn send_event(&self, event: OutboundEvent) -> Result<(), DeliveryError> {
        if self.offline {
            return Err(DeliveryError::NotConnected);
        }
        self.sent.lock().unwrap().push(event);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<ErrorNotice> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Error(notice) => Some(notice),
                _ => None,
            })
            .collect()
    }
}

impl EventHandler for RecordingHandler {
    fn handle_event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub struct FakeTrack {
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn new(kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn arc(kind: TrackKind) -> Arc<dyn MediaTrack> {
        Self::new(kind)
    }
}

impl MediaTrack for FakeTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Hands out fake tracks and records every request.
#[derive(Default)]
pub struct FakeMediaDevices {
    requests: Mutex<Vec<MediaConstraints>>,
    issued: Mutex<Vec<Arc<FakeTrack>>>,
    failure: Mutex<Option<MediaError>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FakeMediaDevices {
    pub fn fail_with(&self, err: MediaError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    /// Makes the next request wait until the returned sender fires or drops.
    pub fn hold(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().unwrap().clone()
    }

    pub fn issued(&self) -> Vec<Arc<FakeTrack>> {
        self.issued.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        self.requests.lock().unwrap().push(constraints);
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }

        let mut tracks = vec![FakeTrack::new(TrackKind::Audio)];
        if constraints.video {
            tracks.push(FakeTrack::new(TrackKind::Video));
        }
        self.issued.lock().unwrap().extend(tracks.iter().cloned());
        Ok(LocalStream::new(
            tracks
                .into_iter()
                .map(|t| t as Arc<dyn MediaTrack>)
                .collect(),
        ))
    }
}

pub struct FakeRemoteStream;

impl RemoteStream for FakeRemoteStream {
    fn id(&self) -> &str {
        "remote-0"
    }
}

/// Peer connection that follows the description ordering rules of a real
/// stack: candidates are refused until a remote description is set.
pub struct FakePeerConnection {
    events: mpsc::UnboundedSender<PeerEvent>,
    closed: AtomicBool,
    tracks: Mutex<Vec<TrackKind>>,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    remote_stream: Mutex<Option<Arc<dyn RemoteStream>>>,
}

impl FakePeerConnection {
    fn new(events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            events,
            closed: AtomicBool::new(false),
            tracks: Mutex::default(),
            local_description: Mutex::default(),
            remote_description: Mutex::default(),
            candidates: Mutex::default(),
            remote_stream: Mutex::default(),
        }
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn deliver_remote_stream(&self) {
        let stream: Arc<dyn RemoteStream> = Arc::new(FakeRemoteStream);
        *self.remote_stream.lock().unwrap() = Some(stream.clone());
        self.emit(PeerEvent::RemoteStream(stream));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn tracks(&self) -> Vec<TrackKind> {
        self.tracks.lock().unwrap().clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.lock().unwrap().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().unwrap().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    fn add_track(&self, track: Arc<dyn MediaTrack>) -> anyhow::Result<()> {
        self.tracks.lock().unwrap().push(track.kind());
        Ok(())
    }

    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::offer("fake-offer"))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        if self.remote_description().is_none() {
            anyhow::bail!("no remote offer");
        }
        Ok(SessionDescription::answer("fake-answer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> anyhow::Result<()> {
        *self.local_description.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> anyhow::Result<()> {
        if description.sdp.is_empty() {
            anyhow::bail!("empty remote description");
        }
        *self.remote_description.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
        if self.remote_description().is_none() {
            anyhow::bail!("remote description not set");
        }
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    created: Mutex<Vec<Arc<FakePeerConnection>>>,
    fail: AtomicBool,
    attempts: AtomicUsize,
}

impl FakePeerFactory {
    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Arc<FakePeerConnection> {
        self.created
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no peer connection was created")
    }

    pub fn created(&self) -> Vec<Arc<FakePeerConnection>> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create_peer_connection(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> anyhow::Result<Arc<dyn PeerConnection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("peer connection refused");
        }
        let peer = Arc::new(FakePeerConnection::new(events));
        self.created.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}
