//! The single-call WebRTC state machine.
//!
//! At most one call exists at a time. Every operation that awaits (media
//! acquisition, peer-connection negotiation, signaling sends) captures the
//! call generation first and re-checks it afterwards; a hang-up or remote end
//! in between bumps the generation, and the late continuation releases
//! whatever it acquired instead of resurrecting the call.

use super::error::CallError;
use super::media::{
    LocalStream, MediaConstraints, MediaDevices, PeerConnection, PeerConnectionFactory,
    PeerConnectionState, PeerEvent, RemoteStream,
};
use super::signaling::{SignalMessage, SignalRelay};
use duocore::{
    CallEndReason, CallPhase, CallTransition, CoreEventBus, ErrorKind, ErrorNotice, Event,
    IceCandidate, InvalidTransition, RoomId, SessionDescription, TrackKind, UserId,
};
use log::{debug, info, warn};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;

/// Mute and camera flags, derived from the local tracks' enabled state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaFlags {
    pub muted: bool,
    pub video_off: bool,
}

impl MediaFlags {
    fn of(stream: &LocalStream) -> Self {
        Self {
            muted: !stream.any_enabled(TrackKind::Audio),
            video_off: !stream.any_enabled(TrackKind::Video),
        }
    }

    fn event(self) -> Event {
        Event::MediaStateChanged {
            muted: self.muted,
            video_off: self.video_off,
        }
    }
}

/// Read-only view of the current call.
#[derive(Clone, Default)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub room_id: Option<RoomId>,
    pub with_video: bool,
    pub from: Option<UserId>,
    pub media: MediaFlags,
    pub has_local_stream: bool,
    pub has_peer_connection: bool,
    pub has_pending_offer: bool,
    pub queued_candidates: usize,
    pub remote_stream: Option<Arc<dyn RemoteStream>>,
}

struct ActiveCall {
    room_id: RoomId,
    phase: CallPhase,
    with_video: bool,
    from: Option<UserId>,
    /// Held only while ringing.
    pending_offer: Option<SessionDescription>,
    answering: bool,
    local: Option<LocalStream>,
    peer: Option<Arc<dyn PeerConnection>>,
    remote: Option<Weak<dyn RemoteStream>>,
    remote_description_set: bool,
    queued_candidates: Vec<IceCandidate>,
    /// Local candidates are held back until our offer or answer is sent.
    local_description_sent: bool,
    outbound_candidates: Vec<IceCandidate>,
}

impl ActiveCall {
    fn new(room_id: RoomId, phase: CallPhase, with_video: bool) -> Self {
        Self {
            room_id,
            phase,
            with_video,
            from: None,
            pending_offer: None,
            answering: false,
            local: None,
            peer: None,
            remote: None,
            remote_description_set: false,
            queued_candidates: Vec::new(),
            local_description_sent: false,
            outbound_candidates: Vec::new(),
        }
    }

    /// Closes the peer connection and stops every local track.
    fn release(&mut self) {
        if let Some(peer) = self.peer.take() {
            peer.close();
        }
        if let Some(local) = self.local.take() {
            local.stop_all();
        }
        self.remote = None;
        self.pending_offer = None;
        self.queued_candidates.clear();
        self.outbound_candidates.clear();
    }
}

#[derive(Default)]
struct CallInner {
    call: Option<ActiveCall>,
    generation: u64,
}

impl CallInner {
    fn current_mut(&mut self, generation: u64) -> Option<&mut ActiveCall> {
        if self.generation == generation {
            self.call.as_mut()
        } else {
            None
        }
    }

    /// Removes the call and invalidates every in-flight continuation.
    fn take_call(&mut self) -> Option<ActiveCall> {
        let call = self.call.take();
        if call.is_some() {
            self.generation += 1;
        }
        call
    }
}

pub struct CallSession {
    signal: SignalRelay,
    media: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    event_bus: CoreEventBus,
    inner: Mutex<CallInner>,
}

impl CallSession {
    pub fn new(
        signal: SignalRelay,
        media: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        event_bus: CoreEventBus,
    ) -> Self {
        Self {
            signal,
            media,
            peers,
            event_bus,
            inner: Mutex::new(CallInner::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, CallInner> {
        self.inner
            .lock()
            .expect("call state lock should not be poisoned")
    }

    fn publish(&self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.event_bus.dispatch(&event);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.state();
        state.generation == generation && state.call.is_some()
    }

    pub fn phase(&self) -> CallPhase {
        self.state()
            .call
            .as_ref()
            .map_or(CallPhase::Idle, |c| c.phase)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let state = self.state();
        let Some(call) = state.call.as_ref() else {
            return CallSnapshot::default();
        };
        CallSnapshot {
            phase: call.phase,
            room_id: Some(call.room_id.clone()),
            with_video: call.with_video,
            from: call.from.clone(),
            media: call.local.as_ref().map(MediaFlags::of).unwrap_or_default(),
            has_local_stream: call.local.is_some(),
            has_peer_connection: call.peer.is_some(),
            has_pending_offer: call.pending_offer.is_some(),
            queued_candidates: call.queued_candidates.len(),
            remote_stream: call.remote.as_ref().and_then(Weak::upgrade),
        }
    }

    /// Places a call in `room_id`. Only valid while no call exists.
    pub async fn start_call(
        self: &Arc<Self>,
        room_id: RoomId,
        with_video: bool,
    ) -> Result<(), CallError> {
        let generation = {
            let mut state = self.state();
            if let Some(call) = &state.call {
                return Err(CallError::Busy(call.phase));
            }
            state.generation += 1;
            state.call = Some(ActiveCall::new(room_id.clone(), CallPhase::Idle, with_video));
            state.generation
        };
        info!(
            target: "Call",
            "Starting {} call in {room_id}",
            if with_video { "video" } else { "audio" }
        );

        let peer = self.attach_media(generation, with_video).await?;
        let offer = self
            .step(generation, peer.create_offer(), CallError::PeerConnection)
            .await?;
        self.step(
            generation,
            peer.set_local_description(offer.clone()),
            CallError::PeerConnection,
        )
        .await?;

        // Outgoing before the send, so a fast answer finds the right phase.
        self.transition(generation, CallTransition::OfferSent).await?;
        if let Err(e) = self.signal.send_offer(&room_id, offer, with_video).await {
            return Err(self.abort(generation, e.into()).await);
        }
        self.release_local_candidates(generation, &room_id).await;
        Ok(())
    }

    /// Accepts the ringing call. Media is acquired only now.
    pub async fn answer_call(self: &Arc<Self>) -> Result<(), CallError> {
        let (generation, room_id, with_video, offer) = {
            let mut state = self.state();
            let generation = state.generation;
            let Some(call) = state.call.as_mut() else {
                return Err(InvalidTransition {
                    from: CallPhase::Idle,
                    attempted: CallTransition::LocalAnswered,
                }
                .into());
            };
            call.phase.apply(CallTransition::LocalAnswered)?;
            let offer = match (&call.pending_offer, call.answering) {
                (Some(offer), false) => offer.clone(),
                _ => {
                    return Err(InvalidTransition {
                        from: call.phase,
                        attempted: CallTransition::LocalAnswered,
                    }
                    .into());
                }
            };
            call.answering = true;
            (generation, call.room_id.clone(), call.with_video, offer)
        };
        info!(target: "Call", "Answering call in {room_id}");

        let peer = self.attach_media(generation, with_video).await?;
        self.apply_remote_description(generation, &peer, offer)
            .await?;
        let answer = self
            .step(generation, peer.create_answer(), CallError::PeerConnection)
            .await?;
        self.step(
            generation,
            peer.set_local_description(answer.clone()),
            CallError::PeerConnection,
        )
        .await?;

        self.transition(generation, CallTransition::LocalAnswered)
            .await?;
        if let Err(e) = self.signal.send_answer(&room_id, answer).await {
            return Err(self.abort(generation, e.into()).await);
        }
        self.release_local_candidates(generation, &room_id).await;
        Ok(())
    }

    /// Declines the ringing call without ever touching capture devices.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let call = {
            let mut state = self.state();
            let phase = state.call.as_ref().map_or(CallPhase::Idle, |c| c.phase);
            phase.apply(CallTransition::Rejected)?;
            state.take_call()
        };
        if let Some(call) = call {
            info!(target: "Call", "Rejecting call in {}", call.room_id);
            self.finish(call, CallEndReason::Rejected, true).await;
        }
        Ok(())
    }

    /// Ends whatever call exists. A no-op when idle.
    pub async fn hang_up(&self) {
        let call = self.state().take_call();
        match call {
            Some(call) => {
                info!(target: "Call", "Hanging up call in {}", call.room_id);
                let notify = !call.phase.is_idle();
                self.finish(call, CallEndReason::LocalHangUp, notify).await;
            }
            None => debug!(target: "Call", "hang_up with no call in progress"),
        }
    }

    pub fn toggle_mute(&self) -> MediaFlags {
        self.toggle(TrackKind::Audio)
    }

    pub fn toggle_video(&self) -> MediaFlags {
        self.toggle(TrackKind::Video)
    }

    fn toggle(&self, kind: TrackKind) -> MediaFlags {
        let flags = {
            let state = self.state();
            let Some(local) = state.call.as_ref().and_then(|c| c.local.as_ref()) else {
                return MediaFlags::default();
            };
            local.toggle(kind);
            MediaFlags::of(local)
        };
        self.publish([flags.event()]);
        flags
    }

    /// Applies one inbound negotiation message. `active_room` is the room the
    /// user is currently viewing; offers for other rooms are not surfaced.
    pub async fn handle_signal(
        &self,
        message: SignalMessage,
        active_room: Option<&RoomId>,
    ) -> Result<(), CallError> {
        match message {
            SignalMessage::Offer {
                room_id,
                sdp,
                from,
                with_video,
            } => {
                self.on_offer(room_id, sdp, from, with_video, active_room)
                    .await
            }
            SignalMessage::Answer { room_id, sdp } => self.on_answer(room_id, sdp).await,
            SignalMessage::IceCandidate { room_id, candidate } => {
                self.on_remote_candidate(room_id, candidate).await;
                Ok(())
            }
            SignalMessage::Ended { room_id } => {
                self.on_remote_ended(room_id).await;
                Ok(())
            }
        }
    }

    async fn on_offer(
        &self,
        room_id: RoomId,
        sdp: SessionDescription,
        from: Option<UserId>,
        with_video: bool,
        active_room: Option<&RoomId>,
    ) -> Result<(), CallError> {
        enum Outcome {
            Ringing,
            Busy,
            OutOfPhase(u64, CallPhase),
            Ignored,
        }

        let outcome = {
            let mut state = self.state();
            let existing = state
                .call
                .as_ref()
                .map(|c| (c.room_id == room_id, c.phase));
            match existing {
                Some((true, phase)) => Outcome::OutOfPhase(state.generation, phase),
                Some((false, _)) => Outcome::Busy,
                None if active_room != Some(&room_id) => Outcome::Ignored,
                None => {
                    let phase = CallPhase::Idle.apply(CallTransition::OfferReceived)?;
                    let mut call = ActiveCall::new(room_id.clone(), phase, with_video);
                    call.pending_offer = Some(sdp);
                    call.from = from.clone();
                    state.generation += 1;
                    state.call = Some(call);
                    Outcome::Ringing
                }
            }
        };

        match outcome {
            Outcome::Ringing => {
                info!(target: "Call", "Incoming call in {room_id}");
                self.publish([
                    Event::IncomingCall {
                        room_id: room_id.clone(),
                        from,
                        with_video,
                    },
                    Event::CallPhaseChanged {
                        room_id,
                        phase: CallPhase::IncomingRinging,
                    },
                ]);
                Ok(())
            }
            Outcome::Busy => {
                info!(target: "Call", "Declining offer from {room_id}: busy");
                self.notify_peer_ended(&room_id).await;
                Ok(())
            }
            // The caller always gets `callEnded`, even if our setup never left Idle.
            Outcome::OutOfPhase(generation, phase) => Err(self
                .abort_notifying(
                    generation,
                    CallError::Signaling(format!("offer received in phase {phase:?}")),
                )
                .await),
            Outcome::Ignored => {
                debug!(target: "Call", "Ignoring offer for inactive room {room_id}");
                Ok(())
            }
        }
    }

    async fn on_answer(&self, room_id: RoomId, sdp: SessionDescription) -> Result<(), CallError> {
        let target = {
            let state = self.state();
            state
                .call
                .as_ref()
                .filter(|c| c.room_id == room_id)
                .map(|c| (state.generation, c.phase, c.peer.clone()))
        };
        let Some((generation, phase, peer)) = target else {
            debug!(target: "Call", "Ignoring answer for {room_id}: no matching call");
            return Ok(());
        };
        let peer = match (phase, peer) {
            (CallPhase::Outgoing, Some(peer)) => peer,
            _ => {
                return Err(self
                    .abort(
                        generation,
                        CallError::Signaling(format!("answer received in phase {phase:?}")),
                    )
                    .await);
            }
        };

        self.apply_remote_description(generation, &peer, sdp)
            .await?;
        self.transition(generation, CallTransition::RemoteAnswered)
            .await
    }

    async fn on_remote_candidate(&self, room_id: RoomId, candidate: IceCandidate) {
        let peer = {
            let mut state = self.state();
            let Some(call) = state.call.as_mut().filter(|c| c.room_id == room_id) else {
                debug!(target: "Call", "Ignoring ICE candidate for {room_id}: no matching call");
                return;
            };
            match (&call.peer, call.remote_description_set) {
                (Some(peer), true) => peer.clone(),
                _ => {
                    debug!(target: "Call", "Queueing ICE candidate until remote description is set");
                    call.queued_candidates.push(candidate);
                    return;
                }
            }
        };
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            warn!(target: "Call", "Failed to apply ICE candidate: {e}");
        }
    }

    async fn on_remote_ended(&self, room_id: RoomId) {
        let call = {
            let mut state = self.state();
            if state.call.as_ref().is_some_and(|c| c.room_id == room_id) {
                state.take_call()
            } else {
                None
            }
        };
        match call {
            Some(call) => {
                info!(target: "Call", "Remote ended call in {room_id}");
                self.finish(call, CallEndReason::RemoteEnded, false).await;
            }
            None => debug!(target: "Call", "Ignoring callEnded for {room_id}"),
        }
    }

    /// Acquires local media and builds the peer connection with the local
    /// tracks attached.
    async fn attach_media(
        self: &Arc<Self>,
        generation: u64,
        with_video: bool,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        let local = match self
            .media
            .get_user_media(MediaConstraints::for_call(with_video))
            .await
        {
            Ok(local) => local,
            Err(e) => return Err(self.abort(generation, e.into()).await),
        };
        let room_id = {
            let mut state = self.state();
            match state.current_mut(generation) {
                Some(call) => {
                    call.local = Some(local.clone());
                    call.room_id.clone()
                }
                None => {
                    local.stop_all();
                    return Err(CallError::Cancelled);
                }
            }
        };
        self.publish([MediaFlags::of(&local).event()]);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = match self.peers.create_peer_connection(events_tx).await {
            Ok(peer) => peer,
            Err(e) => {
                return Err(self
                    .abort(generation, CallError::PeerConnection(e.to_string()))
                    .await);
            }
        };
        {
            let mut state = self.state();
            match state.current_mut(generation) {
                Some(call) => call.peer = Some(peer.clone()),
                None => {
                    peer.close();
                    return Err(CallError::Cancelled);
                }
            }
        }
        tokio::spawn(pump_peer_events(
            Arc::downgrade(self),
            events_rx,
            generation,
            room_id,
        ));

        for track in local.tracks() {
            if let Err(e) = peer.add_track(track.clone()) {
                return Err(self
                    .abort(generation, CallError::PeerConnection(e.to_string()))
                    .await);
            }
        }
        Ok(peer)
    }

    /// Sets the remote description, then flushes candidates that arrived
    /// before it.
    async fn apply_remote_description(
        &self,
        generation: u64,
        peer: &Arc<dyn PeerConnection>,
        description: SessionDescription,
    ) -> Result<(), CallError> {
        self.step(
            generation,
            peer.set_remote_description(description),
            CallError::Signaling,
        )
        .await?;

        let queued = {
            let mut state = self.state();
            let call = state
                .current_mut(generation)
                .ok_or(CallError::Cancelled)?;
            call.remote_description_set = true;
            std::mem::take(&mut call.queued_candidates)
        };
        if !queued.is_empty() {
            debug!(target: "Call", "Flushing {} queued ICE candidates", queued.len());
        }
        for candidate in queued {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!(target: "Call", "Failed to apply queued ICE candidate: {e}");
            }
        }
        Ok(())
    }

    /// Sends local candidates gathered before our description went out and
    /// lets later ones through directly.
    async fn release_local_candidates(&self, generation: u64, room_id: &RoomId) {
        let held = {
            let mut state = self.state();
            match state.current_mut(generation) {
                Some(call) => {
                    call.local_description_sent = true;
                    std::mem::take(&mut call.outbound_candidates)
                }
                None => return,
            }
        };
        for candidate in held {
            self.relay_local_candidate(room_id, candidate).await;
        }
    }

    async fn relay_local_candidate(&self, room_id: &RoomId, candidate: IceCandidate) {
        if let Err(e) = self.signal.send_ice_candidate(room_id, candidate).await {
            warn!(target: "Call", "Failed to relay local ICE candidate: {e}");
        }
    }

    /// Awaits one negotiation step. A failure aborts the call; a call that
    /// ended meanwhile yields `Cancelled`.
    async fn step<T, F>(
        &self,
        generation: u64,
        fut: F,
        wrap: fn(String) -> CallError,
    ) -> Result<T, CallError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let value = match fut.await {
            Ok(value) => value,
            Err(e) => return Err(self.abort(generation, wrap(e.to_string())).await),
        };
        if !self.is_current(generation) {
            return Err(CallError::Cancelled);
        }
        Ok(value)
    }

    async fn transition(
        &self,
        generation: u64,
        transition: CallTransition,
    ) -> Result<(), CallError> {
        let result = {
            let mut state = self.state();
            match state.current_mut(generation) {
                Some(call) => call.phase.apply(transition).map(|phase| {
                    call.phase = phase;
                    if phase == CallPhase::Connected {
                        call.pending_offer = None;
                        call.answering = false;
                    }
                    (call.room_id.clone(), phase)
                }),
                None => return Err(CallError::Cancelled),
            }
        };
        match result {
            Ok((room_id, phase)) => {
                debug!(target: "Call", "Call in {room_id} is now {phase:?}");
                self.publish([Event::CallPhaseChanged { room_id, phase }]);
                Ok(())
            }
            Err(e) => Err(self.abort(generation, e.into()).await),
        }
    }

    /// Tears down the call if `generation` is still current and reports `err`.
    async fn abort(&self, generation: u64, err: CallError) -> CallError {
        self.abort_call(generation, err, false).await
    }

    /// Like [`CallSession::abort`], but sends `callEnded` even when the call
    /// was still being set up locally.
    async fn abort_notifying(&self, generation: u64, err: CallError) -> CallError {
        self.abort_call(generation, err, true).await
    }

    async fn abort_call(&self, generation: u64, err: CallError, always_notify: bool) -> CallError {
        let call = {
            let mut state = self.state();
            if state.generation == generation {
                state.take_call()
            } else {
                None
            }
        };
        let Some(call) = call else {
            return CallError::Cancelled;
        };
        warn!(target: "Call", "Aborting call in {}: {err}", call.room_id);
        let notify = always_notify || !call.phase.is_idle();
        self.finish(call, CallEndReason::Failed, notify).await;
        if let Some(notice) = err.notice() {
            self.event_bus.notify_error(notice);
        }
        err
    }

    /// Releases everything the call owns and announces the return to idle.
    async fn finish(&self, mut call: ActiveCall, reason: CallEndReason, notify_peer: bool) {
        let had_media = call.local.is_some();
        call.release();

        let mut events = Vec::new();
        if had_media {
            events.push(MediaFlags::default().event());
        }
        if !call.phase.is_idle() {
            events.push(Event::CallPhaseChanged {
                room_id: call.room_id.clone(),
                phase: CallPhase::Idle,
            });
            events.push(Event::CallEnded {
                room_id: call.room_id.clone(),
                reason,
            });
        }
        self.publish(events);

        if notify_peer {
            self.notify_peer_ended(&call.room_id).await;
        }
    }

    async fn notify_peer_ended(&self, room_id: &RoomId) {
        if let Err(e) = self.signal.send_call_ended(room_id).await {
            warn!(target: "Call", "Failed to send callEnded to {room_id}: {e}");
            self.event_bus
                .notify_error(ErrorNotice::new(ErrorKind::Transport, e.to_string()));
        }
    }
}

async fn pump_peer_events(
    session: Weak<CallSession>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    generation: u64,
    room_id: RoomId,
) {
    while let Some(event) = events.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        if !session.is_current(generation) {
            break;
        }
        match event {
            PeerEvent::LocalIceCandidate(candidate) => {
                let ready = {
                    let mut state = session.state();
                    match state.current_mut(generation) {
                        Some(call) if call.local_description_sent => Some(candidate),
                        Some(call) => {
                            call.outbound_candidates.push(candidate);
                            None
                        }
                        None => None,
                    }
                };
                if let Some(candidate) = ready {
                    session.relay_local_candidate(&room_id, candidate).await;
                }
            }
            PeerEvent::RemoteStream(stream) => {
                let stored = {
                    let mut state = session.state();
                    match state.current_mut(generation) {
                        Some(call) => {
                            call.remote = Some(Arc::downgrade(&stream));
                            true
                        }
                        None => false,
                    }
                };
                if stored {
                    session.publish([Event::RemoteStreamAdded {
                        room_id: room_id.clone(),
                    }]);
                }
            }
            PeerEvent::ConnectionState(PeerConnectionState::Failed) => {
                session
                    .abort(
                        generation,
                        CallError::PeerConnection("ICE connection failed".to_string()),
                    )
                    .await;
                break;
            }
            PeerEvent::ConnectionState(state) => {
                debug!(target: "Call", "Peer connection state in {room_id}: {state:?}");
            }
        }
    }
}
