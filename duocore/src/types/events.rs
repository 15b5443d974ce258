use crate::types::call::CallPhase;
use crate::types::message::Message;
use crate::types::room::RoomId;
use crate::types::user::UserId;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Error classes surfaced to the user. Each maps to a distinct headline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Transport,
    Auth,
    MediaPermission,
    MediaDevice,
    Signaling,
    PeerConnection,
    Send,
    Upload,
}

impl ErrorKind {
    pub fn headline(self) -> &'static str {
        match self {
            Self::Transport => "Connection to the relay failed",
            Self::Auth => "Your session has expired, please sign in again",
            Self::MediaPermission => "Camera or microphone access was denied",
            Self::MediaDevice => "No usable camera or microphone was found",
            Self::Signaling => "The call could not be negotiated",
            Self::PeerConnection => "The call connection was lost",
            Self::Send => "The message could not be sent",
            Self::Upload => "The attachment could not be uploaded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorNotice {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ErrorNotice {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ErrorNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.headline(), self.detail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallEndReason {
    LocalHangUp,
    Rejected,
    RemoteEnded,
    Busy,
    Failed,
}

/// Observable state changes published to UI-side subscribers.
#[derive(Debug, Clone, Serialize)]
pub enum Event {
    Connected,
    Disconnected,
    PresenceChanged {
        online: Vec<UserId>,
    },
    TypingChanged {
        room_id: RoomId,
        typing: Vec<UserId>,
    },
    HistoryLoaded {
        room_id: RoomId,
        count: usize,
    },
    Message {
        room_id: RoomId,
        message: Message,
    },
    IncomingCall {
        room_id: RoomId,
        from: Option<UserId>,
        with_video: bool,
    },
    CallPhaseChanged {
        room_id: RoomId,
        phase: CallPhase,
    },
    RemoteStreamAdded {
        room_id: RoomId,
    },
    CallEnded {
        room_id: RoomId,
        reason: CallEndReason,
    },
    MediaStateChanged {
        muted: bool,
        video_off: bool,
    },
    Error(ErrorNotice),
}

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle_event(&self, event: &Event) {
        self(event)
    }
}

#[derive(Default, Clone)]
pub struct CoreEventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl CoreEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push(handler);
    }

    /// Returns true if there are any event handlers registered.
    pub fn has_handlers(&self) -> bool {
        !self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .is_empty()
    }

    pub fn dispatch(&self, event: &Event) {
        let handlers = self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .clone();
        for handler in handlers {
            handler.handle_event(event);
        }
    }

    pub fn notify_error(&self, notice: ErrorNotice) {
        self.dispatch(&Event::Error(notice));
    }
}
