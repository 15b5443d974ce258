//! Platform-agnostic core of the duochat session engine.
//!
//! Everything here is free of runtime-specific I/O: identifiers, the message
//! model, the relay wire protocol, the room registry, the call phase machine
//! and the collaborator traits the platform crate implements.

pub mod auth;
pub mod net;
pub mod protocol;
pub mod rooms;
pub mod types;
pub mod upload;

pub use rooms::RoomRegistry;
pub use types::call::{
    CallPhase, CallTransition, IceCandidate, InvalidTransition, SdpKind, SessionDescription,
    TrackKind,
};
pub use types::events::{CallEndReason, CoreEventBus, ErrorKind, ErrorNotice, Event, EventHandler};
pub use types::message::{Attachment, Message, MessageContent, SendError};
pub use types::room::RoomId;
pub use types::user::{Contact, UserId};
