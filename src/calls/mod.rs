//! One-to-one audio/video calls negotiated over the relay connection.
//!
//! # Architecture
//!
//! - [`SignalRelay`]: room-scoped envelope for offer, answer, ICE and callEnded
//! - [`CallSession`]: the single-call state machine and resource owner
//! - [`media`]: capability traits over the platform capture and WebRTC stacks

mod error;
pub mod media;
mod session;
mod signaling;

pub use error::CallError;
pub use media::{
    LocalStream, MediaConstraints, MediaDevices, MediaError, MediaTrack, NoMediaDevices,
    NoPeerConnections, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent,
    RemoteStream,
};
pub use session::{CallSession, CallSnapshot, MediaFlags};
pub use signaling::{SignalMessage, SignalRelay};
