//! Group call runtime.
//!
//! Hosts the `meshcore` session reducer and drives a full-mesh media topology
//! from it.
//!
//! # Architecture
//!
//! - [`SessionStore`]: single writer of the call session, with serialized
//!   dispatch, subscribers and the initiator's ringing timer
//! - [`PeerConnectionManager`]: one task that keeps a connection per remote
//!   participant in line with the session
//! - [`StreamRegistry`]: live media streams keyed by user
//! - [`CallCoordinator`]: routes relay signals into the store and announces
//!   local hangups
//! - [`SignalingChannel`]: the seam towards the relay; [`LocalRelay`] is the
//!   in-process implementation
//! - [`media`]: the peer-media seam, with an in-process loopback
//!
//! # Call flow
//!
//! The caller dispatches `CallInitiate` and emits `callInitiate`. The relay
//! rings every other chat member with `callIncoming`. A callee that accepts
//! moves to `connecting`, emits `callJoin`, captures audio and dials everyone
//! already in the room; the relay tells the room with `callUserJoined`. Once
//! a remote stream arrives the call is `connected`. Hanging up emits
//! `callHangup`; whoever is left alone receives `callEnded`.

mod coordinator;
mod error;
mod listeners;
pub mod media;
mod peer;
mod registry;
mod relay;
mod signaling;
mod store;

pub use coordinator::{CALL_ALREADY_ACTIVE, CallConfig, CallCoordinator};
pub use error::{CallError, MediaError};
pub use listeners::SubscriptionId;
pub use media::loopback::{LoopbackDevices, LoopbackNetwork};
pub use media::{
    ConnectionHandler, EndpointHandler, MediaConnection, MediaDevices, MediaStream, PeerEndpoint,
    PeerNetwork,
};
pub use peer::{MeshSnapshot, PeerConnectionManager};
pub use registry::{StreamListener, StreamMap, StreamRegistry};
pub use relay::{
    CALL_FULL, DEFAULT_MAX_PARTICIPANTS, LocalRelay, NO_CALL_IN_CHAT, RelayChannel, UNKNOWN_CHAT,
};
pub use signaling::{SignalHandler, SignalingChannel};
pub use store::{DEFAULT_RING_TIMEOUT, SessionListener, SessionStore, SessionUpdate};
