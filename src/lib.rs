//! Full-mesh group calling.
//!
//! The session model and relay vocabulary live in `meshcore`; this crate adds
//! the async runtime around them: the session store, the peer connection
//! manager, the stream registry and the coordinator that wires them to a
//! signaling relay.

pub mod calls;

// Core types are re-exported so callers only need this crate
pub use meshcore::{session, signaling, types};
