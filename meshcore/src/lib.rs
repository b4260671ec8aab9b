//! Runtime-agnostic core of the call coordinator.
//!
//! Holds the identifiers and participant types, the call session reducer and
//! the signaling event vocabulary. Nothing here depends on an async runtime;
//! the `meshcall` crate hosts these pieces on tokio.

pub mod session;
pub mod signaling;
pub mod types;

pub use session::{CallSession, SessionAction, SessionError, SessionState};
pub use signaling::{IncomingSignal, OutgoingSignal};
