//! Signaling channel seam.
//!
//! The relay protocol itself (event names, payload shapes) lives in
//! [`meshcore::signaling`]; this module only defines how the coordinator talks
//! to whatever carries those events.

use meshcore::signaling::{IncomingSignal, OutgoingSignal};
use std::sync::Arc;

use super::listeners::SubscriptionId;

/// Receives every signal arriving from the relay, in arrival order.
pub trait SignalHandler: Send + Sync {
    fn on_signal(&self, signal: &IncomingSignal);
}

impl<F> SignalHandler for F
where
    F: Fn(&IncomingSignal) + Send + Sync,
{
    fn on_signal(&self, signal: &IncomingSignal) {
        self(signal)
    }
}

/// Bidirectional connection to the signaling relay.
///
/// `emit` is fire-and-forget; failures surface later as `callError` signals.
/// Handlers may be invoked from within `emit` when the relay answers
/// synchronously, so they must not assume they run on a separate task.
pub trait SignalingChannel: Send + Sync {
    fn emit(&self, signal: OutgoingSignal);

    fn subscribe(&self, handler: Arc<dyn SignalHandler>) -> SubscriptionId;

    /// Returns false if `id` was not subscribed.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}
