//! Stream registry: live media streams keyed by user.
//!
//! Kept outside the session store because stream attachment happens many
//! times during call setup and should not go through session reduction.
//! Writes notify subscribers synchronously with a fresh snapshot.

use log::debug;
use meshcore::types::UserId;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::listeners::{Listeners, SubscriptionId};
use super::media::MediaStream;

pub type StreamMap = HashMap<UserId, MediaStream>;

/// Receives registry snapshots after every write.
pub trait StreamListener: Send + Sync {
    fn on_streams_changed(&self, streams: &StreamMap);
}

impl<F> StreamListener for F
where
    F: Fn(&StreamMap) + Send + Sync,
{
    fn on_streams_changed(&self, streams: &StreamMap) {
        self(streams)
    }
}

#[derive(Default)]
pub struct StreamRegistry {
    streams: RwLock<StreamMap>,
    listeners: Listeners<dyn StreamListener>,
}

impl StreamRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_stream(&self, user_id: UserId, stream: MediaStream) {
        debug!("Stream {} attached for {}", stream.id(), user_id);
        let snapshot = {
            let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
            streams.insert(user_id, stream);
            streams.clone()
        };
        self.notify(&snapshot);
    }

    pub fn remove_stream(&self, user_id: &UserId) -> Option<MediaStream> {
        let (removed, snapshot) = {
            let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
            let removed = streams.remove(user_id);
            (removed, streams.clone())
        };
        if removed.is_some() {
            debug!("Stream removed for {}", user_id);
            self.notify(&snapshot);
        }
        removed
    }

    /// Drop every stream, e.g. when the call ends.
    pub fn clear(&self) {
        let had_streams = {
            let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
            let had_streams = !streams.is_empty();
            streams.clear();
            had_streams
        };
        if had_streams {
            self.notify(&StreamMap::new());
        }
    }

    pub fn get_streams(&self) -> StreamMap {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_stream(&self, user_id: &UserId) -> Option<MediaStream> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    pub fn subscribe(&self, listener: Arc<dyn StreamListener>) -> SubscriptionId {
        self.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.remove(id)
    }

    fn notify(&self, snapshot: &StreamMap) {
        for listener in self.listeners.snapshot() {
            listener.on_streams_changed(snapshot);
        }
    }
}
