//! Peer-media layer consumed by the peer connection manager.
//!
//! The manager never touches codecs or transports; it only needs to capture
//! local audio, open a dialable endpoint, dial and answer peers, and hear
//! about arriving streams and closed connections.
//!
//! # Architecture
//!
//! - [`MediaDevices`]: local capture device access
//! - [`PeerNetwork`]: opens the local [`PeerEndpoint`]
//! - [`PeerEndpoint`]: dials remote peers, reports inbound calls via [`EndpointHandler`]
//! - [`MediaConnection`]: one dialed or answered link, reports via [`ConnectionHandler`]
//! - [`loopback`]: in-process implementation for tests and the demo binary

pub mod loopback;

use async_trait::async_trait;
use meshcore::types::PeerId;
use std::fmt;
use std::sync::Arc;

use super::error::MediaError;

/// Handle to a live media stream. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    id: Arc<str>,
}

impl MediaStream {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self {
            id: Arc::from(id.as_ref()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Local capture device access.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Capture the microphone. May wait for a permission prompt.
    async fn acquire_audio(&self) -> Result<MediaStream, MediaError>;

    /// Stop capturing and release the device.
    fn release(&self, stream: &MediaStream);
}

#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Open a local endpoint that other peers can dial at `peer_id`.
    async fn open(&self, peer_id: &PeerId) -> Result<Arc<dyn PeerEndpoint>, MediaError>;
}

pub trait PeerEndpoint: Send + Sync {
    fn peer_id(&self) -> &PeerId;

    /// Install the handler for inbound calls and endpoint errors.
    fn set_handler(&self, handler: Arc<dyn EndpointHandler>);

    /// Dial `remote`, offering `local`.
    fn call(
        &self,
        remote: &PeerId,
        local: &MediaStream,
    ) -> Result<Arc<dyn MediaConnection>, MediaError>;

    /// Tear the endpoint down; it can no longer be dialed.
    fn destroy(&self);
}

pub trait MediaConnection: Send + Sync {
    fn remote_peer(&self) -> &PeerId;

    /// Install the stream/close handler. Events raised before a handler is
    /// installed are delivered on installation.
    fn set_handler(&self, handler: Arc<dyn ConnectionHandler>);

    /// Accept an inbound call with our local stream.
    fn answer(&self, local: &MediaStream);

    fn close(&self);
}

pub trait EndpointHandler: Send + Sync {
    fn on_call(&self, connection: Arc<dyn MediaConnection>);
    fn on_error(&self, error: MediaError);
}

pub trait ConnectionHandler: Send + Sync {
    fn on_stream(&self, stream: MediaStream);
    fn on_close(&self);
}
