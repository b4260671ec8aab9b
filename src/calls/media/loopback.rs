//! In-process peer-media layer.
//!
//! Endpoints register on a shared [`LoopbackNetwork`] by peer id; dialing an
//! endpoint raises `on_call` on the remote side, answering delivers each
//! side's stream to the other, and closing one half raises `on_close` on the
//! other. Used by the integration tests and the demo binary.

use async_trait::async_trait;
use log::debug;
use meshcore::types::PeerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use super::{
    ConnectionHandler, EndpointHandler, MediaConnection, MediaDevices, MediaStream, PeerEndpoint,
    PeerNetwork,
};
use crate::calls::error::MediaError;

/// Capture devices that hand out synthetic streams.
pub struct LoopbackDevices {
    label: String,
    failure: Mutex<Option<MediaError>>,
    delay: Option<Duration>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl LoopbackDevices {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            failure: Mutex::new(None),
            delay: None,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }

    /// Devices whose acquisition takes `delay` (a slow permission prompt).
    pub fn with_delay(label: impl Into<String>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            failure: Mutex::new(None),
            delay: Some(delay),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }

    /// Make every following acquisition fail with `error`.
    pub fn fail_with(&self, error: MediaError) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Captures currently held open.
    pub fn active_captures(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    async fn acquire_audio(&self) -> Result<MediaStream, MediaError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(error) = failure {
            return Err(error);
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MediaStream::new(format!("{}-mic-{}", self.label, n)))
    }

    fn release(&self, stream: &MediaStream) {
        debug!("Releasing capture {}", stream);
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<PeerId, Arc<LoopbackEndpoint>>>,
    dials: AtomicUsize,
    next_link: AtomicU64,
}

/// Shared switchboard connecting loopback endpoints.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total dial attempts across all endpoints.
    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    pub fn is_open(&self, peer_id: &PeerId) -> bool {
        self.inner
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(peer_id)
    }

    /// Simulate a transport failure on an endpoint.
    pub fn inject_error(&self, peer_id: &PeerId, error: MediaError) {
        let endpoint = self
            .inner
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .cloned();
        if let Some(handler) = endpoint.and_then(|e| e.handler()) {
            handler.on_error(error);
        }
    }
}

#[async_trait]
impl PeerNetwork for LoopbackNetwork {
    async fn open(&self, peer_id: &PeerId) -> Result<Arc<dyn PeerEndpoint>, MediaError> {
        let endpoint = Arc::new(LoopbackEndpoint {
            peer_id: peer_id.clone(),
            handler: Mutex::new(None),
            network: Arc::downgrade(&self.inner),
            destroyed: AtomicBool::new(false),
        });
        let mut endpoints = self
            .inner
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if endpoints.contains_key(peer_id) {
            return Err(MediaError::EndpointUnavailable(peer_id.to_string()));
        }
        endpoints.insert(peer_id.clone(), endpoint.clone());
        debug!("Loopback endpoint {} open", peer_id);
        Ok(endpoint as Arc<dyn PeerEndpoint>)
    }
}

pub struct LoopbackEndpoint {
    peer_id: PeerId,
    handler: Mutex<Option<Arc<dyn EndpointHandler>>>,
    network: Weak<NetworkInner>,
    destroyed: AtomicBool,
}

impl LoopbackEndpoint {
    fn handler(&self) -> Option<Arc<dyn EndpointHandler>> {
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PeerEndpoint for LoopbackEndpoint {
    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn set_handler(&self, handler: Arc<dyn EndpointHandler>) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn call(
        &self,
        remote: &PeerId,
        local: &MediaStream,
    ) -> Result<Arc<dyn MediaConnection>, MediaError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(MediaError::EndpointUnavailable(self.peer_id.to_string()));
        }
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| MediaError::EndpointUnavailable(self.peer_id.to_string()))?;
        network.dials.fetch_add(1, Ordering::SeqCst);

        let target = network
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(remote)
            .cloned();
        let target_handler = target
            .and_then(|t| t.handler())
            .ok_or_else(|| MediaError::PeerUnreachable(remote.to_string()))?;

        let link = Arc::new(Link {
            id: network.next_link.fetch_add(1, Ordering::SeqCst),
            state: Mutex::new(LinkState {
                closed: false,
                offer: local.clone(),
                sides: [Side::default(), Side::default()],
            }),
        });
        debug!("Loopback link {}: {} -> {}", link.id, self.peer_id, remote);

        let outbound: Arc<dyn MediaConnection> = Arc::new(LoopbackConnection {
            link: link.clone(),
            side: CALLER,
            remote: remote.clone(),
        });
        let inbound: Arc<dyn MediaConnection> = Arc::new(LoopbackConnection {
            link,
            side: CALLEE,
            remote: self.peer_id.clone(),
        });
        target_handler.on_call(inbound);
        Ok(outbound)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(network) = self.network.upgrade() {
            let mut endpoints = network
                .endpoints
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            // The id may already belong to a newer endpoint
            if endpoints
                .get(&self.peer_id)
                .is_some_and(|e| std::ptr::eq(Arc::as_ptr(e), self))
            {
                endpoints.remove(&self.peer_id);
            }
        }
        debug!("Loopback endpoint {} destroyed", self.peer_id);
    }
}

const CALLER: usize = 0;
const CALLEE: usize = 1;

enum LinkEvent {
    Stream(MediaStream),
    Close,
}

#[derive(Default)]
struct Side {
    handler: Option<Arc<dyn ConnectionHandler>>,
    pending: Vec<LinkEvent>,
}

struct LinkState {
    closed: bool,
    offer: MediaStream,
    sides: [Side; 2],
}

struct Link {
    id: u64,
    state: Mutex<LinkState>,
}

impl Link {
    fn deliver(&self, side: usize, event: LinkEvent) {
        let handler = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match state.sides[side].handler.clone() {
                Some(handler) => handler,
                None => {
                    state.sides[side].pending.push(event);
                    return;
                }
            }
        };
        dispatch(&handler, event);
    }
}

fn dispatch(handler: &Arc<dyn ConnectionHandler>, event: LinkEvent) {
    match event {
        LinkEvent::Stream(stream) => handler.on_stream(stream),
        LinkEvent::Close => handler.on_close(),
    }
}

/// One half of a loopback link.
pub struct LoopbackConnection {
    link: Arc<Link>,
    side: usize,
    remote: PeerId,
}

impl MediaConnection for LoopbackConnection {
    fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    fn set_handler(&self, handler: Arc<dyn ConnectionHandler>) {
        let pending = {
            let mut state = self
                .link
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let side = &mut state.sides[self.side];
            side.handler = Some(handler.clone());
            std::mem::take(&mut side.pending)
        };
        for event in pending {
            dispatch(&handler, event);
        }
    }

    fn answer(&self, local: &MediaStream) {
        let offer = {
            let state = self
                .link
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if state.closed || self.side != CALLEE {
                return;
            }
            state.offer.clone()
        };
        self.link.deliver(CALLER, LinkEvent::Stream(local.clone()));
        self.link.deliver(CALLEE, LinkEvent::Stream(offer));
    }

    fn close(&self) {
        {
            let mut state = self
                .link
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.link.deliver(1 - self.side, LinkEvent::Close);
    }
}
