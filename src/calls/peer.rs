//! Peer connection manager.
//!
//! Keeps a full-mesh media topology in line with the call session: one
//! connection per remote participant, keyed by user id.
//!
//! All mesh state (connections, the local capture, the local endpoint) is
//! owned by a single task. Store notifications and peer-layer callbacks are
//! queued to that task, which reconciles against the store's *current*
//! snapshot rather than the snapshot that triggered it. Repeated identical
//! snapshots are therefore harmless, and after every await the task checks
//! that the call it was working for is still live before applying results.
//!
//! A connection that drops while its user is still listed is redialed once.
//! If that fails and no other connection is left, the local side leaves the
//! call with [`EndReason::ConnectionLost`].

use log::{debug, info, warn};
use meshcore::types::{
    CallId, CallStatus, ChatId, EndReason, Participant, PeerId, StreamKind, UserId,
};
use meshcore::{CallSession, SessionAction};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::error::{CallError, MediaError};
use super::listeners::SubscriptionId;
use super::media::{
    ConnectionHandler, EndpointHandler, MediaConnection, MediaDevices, MediaStream, PeerEndpoint,
    PeerNetwork,
};
use super::registry::StreamRegistry;
use super::store::{SessionListener, SessionStore, SessionUpdate};

/// Point-in-time view of the mesh, for diagnostics and tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MeshSnapshot {
    pub call_id: Option<CallId>,
    /// Users we hold a connection to, sorted.
    pub connections: Vec<UserId>,
    /// Users whose remote stream has arrived, sorted.
    pub streaming: Vec<UserId>,
    /// Outbound dial attempts made since the manager started.
    pub dials: usize,
    pub has_local_media: bool,
}

enum MeshEvent {
    SessionChanged,
    InboundCall(Arc<dyn MediaConnection>),
    RemoteStream { seq: u64, stream: MediaStream },
    ConnectionClosed { seq: u64 },
    EndpointError(MediaError),
    Inspect(oneshot::Sender<MeshSnapshot>),
    Shutdown,
}

/// Forwards store notifications to the mesh task.
struct SessionForwarder {
    events: mpsc::UnboundedSender<MeshEvent>,
}

impl SessionListener for SessionForwarder {
    fn on_session_update(&self, _update: &SessionUpdate) {
        let _ = self.events.send(MeshEvent::SessionChanged);
    }
}

struct EndpointEvents {
    events: mpsc::UnboundedSender<MeshEvent>,
}

impl EndpointHandler for EndpointEvents {
    fn on_call(&self, connection: Arc<dyn MediaConnection>) {
        let _ = self.events.send(MeshEvent::InboundCall(connection));
    }

    fn on_error(&self, error: MediaError) {
        let _ = self.events.send(MeshEvent::EndpointError(error));
    }
}

struct ConnectionEvents {
    seq: u64,
    events: mpsc::UnboundedSender<MeshEvent>,
}

impl ConnectionHandler for ConnectionEvents {
    fn on_stream(&self, stream: MediaStream) {
        let _ = self.events.send(MeshEvent::RemoteStream {
            seq: self.seq,
            stream,
        });
    }

    fn on_close(&self) {
        let _ = self.events.send(MeshEvent::ConnectionClosed { seq: self.seq });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outbound,
    Inbound,
}

struct Connection {
    seq: u64,
    handle: Arc<dyn MediaConnection>,
    direction: Direction,
    /// The user has been seen in the session's participant list. Inbound
    /// calls can overtake the join signal; those are only closed for
    /// departure once the user was actually listed.
    listed: bool,
    streaming: bool,
}

struct LocalMedia {
    chat_id: ChatId,
    call_id: CallId,
    stream: MediaStream,
    endpoint: Arc<dyn PeerEndpoint>,
}

struct MeshWorker {
    local_user: Participant,
    store: Arc<SessionStore>,
    registry: Arc<StreamRegistry>,
    devices: Arc<dyn MediaDevices>,
    network: Arc<dyn PeerNetwork>,
    events: mpsc::UnboundedSender<MeshEvent>,
    connections: HashMap<UserId, Connection>,
    /// Users already redialed after an unexpected close in this call.
    redialed: HashSet<UserId>,
    local: Option<LocalMedia>,
    next_seq: u64,
    dials: usize,
}

impl MeshWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MeshEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                MeshEvent::SessionChanged => self.reconcile().await,
                MeshEvent::InboundCall(connection) => self.on_inbound_call(connection),
                MeshEvent::RemoteStream { seq, stream } => self.on_remote_stream(seq, stream),
                MeshEvent::ConnectionClosed { seq } => self.on_connection_closed(seq),
                MeshEvent::EndpointError(error) => self.on_endpoint_error(error),
                MeshEvent::Inspect(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                MeshEvent::Shutdown => break,
            }
        }
        self.teardown();
        debug!("Mesh task for {} stopped", self.local_user.id);
    }

    /// The live session, if it is still `call`.
    fn current(&self, chat_id: &ChatId, call_id: &CallId) -> Option<CallSession> {
        self.store
            .active_call()
            .filter(|c| c.is_live() && &c.chat_id == chat_id && &c.call_id == call_id)
    }

    async fn reconcile(&mut self) {
        let Some(call) = self.store.active_call().filter(CallSession::is_live) else {
            self.teardown();
            return;
        };

        if self
            .local
            .as_ref()
            .is_some_and(|local| local.call_id != call.call_id || local.chat_id != call.chat_id)
        {
            // Media from a previous call must not leak into this one
            self.teardown();
        }

        if self.local.is_none() {
            let wants_media = match call.call_status {
                CallStatus::Ringing => call.is_initiator,
                CallStatus::Connecting => true,
                CallStatus::Connected | CallStatus::Ended => false,
            };
            if !wants_media || call.local_stream_ready {
                return;
            }
            if !self.acquire_local_media(&call).await {
                return;
            }
        }

        // Acquisition may have taken a while; work from the latest participants
        if let Some(call) = self.current(&call.chat_id, &call.call_id) {
            self.sync_connections(&call);
        }
    }

    /// Capture audio and open the local endpoint. Returns false if the call
    /// went away or media could not be set up.
    async fn acquire_local_media(&mut self, call: &CallSession) -> bool {
        info!("Acquiring local audio for call {}", call.call_id);
        let stream = match self.devices.acquire_audio().await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_media(call, e);
                return false;
            }
        };
        if self.current(&call.chat_id, &call.call_id).is_none() {
            debug!(
                "Call {} ended during media acquisition, releasing capture",
                call.call_id
            );
            self.devices.release(&stream);
            return false;
        }

        let peer_id = PeerId::from(&self.local_user.id);
        let endpoint = match self.network.open(&peer_id).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.devices.release(&stream);
                self.fail_media(call, e);
                return false;
            }
        };
        if self.current(&call.chat_id, &call.call_id).is_none() {
            debug!(
                "Call {} ended while opening endpoint {}",
                call.call_id, peer_id
            );
            endpoint.destroy();
            self.devices.release(&stream);
            return false;
        }

        endpoint.set_handler(Arc::new(EndpointEvents {
            events: self.events.clone(),
        }));
        self.registry
            .set_stream(self.local_user.id.clone(), stream.clone());
        self.local = Some(LocalMedia {
            chat_id: call.chat_id.clone(),
            call_id: call.call_id.clone(),
            stream,
            endpoint,
        });
        info!("Local media ready for call {} at {}", call.call_id, peer_id);
        self.store.dispatch(SessionAction::SetStreamReady {
            kind: StreamKind::Local,
            ready: true,
        });
        true
    }

    /// A call without local media cannot proceed; leave it cleanly.
    fn fail_media(&self, call: &CallSession, error: MediaError) {
        if self.current(&call.chat_id, &call.call_id).is_none() {
            debug!("Ignoring media failure for finished call {}: {}", call.call_id, error);
            return;
        }
        warn!("Local media failed for call {}: {}", call.call_id, error);
        self.store
            .dispatch(SessionAction::SetError(format!("Could not start audio: {error}")));
        self.store.dispatch(SessionAction::CallHangup {
            chat_id: call.chat_id.clone(),
            user_id: self.local_user.id.clone(),
            reason: EndReason::MediaFailure,
        });
    }

    fn sync_connections(&mut self, call: &CallSession) {
        let Some(local) = &self.local else {
            return;
        };
        let wanted: HashMap<&UserId, &PeerId> = call
            .participants
            .iter()
            .filter(|p| p.user_id() != &self.local_user.id)
            .map(|p| (p.user_id(), &p.peer_id))
            .collect();

        let departed: Vec<UserId> = self
            .connections
            .iter_mut()
            .filter_map(|(user_id, connection)| {
                if wanted.contains_key(user_id) {
                    connection.listed = true;
                    None
                } else if connection.listed {
                    Some(user_id.clone())
                } else {
                    None
                }
            })
            .collect();
        for user_id in departed {
            if let Some(connection) = self.connections.remove(&user_id) {
                info!("{} left call {}, closing connection", user_id, call.call_id);
                connection.handle.close();
                self.registry.remove_stream(&user_id);
            }
        }

        let to_dial: Vec<(UserId, PeerId)> = wanted
            .into_iter()
            .filter(|(user_id, _)| !self.connections.contains_key(*user_id))
            .map(|(user_id, peer_id)| (user_id.clone(), peer_id.clone()))
            .collect();
        let endpoint = local.endpoint.clone();
        let stream = local.stream.clone();
        for (user_id, peer_id) in to_dial {
            self.dial(&endpoint, &stream, user_id, peer_id);
        }
    }

    /// Returns whether a connection was set up.
    fn dial(
        &mut self,
        endpoint: &Arc<dyn PeerEndpoint>,
        stream: &MediaStream,
        user_id: UserId,
        peer_id: PeerId,
    ) -> bool {
        self.dials += 1;
        debug!("Dialing {} at {}", user_id, peer_id);
        match endpoint.call(&peer_id, stream) {
            Ok(handle) => {
                let seq = self.register(user_id, handle.clone(), Direction::Outbound, true);
                handle.set_handler(Arc::new(ConnectionEvents {
                    seq,
                    events: self.events.clone(),
                }));
                true
            }
            // Their endpoint is not up yet; they dial us once it is
            Err(MediaError::PeerUnreachable(_)) => {
                debug!("{} not reachable yet at {}", user_id, peer_id);
                false
            }
            Err(e) => {
                warn!("Dialing {} failed: {}", user_id, e);
                self.store.dispatch(SessionAction::SetError(format!(
                    "Could not connect to {user_id}: {e}"
                )));
                false
            }
        }
    }

    fn redial(&mut self, call: &CallSession, user_id: &UserId) -> bool {
        let Some(local) = &self.local else {
            return false;
        };
        let Some(peer_id) = call.participant(user_id).map(|p| p.peer_id.clone()) else {
            return false;
        };
        let endpoint = local.endpoint.clone();
        let stream = local.stream.clone();
        info!("Redialing {} at {}", user_id, peer_id);
        self.dial(&endpoint, &stream, user_id.clone(), peer_id)
    }

    fn register(
        &mut self,
        user_id: UserId,
        handle: Arc<dyn MediaConnection>,
        direction: Direction,
        listed: bool,
    ) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.connections.insert(
            user_id,
            Connection {
                seq,
                handle,
                direction,
                listed,
                streaming: false,
            },
        );
        seq
    }

    fn on_inbound_call(&mut self, connection: Arc<dyn MediaConnection>) {
        let remote = connection.remote_peer().clone();
        let Some(local) = &self.local else {
            debug!("Rejecting call from {}: no local media", remote);
            connection.close();
            return;
        };
        let Some(call) = self.current(&local.chat_id, &local.call_id) else {
            debug!("Rejecting call from {}: call is over", remote);
            connection.close();
            return;
        };

        let participant = call.participant_by_peer(&remote);
        let listed = participant.is_some();
        let user_id = participant
            .map(|p| p.user_id().clone())
            .unwrap_or_else(|| UserId::new(remote.as_str()));

        if let Some(existing) = self.connections.get(&user_id) {
            // Both sides dialed each other. Keep the link dialed by the
            // smaller user id so both ends agree on the survivor.
            if existing.direction == Direction::Inbound || self.local_user.id < user_id {
                debug!("Dropping duplicate call from {}", user_id);
                connection.close();
                return;
            }
            debug!("Glare with {}, switching to their call", user_id);
            if let Some(outbound) = self.connections.remove(&user_id) {
                outbound.handle.close();
            }
        }

        info!("Answering call from {} ({})", user_id, remote);
        let stream = local.stream.clone();
        let seq = self.register(user_id, connection.clone(), Direction::Inbound, listed);
        connection.set_handler(Arc::new(ConnectionEvents {
            seq,
            events: self.events.clone(),
        }));
        connection.answer(&stream);
    }

    fn user_for_seq(&self, seq: u64) -> Option<UserId> {
        self.connections
            .iter()
            .find(|(_, c)| c.seq == seq)
            .map(|(user_id, _)| user_id.clone())
    }

    fn on_remote_stream(&mut self, seq: u64, stream: MediaStream) {
        let Some(user_id) = self.user_for_seq(seq) else {
            debug!("Stream {} from a retired connection", stream);
            return;
        };
        let live = self
            .local
            .as_ref()
            .is_some_and(|local| self.current(&local.chat_id, &local.call_id).is_some());
        if !live {
            return;
        }
        if let Some(connection) = self.connections.get_mut(&user_id) {
            connection.streaming = true;
        }
        info!("Remote stream {} from {}", stream, user_id);
        self.registry.set_stream(user_id, stream);
        self.store.dispatch(SessionAction::SetStreamReady {
            kind: StreamKind::Remote,
            ready: true,
        });
        self.store.dispatch(SessionAction::CallConnected);
    }

    fn on_connection_closed(&mut self, seq: u64) {
        let Some(user_id) = self.user_for_seq(seq) else {
            return;
        };
        self.connections.remove(&user_id);
        self.registry.remove_stream(&user_id);

        let call = self
            .local
            .as_ref()
            .and_then(|local| self.current(&local.chat_id, &local.call_id))
            .filter(|call| call.has_participant(&user_id));
        let Some(call) = call else {
            debug!("Connection to {} closed", user_id);
            return;
        };

        warn!("Connection to {} closed unexpectedly", user_id);
        if self.redialed.insert(user_id.clone()) && self.redial(&call, &user_id) {
            return;
        }
        self.store
            .dispatch(SessionAction::SetError(format!("Lost connection to {user_id}")));
        if self.connections.is_empty() {
            warn!("No peers left in call {}, leaving", call.call_id);
            self.store.dispatch(SessionAction::CallHangup {
                chat_id: call.chat_id,
                user_id: self.local_user.id.clone(),
                reason: EndReason::ConnectionLost,
            });
        }
    }

    fn on_endpoint_error(&self, error: MediaError) {
        warn!("Peer endpoint error: {}", error);
        if self.store.active_call().is_some_and(|c| c.is_live()) {
            self.store
                .dispatch(SessionAction::SetError(format!("Peer connection error: {error}")));
        }
    }

    /// Release everything. Safe to call repeatedly.
    fn teardown(&mut self) {
        self.redialed.clear();
        if self.local.is_none() && self.connections.is_empty() {
            return;
        }
        for (user_id, connection) in self.connections.drain() {
            debug!("Closing connection to {}", user_id);
            connection.handle.close();
        }
        if let Some(local) = self.local.take() {
            local.endpoint.destroy();
            self.devices.release(&local.stream);
            info!("Released local media for call {}", local.call_id);
        }
        self.registry.clear();
    }

    fn snapshot(&self) -> MeshSnapshot {
        let mut connections: Vec<UserId> = self.connections.keys().cloned().collect();
        connections.sort();
        let mut streaming: Vec<UserId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.streaming)
            .map(|(user_id, _)| user_id.clone())
            .collect();
        streaming.sort();
        MeshSnapshot {
            call_id: self.local.as_ref().map(|l| l.call_id.clone()),
            connections,
            streaming,
            dials: self.dials,
            has_local_media: self.local.is_some(),
        }
    }
}

/// Drives the media mesh from session store updates.
pub struct PeerConnectionManager {
    events: mpsc::UnboundedSender<MeshEvent>,
    store: Arc<SessionStore>,
    subscription: SubscriptionId,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerConnectionManager {
    /// Start the mesh task and subscribe it to `store`. Must be called from
    /// within a tokio runtime.
    pub fn spawn(
        local_user: Participant,
        store: Arc<SessionStore>,
        registry: Arc<StreamRegistry>,
        devices: Arc<dyn MediaDevices>,
        network: Arc<dyn PeerNetwork>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = MeshWorker {
            local_user,
            store: store.clone(),
            registry,
            devices,
            network,
            events: tx.clone(),
            connections: HashMap::new(),
            redialed: HashSet::new(),
            local: None,
            next_seq: 0,
            dials: 0,
        };
        let task = tokio::spawn(worker.run(rx));

        let subscription = store.subscribe(Arc::new(SessionForwarder { events: tx.clone() }));
        // Pick up a session that existed before we subscribed
        let _ = tx.send(MeshEvent::SessionChanged);

        Arc::new(Self {
            events: tx,
            store,
            subscription,
            task: Mutex::new(Some(task)),
        })
    }

    /// Mesh state after every previously queued event has been handled.
    pub async fn inspect(&self) -> Result<MeshSnapshot, CallError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(MeshEvent::Inspect(reply))
            .map_err(|_| CallError::ManagerStopped)?;
        rx.await.map_err(|_| CallError::ManagerStopped)
    }

    /// Stop following the store, release all media and wait for the task.
    pub async fn shutdown(&self) {
        self.store.unsubscribe(self.subscription);
        let _ = self.events.send(MeshEvent::Shutdown);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!("Mesh task ended abnormally: {}", e);
        }
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        self.store.unsubscribe(self.subscription);
        let _ = self.events.send(MeshEvent::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::media::loopback::{LoopbackDevices, LoopbackNetwork};
    use crate::calls::store::DEFAULT_RING_TIMEOUT;
    use std::time::Duration;

    fn user(id: &str) -> Participant {
        Participant::new(id, id.to_uppercase())
    }

    struct Harness {
        store: Arc<SessionStore>,
        registry: Arc<StreamRegistry>,
        devices: Arc<LoopbackDevices>,
        manager: Arc<PeerConnectionManager>,
    }

    fn harness(local: &str, network: &LoopbackNetwork, devices: Arc<LoopbackDevices>) -> Harness {
        let store = SessionStore::new(DEFAULT_RING_TIMEOUT);
        let registry = StreamRegistry::new();
        let manager = PeerConnectionManager::spawn(
            user(local),
            store.clone(),
            registry.clone(),
            devices.clone(),
            Arc::new(network.clone()),
        );
        Harness {
            store,
            registry,
            devices,
            manager,
        }
    }

    /// A remote peer that answers every call it receives.
    struct AutoAnswer {
        stream: MediaStream,
        calls: Mutex<Vec<Arc<dyn MediaConnection>>>,
    }

    impl EndpointHandler for AutoAnswer {
        fn on_call(&self, connection: Arc<dyn MediaConnection>) {
            connection.answer(&self.stream);
            self.calls.lock().unwrap().push(connection);
        }

        fn on_error(&self, _error: MediaError) {}
    }

    impl AutoAnswer {
        /// Close every answered call from this side.
        fn drop_calls(&self) {
            let calls: Vec<_> = self.calls.lock().unwrap().drain(..).collect();
            for call in calls {
                call.close();
            }
        }
    }

    struct RemotePeer {
        endpoint: Arc<dyn PeerEndpoint>,
        answer: Arc<AutoAnswer>,
    }

    async fn remote_peer(network: &LoopbackNetwork, id: &str) -> RemotePeer {
        let endpoint = network.open(&id.into()).await.unwrap();
        let answer = Arc::new(AutoAnswer {
            stream: MediaStream::new(format!("{id}-mic")),
            calls: Mutex::new(Vec::new()),
        });
        endpoint.set_handler(answer.clone());
        RemotePeer { endpoint, answer }
    }

    fn incoming(caller: &str) -> SessionAction {
        SessionAction::IncomingCall {
            chat_id: "chat-1".into(),
            call_id: "call-1".into(),
            caller: user(caller),
            peer_id: caller.into(),
        }
    }

    fn joined(id: &str) -> SessionAction {
        SessionAction::UserJoined {
            chat_id: "chat-1".into(),
            user: user(id),
            peer_id: id.into(),
        }
    }

    /// Let queued mesh events (including ones the manager queued itself) drain.
    async fn settle(manager: &PeerConnectionManager) -> MeshSnapshot {
        let mut last = manager.inspect().await.unwrap();
        loop {
            tokio::task::yield_now().await;
            let next = manager.inspect().await.unwrap();
            if next == last {
                return next;
            }
            last = next;
        }
    }

    #[tokio::test]
    async fn test_mesh_converges_without_redials() {
        let network = LoopbackNetwork::new();
        remote_peer(&network, "bob").await;
        remote_peer(&network, "carol").await;
        let h = harness("alice", &network, LoopbackDevices::new("alice"));

        h.store.dispatch(incoming("bob"));
        h.store.dispatch(SessionAction::CallAccepted);
        h.store.dispatch(joined("alice"));
        h.store.dispatch(joined("carol"));

        let mesh = settle(&h.manager).await;
        assert_eq!(mesh.connections, vec![UserId::new("bob"), UserId::new("carol")]);
        assert_eq!(mesh.dials, 2);
        assert_eq!(h.devices.acquired(), 1);

        // Identical snapshots again: nothing new is dialed or acquired
        h.store.dispatch(joined("carol"));
        h.store.dispatch(joined("bob"));
        let mesh = settle(&h.manager).await;
        assert_eq!(mesh.dials, 2);
        assert_eq!(mesh.connections.len(), 2);
        assert_eq!(h.devices.acquired(), 1);

        assert_eq!(h.store.snapshot().status(), Some(CallStatus::Connected));
        let streams = h.registry.get_streams();
        assert_eq!(streams.len(), 3);
        assert_eq!(streams[&UserId::new("bob")].id(), "bob-mic");
        assert_eq!(mesh.streaming.len(), 2);
    }

    #[tokio::test]
    async fn test_ringing_callee_does_not_acquire_media() {
        let network = LoopbackNetwork::new();
        let h = harness("alice", &network, LoopbackDevices::new("alice"));

        h.store.dispatch(incoming("bob"));
        let mesh = settle(&h.manager).await;
        assert!(!mesh.has_local_media);
        assert_eq!(h.devices.acquired(), 0);
    }

    #[tokio::test]
    async fn test_initiator_acquires_media_while_ringing() {
        let network = LoopbackNetwork::new();
        let h = harness("alice", &network, LoopbackDevices::new("alice"));

        h.store.dispatch(SessionAction::CallInitiate {
            chat_id: "chat-1".into(),
            call_id: "call-1".into(),
            caller: user("alice"),
            peer_id: "alice".into(),
        });
        let mesh = settle(&h.manager).await;
        assert!(mesh.has_local_media);
        assert!(network.is_open(&"alice".into()));
        assert!(h.store.active_call().unwrap().local_stream_ready);
        // Only the local user is present, so no connection yet
        assert_eq!(h.store.snapshot().status(), Some(CallStatus::Ringing));
        assert!(mesh.connections.is_empty());
    }

    #[tokio::test]
    async fn test_departure_closes_connection_and_stream() {
        let network = LoopbackNetwork::new();
        let bob = remote_peer(&network, "bob").await;
        remote_peer(&network, "carol").await;
        let h = harness("alice", &network, LoopbackDevices::new("alice"));

        h.store.dispatch(incoming("bob"));
        h.store.dispatch(SessionAction::CallAccepted);
        h.store.dispatch(joined("alice"));
        h.store.dispatch(joined("carol"));
        settle(&h.manager).await;

        h.store.dispatch(SessionAction::UserLeft {
            chat_id: "chat-1".into(),
            user_id: "bob".into(),
        });
        let mesh = settle(&h.manager).await;
        assert_eq!(mesh.connections, vec![UserId::new("carol")]);
        assert!(h.registry.get_stream(&"bob".into()).is_none());
        assert_eq!(bob.answer.calls.lock().unwrap().len(), 1);
        // carol is still there, so the call goes on
        assert_eq!(h.store.snapshot().status(), Some(CallStatus::Connected));
    }

    /// Brings alice into a connected call with `remotes`, alice being the callee of the first.
    async fn connected_call(network: &LoopbackNetwork, remotes: &[&str]) -> Harness {
        let h = harness("alice", network, LoopbackDevices::new("alice"));
        h.store.dispatch(incoming(remotes[0]));
        h.store.dispatch(SessionAction::CallAccepted);
        h.store.dispatch(joined("alice"));
        for id in &remotes[1..] {
            h.store.dispatch(joined(id));
        }
        let mesh = settle(&h.manager).await;
        assert_eq!(mesh.connections.len(), remotes.len());
        assert_eq!(h.store.snapshot().status(), Some(CallStatus::Connected));
        h
    }

    #[tokio::test]
    async fn test_dropped_connection_is_redialed_once() {
        let network = LoopbackNetwork::new();
        let bob = remote_peer(&network, "bob").await;
        let h = connected_call(&network, &["bob"]).await;

        bob.answer.drop_calls();
        let mesh = settle(&h.manager).await;
        assert_eq!(mesh.connections, vec![UserId::new("bob")]);
        assert_eq!(mesh.dials, 2);
        assert_eq!(h.store.snapshot().status(), Some(CallStatus::Connected));
        assert!(h.store.error().is_none());

        // The second drop is final, and bob was the only peer
        bob.answer.drop_calls();
        let mesh = settle(&h.manager).await;
        assert!(mesh.connections.is_empty());
        assert_eq!(mesh.dials, 2);
        let call = h.store.active_call().unwrap();
        assert_eq!(call.call_status, CallStatus::Ended);
        assert_eq!(call.end_reason, Some(EndReason::ConnectionLost));
        assert_eq!(h.store.error().as_deref(), Some("Lost connection to bob"));
    }

    #[tokio::test]
    async fn test_losing_only_peer_ends_call() {
        let network = LoopbackNetwork::new();
        let bob = remote_peer(&network, "bob").await;
        let h = connected_call(&network, &["bob"]).await;

        bob.endpoint.destroy();
        bob.answer.drop_calls();
        settle(&h.manager).await;

        let call = h.store.active_call().unwrap();
        assert_eq!(call.call_status, CallStatus::Ended);
        assert_eq!(call.end_reason, Some(EndReason::ConnectionLost));
        assert_eq!(call.participants.len(), 2);
        assert_eq!(h.store.error().as_deref(), Some("Lost connection to bob"));

        // The ended session releases media like any other hangup
        let mesh = settle(&h.manager).await;
        assert!(!mesh.has_local_media);
        assert_eq!(h.devices.active_captures(), 0);
    }

    #[tokio::test]
    async fn test_losing_one_of_two_peers_keeps_call() {
        let network = LoopbackNetwork::new();
        let bob = remote_peer(&network, "bob").await;
        remote_peer(&network, "carol").await;
        let h = connected_call(&network, &["bob", "carol"]).await;

        bob.endpoint.destroy();
        bob.answer.drop_calls();
        let mesh = settle(&h.manager).await;

        assert_eq!(mesh.connections, vec![UserId::new("carol")]);
        assert_eq!(h.store.snapshot().status(), Some(CallStatus::Connected));
        assert_eq!(h.store.error().as_deref(), Some("Lost connection to bob"));
        assert!(h.registry.get_stream(&"bob".into()).is_none());
    }

    #[tokio::test]
    async fn test_session_end_releases_everything() {
        let network = LoopbackNetwork::new();
        remote_peer(&network, "bob").await;
        let h = harness("alice", &network, LoopbackDevices::new("alice"));

        h.store.dispatch(incoming("bob"));
        h.store.dispatch(SessionAction::CallAccepted);
        h.store.dispatch(joined("alice"));
        settle(&h.manager).await;
        assert_eq!(h.devices.active_captures(), 1);

        h.store.dispatch(SessionAction::CallEnded {
            chat_id: "chat-1".into(),
        });
        let mesh = settle(&h.manager).await;
        assert_eq!(mesh, MeshSnapshot { dials: 1, ..Default::default() });
        assert_eq!(h.devices.active_captures(), 0);
        assert!(!network.is_open(&"alice".into()));
        assert!(h.registry.get_streams().is_empty());
    }

    #[tokio::test]
    async fn test_media_failure_hangs_up() {
        let network = LoopbackNetwork::new();
        let devices = LoopbackDevices::new("alice");
        devices.fail_with(MediaError::PermissionDenied);
        let h = harness("alice", &network, devices);

        h.store.dispatch(incoming("bob"));
        h.store.dispatch(SessionAction::CallAccepted);
        settle(&h.manager).await;

        let state = h.store.snapshot();
        let call = state.active_call.unwrap();
        assert_eq!(call.call_status, CallStatus::Ended);
        assert_eq!(call.end_reason, Some(EndReason::MediaFailure));
        assert!(state.error.unwrap().contains("permission denied"));
        assert!(!network.is_open(&"alice".into()));
    }

    /// A hangup that lands while the microphone prompt is open must win.
    #[tokio::test(start_paused = true)]
    async fn test_hangup_during_acquisition_releases_late_media() {
        let network = LoopbackNetwork::new();
        remote_peer(&network, "bob").await;
        let devices = LoopbackDevices::with_delay("alice", Duration::from_secs(2));
        let h = harness("alice", &network, devices);

        h.store.dispatch(incoming("bob"));
        h.store.dispatch(SessionAction::CallAccepted);
        h.store.dispatch(joined("alice"));
        tokio::time::sleep(Duration::from_millis(500)).await;

        h.store.dispatch(SessionAction::CallHangup {
            chat_id: "chat-1".into(),
            user_id: "alice".into(),
            reason: EndReason::LocalHangup,
        });
        tokio::time::sleep(Duration::from_secs(3)).await;
        let mesh = settle(&h.manager).await;

        assert!(!mesh.has_local_media);
        assert_eq!(mesh.dials, 0);
        assert_eq!(h.devices.acquired(), 1);
        assert_eq!(h.devices.active_captures(), 0);
        let call = h.store.active_call().unwrap();
        assert_eq!(call.call_status, CallStatus::Ended);
        assert!(!call.local_stream_ready);
    }

    #[tokio::test]
    async fn test_endpoint_error_surfaces_without_ending_call() {
        let network = LoopbackNetwork::new();
        remote_peer(&network, "bob").await;
        let h = harness("alice", &network, LoopbackDevices::new("alice"));

        h.store.dispatch(incoming("bob"));
        h.store.dispatch(SessionAction::CallAccepted);
        h.store.dispatch(joined("alice"));
        settle(&h.manager).await;

        network.inject_error(&"alice".into(), MediaError::Connection("ice failed".into()));
        settle(&h.manager).await;
        let state = h.store.snapshot();
        assert_eq!(state.status(), Some(CallStatus::Connected));
        assert!(state.error.unwrap().contains("ice failed"));
    }

    #[tokio::test]
    async fn test_shutdown_releases_media() {
        let network = LoopbackNetwork::new();
        let h = harness("alice", &network, LoopbackDevices::new("alice"));
        h.store.dispatch(incoming("bob"));
        h.store.dispatch(SessionAction::CallAccepted);
        settle(&h.manager).await;
        assert_eq!(h.devices.active_captures(), 1);

        h.manager.shutdown().await;
        assert_eq!(h.devices.active_captures(), 0);
        assert!(h.manager.inspect().await.is_err());
        assert_eq!(h.store.listener_count(), 0);
    }
}
