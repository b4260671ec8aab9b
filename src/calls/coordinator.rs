//! Call coordinator: the one place that wires signaling, the session store and
//! the peer connection manager together.
//!
//! Construct one per process. It owns the store, the stream registry and the
//! manager, routes relay signals into store actions, and turns locally-caused
//! hangups into `callHangup` signals followed by session teardown.

use log::{debug, info, warn};
use meshcore::signaling::{IncomingSignal, OutgoingSignal};
use meshcore::types::{CallId, CallStatus, ChatId, EndReason, Participant, PeerId, UserId};
use meshcore::{CallSession, SessionAction, SessionError};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::error::CallError;
use super::listeners::SubscriptionId;
use super::media::{MediaDevices, PeerNetwork};
use super::peer::PeerConnectionManager;
use super::registry::StreamRegistry;
use super::signaling::{SignalHandler, SignalingChannel};
use super::store::{DEFAULT_RING_TIMEOUT, SessionListener, SessionStore, SessionUpdate};

/// Error shown when the relay reports a call already running in the chat.
pub const CALL_ALREADY_ACTIVE: &str = "A call is already active in this chat";

/// Configuration for a [`CallCoordinator`].
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// The user this process acts for.
    pub local_user: Participant,
    /// How long an outgoing call may ring before it is hung up.
    pub ring_timeout: Duration,
}

impl CallConfig {
    pub fn new(local_user: Participant) -> Self {
        Self {
            local_user,
            ring_timeout: DEFAULT_RING_TIMEOUT,
        }
    }

    pub fn with_ring_timeout(mut self, ring_timeout: Duration) -> Self {
        self.ring_timeout = ring_timeout;
        self
    }

    /// Peer id our endpoint registers under.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from(&self.local_user.id)
    }
}

/// Announces locally-caused hangups to the relay, then drops the session.
struct HangupAnnouncer {
    local_user: UserId,
    signaling: Arc<dyn SignalingChannel>,
    store: Weak<SessionStore>,
}

impl SessionListener for HangupAnnouncer {
    fn on_session_update(&self, update: &SessionUpdate) {
        let SessionAction::CallHangup {
            chat_id, reason, ..
        } = &update.action
        else {
            return;
        };
        let was_live = update.previous.as_ref().is_some_and(CallSession::is_live);
        let ended = update
            .call()
            .is_some_and(|call| call.call_status == CallStatus::Ended);
        if update.result.is_err() || !reason.is_local() || !was_live || !ended {
            return;
        }

        info!("Leaving call in {} ({:?})", chat_id, reason);
        self.signaling.emit(OutgoingSignal::CallHangup {
            chat_id: chat_id.clone(),
            user_id: self.local_user.clone(),
        });
        if let Some(store) = self.store.upgrade() {
            store.dispatch(SessionAction::CallEnded {
                chat_id: chat_id.clone(),
            });
        }
    }
}

/// Turns relay signals into session actions.
struct SignalRouter {
    local_user: UserId,
    store: Weak<SessionStore>,
}

impl SignalRouter {
    /// The active session, if it belongs to `chat_id`.
    fn active_in(store: &SessionStore, chat_id: &ChatId) -> Option<CallSession> {
        store.active_call().filter(|call| &call.chat_id == chat_id)
    }

    fn roll_back(&self, store: &SessionStore, call: &CallSession) {
        info!("Relay refused call {}, rolling back", call.call_id);
        store.dispatch(SessionAction::CallHangup {
            chat_id: call.chat_id.clone(),
            user_id: self.local_user.clone(),
            reason: EndReason::Rejected,
        });
        store.dispatch(SessionAction::CallEnded {
            chat_id: call.chat_id.clone(),
        });
    }
}

impl SignalHandler for SignalRouter {
    fn on_signal(&self, signal: &IncomingSignal) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        debug!("Signal {} for {}", signal.event_name(), self.local_user);

        match signal {
            IncomingSignal::CallIncoming {
                chat_id,
                call_id,
                caller,
                peer_id,
            } => {
                if caller.id == self.local_user {
                    return;
                }
                if let Some(active) = store.active_call() {
                    info!(
                        "Busy in {}, ignoring call {} from {}",
                        active.chat_id, call_id, caller.id
                    );
                    return;
                }
                info!("Incoming call {} from {} in {}", call_id, caller.id, chat_id);
                store.dispatch(SessionAction::IncomingCall {
                    chat_id: chat_id.clone(),
                    call_id: call_id.clone(),
                    caller: caller.clone(),
                    peer_id: peer_id.clone(),
                });
            }
            IncomingSignal::CallUserJoined {
                chat_id,
                user,
                peer_id,
                current_participants,
            } => {
                if Self::active_in(&store, chat_id).is_none() {
                    debug!("Ignoring join of {} for inactive chat {}", user.id, chat_id);
                    return;
                }
                // Late joiners learn the whole room from the relay
                for participant in current_participants {
                    store.dispatch(SessionAction::UserJoined {
                        chat_id: chat_id.clone(),
                        user: participant.user.clone(),
                        peer_id: participant.peer_id.clone(),
                    });
                }
                store.dispatch(SessionAction::UserJoined {
                    chat_id: chat_id.clone(),
                    user: user.clone(),
                    peer_id: peer_id.clone(),
                });
            }
            IncomingSignal::CallUserLeft { chat_id, user_id } => {
                if user_id == &self.local_user || Self::active_in(&store, chat_id).is_none() {
                    return;
                }
                store.dispatch(SessionAction::UserLeft {
                    chat_id: chat_id.clone(),
                    user_id: user_id.clone(),
                });
            }
            IncomingSignal::CallEnded {
                chat_id,
                last_user_id,
            } => {
                let Some(call) = Self::active_in(&store, chat_id) else {
                    return;
                };
                if call.is_live() {
                    store.dispatch(SessionAction::CallHangup {
                        chat_id: chat_id.clone(),
                        user_id: last_user_id.clone().unwrap_or(call.caller_id),
                        reason: EndReason::RemoteHangup,
                    });
                }
                store.dispatch(SessionAction::CallEnded {
                    chat_id: chat_id.clone(),
                });
            }
            IncomingSignal::CallExists {} => {
                warn!("Relay reports a call already running");
                store.dispatch(SessionAction::SetError(CALL_ALREADY_ACTIVE.to_string()));
                // Only an initiated call nobody has joined can be the one refused
                let pending = store.active_call().filter(|call| {
                    call.is_initiator
                        && call.call_status == CallStatus::Ringing
                        && call.participants.len() == 1
                        && call.has_participant(&self.local_user)
                });
                if let Some(call) = pending {
                    self.roll_back(&store, &call);
                }
            }
            IncomingSignal::CallError { chat_id, reason } => {
                warn!("Relay error in {}: {}", chat_id, reason);
                store.dispatch(SessionAction::SetError(reason.clone()));
                if let Some(call) = Self::active_in(&store, chat_id)
                    .filter(|call| call.call_status != CallStatus::Connected)
                {
                    self.roll_back(&store, &call);
                }
            }
        }
    }
}

pub struct CallCoordinator {
    config: CallConfig,
    store: Arc<SessionStore>,
    streams: Arc<StreamRegistry>,
    manager: Arc<PeerConnectionManager>,
    signaling: Arc<dyn SignalingChannel>,
    hangup_subscription: SubscriptionId,
    signal_subscription: SubscriptionId,
}

impl CallCoordinator {
    /// Build the call stack for `config.local_user`. Must be called from
    /// within a tokio runtime.
    pub fn new(
        config: CallConfig,
        signaling: Arc<dyn SignalingChannel>,
        devices: Arc<dyn MediaDevices>,
        network: Arc<dyn PeerNetwork>,
    ) -> Arc<Self> {
        let store = SessionStore::new(config.ring_timeout);
        let streams = StreamRegistry::new();

        // Registered first so a local hangup is announced before the mesh
        // reacts to the ended session
        let hangup_subscription = store.subscribe(Arc::new(HangupAnnouncer {
            local_user: config.local_user.id.clone(),
            signaling: signaling.clone(),
            store: Arc::downgrade(&store),
        }));
        let manager = PeerConnectionManager::spawn(
            config.local_user.clone(),
            store.clone(),
            streams.clone(),
            devices,
            network,
        );
        let signal_subscription = signaling.subscribe(Arc::new(SignalRouter {
            local_user: config.local_user.id.clone(),
            store: Arc::downgrade(&store),
        }));

        info!(
            "Call coordinator ready for {} (ring timeout {:?})",
            config.local_user.id, config.ring_timeout
        );
        Arc::new(Self {
            config,
            store,
            streams,
            manager,
            signaling,
            hangup_subscription,
            signal_subscription,
        })
    }

    pub fn local_user(&self) -> &Participant {
        &self.config.local_user
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    pub fn manager(&self) -> &Arc<PeerConnectionManager> {
        &self.manager
    }

    pub fn session(&self) -> Option<CallSession> {
        self.store.active_call()
    }

    pub fn error(&self) -> Option<String> {
        self.store.error()
    }

    /// Start a call in `chat_id` and ring the other chat members.
    pub fn start_call(&self, chat_id: impl Into<ChatId>) -> Result<CallId, CallError> {
        let chat_id = chat_id.into();
        if self.store.in_dispatch() {
            return Err(CallError::Reentrant);
        }
        if let Some(active) = self.store.active_call() {
            return Err(CallError::AlreadyExists(active.chat_id.to_string()));
        }

        let call_id = CallId::generate();
        let caller = self.config.local_user.clone();
        let peer_id = self.config.peer_id();
        self.apply(SessionAction::CallInitiate {
            chat_id: chat_id.clone(),
            call_id: call_id.clone(),
            caller: caller.clone(),
            peer_id: peer_id.clone(),
        })?;

        info!("Starting call {} in {}", call_id, chat_id);
        self.signaling.emit(OutgoingSignal::CallInitiate {
            chat_id,
            call_id: call_id.clone(),
            caller,
            peer_id,
        });
        self.check_not_refused(&call_id)?;
        Ok(call_id)
    }

    /// Answer the ringing incoming call.
    pub fn accept_call(&self) -> Result<(), CallError> {
        if self.store.in_dispatch() {
            return Err(CallError::Reentrant);
        }
        let call = self.store.active_call().ok_or(CallError::NoActiveCall)?;
        if call.is_initiator || call.call_status != CallStatus::Ringing {
            return Err(SessionError::InvalidTransition {
                from: call.call_status,
                to: CallStatus::Connecting,
            }
            .into());
        }

        info!("Accepting call {} in {}", call.call_id, call.chat_id);
        let user = self.config.local_user.clone();
        let peer_id = self.config.peer_id();
        self.apply(SessionAction::CallAccepted)?;
        self.apply(SessionAction::UserJoined {
            chat_id: call.chat_id.clone(),
            user: user.clone(),
            peer_id: peer_id.clone(),
        })?;
        self.signaling.emit(OutgoingSignal::CallJoin {
            chat_id: call.chat_id,
            user,
            peer_id,
        });
        self.check_not_refused(&call.call_id)
    }

    /// Leave the active call. Works for ringing, connecting and connected
    /// calls; declining an incoming call is a hangup before accepting.
    pub fn hang_up(&self) -> Result<(), CallError> {
        let call = self
            .store
            .active_call()
            .filter(CallSession::is_live)
            .ok_or(CallError::NoActiveCall)?;
        info!("Hanging up call {}", call.call_id);
        self.store.dispatch(SessionAction::CallHangup {
            chat_id: call.chat_id,
            user_id: self.config.local_user.id.clone(),
            reason: EndReason::LocalHangup,
        });
        Ok(())
    }

    /// Leave any live call, detach from signaling and stop the mesh.
    pub async fn shutdown(&self) {
        if self.session().is_some_and(|c| c.is_live())
            && let Err(e) = self.hang_up()
        {
            warn!("Hangup during shutdown failed: {}", e);
        }
        self.signaling.unsubscribe(self.signal_subscription);
        self.store.unsubscribe(self.hangup_subscription);
        self.manager.shutdown().await;
        info!("Call coordinator for {} stopped", self.config.local_user.id);
    }

    /// Dispatch on behalf of a caller that needs the verdict.
    fn apply(&self, action: SessionAction) -> Result<(), CallError> {
        match self.store.dispatch(action) {
            Some(Ok(())) => Ok(()),
            Some(Err(SessionError::AlreadyActive(chat))) => {
                Err(CallError::AlreadyExists(chat.to_string()))
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(CallError::Reentrant),
        }
    }

    fn is_current(&self, call_id: &CallId) -> bool {
        self.store
            .active_call()
            .is_some_and(|c| &c.call_id == call_id)
    }

    /// The relay may refuse synchronously; the router has rolled back by then.
    fn check_not_refused(&self, call_id: &CallId) -> Result<(), CallError> {
        if self.is_current(call_id) {
            return Ok(());
        }
        let reason = self
            .store
            .error()
            .unwrap_or_else(|| "call was refused".to_string());
        Err(CallError::Rejected(reason))
    }
}

impl Drop for CallCoordinator {
    fn drop(&mut self) {
        self.signaling.unsubscribe(self.signal_subscription);
        self.store.unsubscribe(self.hangup_subscription);
    }
}
