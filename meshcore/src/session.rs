//! Call session state machine.
//!
//! [`SessionState`] holds at most one [`CallSession`] and is advanced by
//! applying [`SessionAction`]s, reducer style. Every action is a pure
//! function of the current state; the runtime host in `meshcall` takes care of
//! serializing dispatch and notifying observers.

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use thiserror::Error;

use crate::types::{
    CallId, CallParticipant, CallStatus, ChatId, EndReason, Participant, PeerId, StreamKind,
    UserId,
};

/// Error string recorded when an action arrives without a live session.
pub const NO_ACTIVE_CALL: &str = "No active call session to perform this action.";

/// The single active call known to this process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub chat_id: ChatId,
    pub call_id: CallId,
    pub caller_id: UserId,
    /// Unique by user id, in join order.
    pub participants: Vec<CallParticipant>,
    pub is_initiator: bool,
    pub call_status: CallStatus,
    pub local_stream_ready: bool,
    pub remote_stream_ready: bool,
    /// Set when the session enters [`CallStatus::Ended`].
    pub end_reason: Option<EndReason>,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    fn new(
        chat_id: ChatId,
        call_id: CallId,
        caller: Participant,
        peer_id: PeerId,
        is_initiator: bool,
    ) -> Self {
        Self {
            chat_id,
            call_id,
            caller_id: caller.id.clone(),
            participants: vec![CallParticipant::new(caller, peer_id)],
            is_initiator,
            call_status: CallStatus::Ringing,
            local_stream_ready: false,
            remote_stream_ready: false,
            end_reason: None,
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    pub fn has_participant(&self, user_id: &UserId) -> bool {
        self.participants.iter().any(|p| p.user_id() == user_id)
    }

    pub fn participant(&self, user_id: &UserId) -> Option<&CallParticipant> {
        self.participants.iter().find(|p| p.user_id() == user_id)
    }

    pub fn participant_by_peer(&self, peer_id: &PeerId) -> Option<&CallParticipant> {
        self.participants.iter().find(|p| &p.peer_id == peer_id)
    }

    /// Whether the session still needs media (not yet ended).
    pub fn is_live(&self) -> bool {
        !self.call_status.is_ended()
    }

    fn add_participant(&mut self, participant: CallParticipant) -> bool {
        if self.has_participant(participant.user_id()) {
            return false;
        }
        self.participants.push(participant);
        true
    }

    fn remove_participant(&mut self, user_id: &UserId) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p.user_id() != user_id);
        self.participants.len() != before
    }

    /// Move to `next`. Returns `Ok(false)` when already there.
    fn transition(&mut self, next: CallStatus) -> Result<bool, SessionError> {
        if self.call_status == next {
            return Ok(false);
        }
        if !self.call_status.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.call_status,
                to: next,
            });
        }
        debug!(
            "Call {} in chat {}: {} -> {}",
            self.call_id, self.chat_id, self.call_status, next
        );
        self.call_status = next;
        if next == CallStatus::Connected {
            self.connected_at = Some(Utc::now());
        }
        Ok(true)
    }

    fn end(&mut self, reason: EndReason) -> Result<bool, SessionError> {
        let changed = self.transition(CallStatus::Ended)?;
        if changed {
            self.end_reason = Some(reason);
        }
        Ok(changed)
    }

    fn check_chat(&self, chat_id: &ChatId) -> Result<(), SessionError> {
        if &self.chat_id != chat_id {
            return Err(SessionError::ChatMismatch {
                active: self.chat_id.clone(),
                requested: chat_id.clone(),
            });
        }
        Ok(())
    }

    /// Force `Connected` once local media is up and a peer is present.
    ///
    /// A single participant is only the local user, so there is nobody to be
    /// connected to yet.
    fn derive_connected(&mut self) {
        if self.local_stream_ready
            && self.participants.len() > 1
            && self.call_status.can_transition_to(CallStatus::Connected)
        {
            let _ = self.transition(CallStatus::Connected);
        }
    }
}

/// Discrete events accepted by the session reducer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// The local user starts a call.
    CallInitiate {
        chat_id: ChatId,
        call_id: CallId,
        caller: Participant,
        peer_id: PeerId,
    },
    /// Someone else started a call in one of our chats.
    IncomingCall {
        chat_id: ChatId,
        call_id: CallId,
        caller: Participant,
        peer_id: PeerId,
    },
    /// The local user agreed to join.
    CallAccepted,
    UserJoined {
        chat_id: ChatId,
        user: Participant,
        peer_id: PeerId,
    },
    SetStreamReady { kind: StreamKind, ready: bool },
    /// A remote stream arrived through the peer layer.
    CallConnected,
    UserLeft { chat_id: ChatId, user_id: UserId },
    /// Flags the local side as ended. The session stays until `CallEnded`.
    CallHangup {
        chat_id: ChatId,
        user_id: UserId,
        reason: EndReason,
    },
    /// Destroys the session.
    CallEnded { chat_id: ChatId },
    SetError(String),
    ClearError,
}

impl SessionAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CallInitiate { .. } => "callInitiate",
            Self::IncomingCall { .. } => "incomingCall",
            Self::CallAccepted => "callAccepted",
            Self::UserJoined { .. } => "userJoined",
            Self::SetStreamReady { .. } => "setStreamReady",
            Self::CallConnected => "callConnected",
            Self::UserLeft { .. } => "userLeft",
            Self::CallHangup { .. } => "callHangup",
            Self::CallEnded { .. } => "callEnded",
            Self::SetError(_) => "setError",
            Self::ClearError => "clearError",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("No active call session to perform this action.")]
    NoActiveCall,

    #[error("a call is already active in chat {0}")]
    AlreadyActive(ChatId),

    #[error("action targets chat {requested} but the active call is in chat {active}")]
    ChatMismatch { active: ChatId, requested: ChatId },

    #[error("invalid call status transition {from} -> {to}")]
    InvalidTransition { from: CallStatus, to: CallStatus },
}

/// Everything the session store owns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub active_call: Option<CallSession>,
    /// Last locally-recoverable failure, for display.
    pub error: Option<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<CallStatus> {
        self.active_call.as_ref().map(|c| c.call_status)
    }

    /// Apply one action.
    ///
    /// Rejected actions leave the session untouched. The only rejection that
    /// is recorded in [`SessionState::error`] is a mutation without a session.
    pub fn apply(&mut self, action: &SessionAction) -> Result<(), SessionError> {
        match action {
            SessionAction::CallInitiate {
                chat_id,
                call_id,
                caller,
                peer_id,
            } => self.create(chat_id, call_id, caller, peer_id, true),
            SessionAction::IncomingCall {
                chat_id,
                call_id,
                caller,
                peer_id,
            } => self.create(chat_id, call_id, caller, peer_id, false),
            SessionAction::SetError(message) => {
                self.error = Some(message.clone());
                Ok(())
            }
            SessionAction::ClearError => {
                self.error = None;
                Ok(())
            }
            _ => {
                let Some(call) = self.active_call.as_mut() else {
                    self.error = Some(NO_ACTIVE_CALL.to_string());
                    return Err(SessionError::NoActiveCall);
                };
                if Self::apply_to_call(call, action)? {
                    self.active_call = None;
                }
                Ok(())
            }
        }
    }

    /// Apply a session-scoped action. Returns `true` when the session must be destroyed.
    fn apply_to_call(call: &mut CallSession, action: &SessionAction) -> Result<bool, SessionError> {
        match action {
            SessionAction::CallAccepted => {
                call.transition(CallStatus::Connecting)?;
            }
            SessionAction::UserJoined {
                chat_id,
                user,
                peer_id,
            } => {
                call.check_chat(chat_id)?;
                if !call.add_participant(CallParticipant::new(user.clone(), peer_id.clone())) {
                    debug!("User {} already in call {}", user.id, call.call_id);
                }
            }
            SessionAction::SetStreamReady { kind, ready } => {
                match kind {
                    StreamKind::Local => call.local_stream_ready = *ready,
                    StreamKind::Remote => call.remote_stream_ready = *ready,
                }
                call.derive_connected();
            }
            SessionAction::CallConnected => {
                call.transition(CallStatus::Connected)?;
            }
            SessionAction::UserLeft { chat_id, user_id } => {
                call.check_chat(chat_id)?;
                let removed = call.remove_participant(user_id);
                if removed && call.participants.len() <= 1 && call.is_live() {
                    call.end(EndReason::ParticipantsLeft)?;
                }
            }
            SessionAction::CallHangup {
                chat_id,
                user_id,
                reason,
            } => {
                call.check_chat(chat_id)?;
                if call.end(*reason)? {
                    debug!("Call {} hung up by {} ({:?})", call.call_id, user_id, reason);
                }
            }
            SessionAction::CallEnded { chat_id } => {
                call.check_chat(chat_id)?;
                return Ok(true);
            }
            // Handled by `apply` before a session is required
            SessionAction::CallInitiate { .. }
            | SessionAction::IncomingCall { .. }
            | SessionAction::SetError(_)
            | SessionAction::ClearError => {}
        }
        Ok(false)
    }

    fn create(
        &mut self,
        chat_id: &ChatId,
        call_id: &CallId,
        caller: &Participant,
        peer_id: &PeerId,
        is_initiator: bool,
    ) -> Result<(), SessionError> {
        if let Some(existing) = &self.active_call {
            return Err(SessionError::AlreadyActive(existing.chat_id.clone()));
        }
        self.active_call = Some(CallSession::new(
            chat_id.clone(),
            call_id.clone(),
            caller.clone(),
            peer_id.clone(),
            is_initiator,
        ));
        self.error = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Participant {
        Participant::new("alice", "Alice")
    }

    fn bob() -> Participant {
        Participant::new("bob", "Bob")
    }

    fn initiate(chat: &str) -> SessionAction {
        SessionAction::CallInitiate {
            chat_id: chat.into(),
            call_id: "call-1".into(),
            caller: alice(),
            peer_id: "alice".into(),
        }
    }

    fn joined(user: Participant) -> SessionAction {
        let peer_id = PeerId::from(&user.id);
        SessionAction::UserJoined {
            chat_id: "chat-1".into(),
            user,
            peer_id,
        }
    }

    fn session(state: &SessionState) -> &CallSession {
        state.active_call.as_ref().unwrap()
    }

    #[test]
    fn test_initiate_creates_ringing_session() {
        let mut state = SessionState::new();
        state.apply(&initiate("chat-1")).unwrap();

        let call = session(&state);
        assert_eq!(call.chat_id.as_str(), "chat-1");
        assert_eq!(call.call_status, CallStatus::Ringing);
        assert!(call.is_initiator);
        assert_eq!(call.participants.len(), 1);
        assert_eq!(call.caller_id.as_str(), "alice");
    }

    #[test]
    fn test_incoming_call_is_not_initiator() {
        let mut state = SessionState::new();
        state
            .apply(&SessionAction::IncomingCall {
                chat_id: "chat-1".into(),
                call_id: "call-1".into(),
                caller: alice(),
                peer_id: "alice".into(),
            })
            .unwrap();
        assert!(!session(&state).is_initiator);
        assert_eq!(session(&state).call_status, CallStatus::Ringing);
    }

    /// Only the first session-creating action wins; later ones don't touch it.
    #[test]
    fn test_single_active_session() {
        let mut state = SessionState::new();
        state.apply(&initiate("chat-1")).unwrap();
        state.apply(&SessionAction::CallAccepted).unwrap();
        let before = session(&state).clone();

        let second = SessionAction::IncomingCall {
            chat_id: "chat-2".into(),
            call_id: "call-2".into(),
            caller: bob(),
            peer_id: "bob".into(),
        };
        assert_eq!(
            state.apply(&second),
            Err(SessionError::AlreadyActive("chat-1".into()))
        );
        assert_eq!(
            state.apply(&initiate("chat-3")),
            Err(SessionError::AlreadyActive("chat-1".into()))
        );
        assert_eq!(session(&state), &before);
        assert!(state.error.is_none());
    }

    #[test]
    fn test_user_joined_is_idempotent() {
        let mut state = SessionState::new();
        state.apply(&initiate("chat-1")).unwrap();
        state.apply(&joined(bob())).unwrap();
        state.apply(&joined(bob())).unwrap();

        let ids: Vec<_> = session(&state)
            .participants
            .iter()
            .map(|p| p.user_id().as_str())
            .collect();
        assert_eq!(ids, ["alice", "bob"]);
        assert_eq!(session(&state).call_status, CallStatus::Ringing);
    }

    #[test]
    fn test_user_joined_for_other_chat_is_ignored() {
        let mut state = SessionState::new();
        state.apply(&initiate("chat-1")).unwrap();
        let result = state.apply(&SessionAction::UserJoined {
            chat_id: "chat-9".into(),
            user: bob(),
            peer_id: "bob".into(),
        });
        assert!(matches!(result, Err(SessionError::ChatMismatch { .. })));
        assert_eq!(session(&state).participants.len(), 1);
    }

    #[test]
    fn test_user_left_for_absent_user_is_noop() {
        let mut state = SessionState::new();
        state.apply(&initiate("chat-1")).unwrap();
        state.apply(&joined(bob())).unwrap();
        let before = session(&state).clone();

        state
            .apply(&SessionAction::UserLeft {
                chat_id: "chat-1".into(),
                user_id: "carol".into(),
            })
            .unwrap();
        assert_eq!(session(&state), &before);
        assert!(state.error.is_none());
    }

    /// A leave that overtakes its join is a no-op; the late join then lands once.
    #[test]
    fn test_leave_overtaking_join() {
        let mut state = SessionState::new();
        state.apply(&initiate("chat-1")).unwrap();
        state.apply(&joined(bob())).unwrap();

        state
            .apply(&SessionAction::UserLeft {
                chat_id: "chat-1".into(),
                user_id: "carol".into(),
            })
            .unwrap();
        // Removing an unknown user must not count as the room emptying
        assert_eq!(session(&state).participants.len(), 2);
        assert_eq!(session(&state).call_status, CallStatus::Ringing);

        let carol = Participant::new("carol", "Carol");
        state.apply(&joined(carol.clone())).unwrap();
        state.apply(&joined(carol)).unwrap();
        let ids: Vec<&str> = session(&state)
            .participants
            .iter()
            .map(|p| p.user_id().as_str())
            .collect();
        assert_eq!(ids, ["alice", "bob", "carol"]);
        assert_eq!(session(&state).call_status, CallStatus::Ringing);
    }

    #[test]
    fn test_last_peer_leaving_ends_session() {
        let mut state = SessionState::new();
        state.apply(&initiate("chat-1")).unwrap();
        state.apply(&joined(bob())).unwrap();
        state.apply(&SessionAction::CallConnected).unwrap();

        state
            .apply(&SessionAction::UserLeft {
                chat_id: "chat-1".into(),
                user_id: "bob".into(),
            })
            .unwrap();
        let call = session(&state);
        assert_eq!(call.call_status, CallStatus::Ended);
        assert_eq!(call.end_reason, Some(EndReason::ParticipantsLeft));
    }

    /// Both paths into Connected converge on the same state.
    #[test]
    fn test_connected_via_stream_ready() {
        let mut state = SessionState::new();
        state.apply(&initiate("chat-1")).unwrap();
        state.apply(&joined(bob())).unwrap();
        state
            .apply(&SessionAction::SetStreamReady {
                kind: StreamKind::Local,
                ready: true,
            })
            .unwrap();
        assert_eq!(session(&state).call_status, CallStatus::Connected);
        assert!(session(&state).connected_at.is_some());
    }

    #[test]
    fn test_connected_via_explicit_action() {
        let mut state = SessionState::new();
        state.apply(&initiate("chat-1")).unwrap();
        state.apply(&joined(bob())).unwrap();
        state.apply(&SessionAction::CallAccepted).unwrap();
        state
            .apply(&SessionAction::SetStreamReady {
                kind: StreamKind::Local,
                ready: true,
            })
            .unwrap();
        // Already connected through the derived rule; the explicit edge is a no-op
        state.apply(&SessionAction::CallConnected).unwrap();
        assert_eq!(session(&state).call_status, CallStatus::Connected);

        let mut other = SessionState::new();
        other.apply(&initiate("chat-1")).unwrap();
        other.apply(&joined(bob())).unwrap();
        other.apply(&SessionAction::CallConnected).unwrap();
        other
            .apply(&SessionAction::SetStreamReady {
                kind: StreamKind::Local,
                ready: true,
            })
            .unwrap();
        assert_eq!(session(&other).call_status, CallStatus::Connected);
        assert!(session(&other).local_stream_ready);
    }

    #[test]
    fn test_local_stream_alone_does_not_connect() {
        let mut state = SessionState::new();
        state.apply(&initiate("chat-1")).unwrap();
        state
            .apply(&SessionAction::SetStreamReady {
                kind: StreamKind::Local,
                ready: true,
            })
            .unwrap();
        assert_eq!(session(&state).call_status, CallStatus::Ringing);
    }

    #[test]
    fn test_hangup_flags_ended_and_blocks_reconnect() {
        let mut state = SessionState::new();
        state.apply(&initiate("chat-1")).unwrap();
        state.apply(&joined(bob())).unwrap();
        state
            .apply(&SessionAction::CallHangup {
                chat_id: "chat-1".into(),
                user_id: "alice".into(),
                reason: EndReason::LocalHangup,
            })
            .unwrap();
        assert_eq!(session(&state).call_status, CallStatus::Ended);

        // A late remote stream must not resurrect the call
        assert!(matches!(
            state.apply(&SessionAction::CallConnected),
            Err(SessionError::InvalidTransition { .. })
        ));
        state
            .apply(&SessionAction::SetStreamReady {
                kind: StreamKind::Local,
                ready: true,
            })
            .unwrap();
        assert_eq!(session(&state).call_status, CallStatus::Ended);
        assert_eq!(session(&state).end_reason, Some(EndReason::LocalHangup));
    }

    #[test]
    fn test_call_ended_requires_matching_chat() {
        let mut state = SessionState::new();
        state.apply(&initiate("chat-1")).unwrap();

        assert!(
            state
                .apply(&SessionAction::CallEnded {
                    chat_id: "chat-2".into()
                })
                .is_err()
        );
        assert!(state.active_call.is_some());

        state
            .apply(&SessionAction::CallEnded {
                chat_id: "chat-1".into(),
            })
            .unwrap();
        assert!(state.active_call.is_none());
    }

    #[test]
    fn test_mutation_without_session_sets_error() {
        let mut state = SessionState::new();
        assert_eq!(
            state.apply(&SessionAction::CallAccepted),
            Err(SessionError::NoActiveCall)
        );
        assert_eq!(state.error.as_deref(), Some(NO_ACTIVE_CALL));
        assert!(state.active_call.is_none());

        // A fresh session clears the stale error
        state.apply(&initiate("chat-1")).unwrap();
        assert!(state.error.is_none());
    }

    #[test]
    fn test_accept_after_connected_is_rejected() {
        let mut state = SessionState::new();
        state.apply(&initiate("chat-1")).unwrap();
        state.apply(&SessionAction::CallConnected).unwrap();
        assert!(matches!(
            state.apply(&SessionAction::CallAccepted),
            Err(SessionError::InvalidTransition {
                from: CallStatus::Connected,
                to: CallStatus::Connecting,
            })
        ));
    }
}
