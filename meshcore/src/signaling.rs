//! Signaling event vocabulary exchanged with the call relay.
//!
//! Events travel as `{"event": "<name>", "payload": {...}}` with camelCase
//! payload fields. The relay is a dumb fan-out; it only enforces one call per
//! chat and a small participant cap, reported back as [`IncomingSignal::CallExists`]
//! and [`IncomingSignal::CallError`].

use serde::{Deserialize, Serialize};

use crate::types::{CallId, CallParticipant, ChatId, Participant, PeerId, UserId};

/// Intents sent from this process to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum OutgoingSignal {
    CallInitiate {
        chat_id: ChatId,
        call_id: CallId,
        caller: Participant,
        peer_id: PeerId,
    },
    CallJoin {
        chat_id: ChatId,
        user: Participant,
        peer_id: PeerId,
    },
    CallHangup { chat_id: ChatId, user_id: UserId },
}

/// Call lifecycle events delivered by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum IncomingSignal {
    CallIncoming {
        chat_id: ChatId,
        call_id: CallId,
        caller: Participant,
        peer_id: PeerId,
    },
    CallUserJoined {
        chat_id: ChatId,
        user: Participant,
        peer_id: PeerId,
        /// Room membership as the relay saw it after the join.
        #[serde(default)]
        current_participants: Vec<CallParticipant>,
    },
    CallUserLeft { chat_id: ChatId, user_id: UserId },
    CallEnded {
        chat_id: ChatId,
        #[serde(default)]
        last_user_id: Option<UserId>,
    },
    /// A call is already running in the chat we tried to call.
    CallExists {},
    /// The relay refused the call, e.g. the participant cap was reached.
    CallError { chat_id: ChatId, reason: String },
}

impl OutgoingSignal {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CallInitiate { .. } => "callInitiate",
            Self::CallJoin { .. } => "callJoin",
            Self::CallHangup { .. } => "callHangup",
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        match self {
            Self::CallInitiate { chat_id, .. }
            | Self::CallJoin { chat_id, .. }
            | Self::CallHangup { chat_id, .. } => chat_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl IncomingSignal {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CallIncoming { .. } => "callIncoming",
            Self::CallUserJoined { .. } => "callUserJoined",
            Self::CallUserLeft { .. } => "callUserLeft",
            Self::CallEnded { .. } => "callEnded",
            Self::CallExists {} => "callExists",
            Self::CallError { .. } => "callError",
        }
    }

    /// The chat an event refers to; `callExists` carries none.
    pub fn chat_id(&self) -> Option<&ChatId> {
        match self {
            Self::CallIncoming { chat_id, .. }
            | Self::CallUserJoined { chat_id, .. }
            | Self::CallUserLeft { chat_id, .. }
            | Self::CallEnded { chat_id, .. }
            | Self::CallError { chat_id, .. } => Some(chat_id),
            Self::CallExists {} => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
