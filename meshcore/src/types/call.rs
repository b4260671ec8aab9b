use serde::{Deserialize, Serialize};
use std::fmt;

// Macro to generate the string-backed identifier newtypes
macro_rules! define_string_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(String);

            impl $name {
                pub fn new(id: impl Into<String>) -> Self {
                    Self(id.into())
                }

                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl From<&str> for $name {
                fn from(id: &str) -> Self {
                    Self(id.to_string())
                }
            }

            impl From<String> for $name {
                fn from(id: String) -> Self {
                    Self(id)
                }
            }
        )*
    };
}

define_string_id! {
    /// Identifier of the conversation a call belongs to.
    ChatId,
    /// Identifier of a call record, assigned when the call is initiated.
    CallId,
    /// Identifier of a user account.
    UserId,
    /// Address the media layer uses to dial a participant.
    PeerId,
}

impl CallId {
    /// Generate a random call id (32 uppercase hex chars).
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode_upper(bytes))
    }
}

impl From<&UserId> for PeerId {
    /// Peer endpoints are addressed by the owning user's id.
    fn from(user: &UserId) -> Self {
        Self(user.0.clone())
    }
}

/// A user taking part in a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(rename = "_id")]
    pub id: UserId,
    #[serde(default)]
    pub name: String,
}

impl Participant {
    pub fn new(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A participant together with the peer address used to dial them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallParticipant {
    pub user: Participant,
    pub peer_id: PeerId,
}

impl CallParticipant {
    pub fn new(user: Participant, peer_id: PeerId) -> Self {
        Self { user, peer_id }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user.id
    }
}

/// Lifecycle status of an active call.
///
/// `idle` has no variant: it is the absence of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Call created, waiting for the callee (or for the local user to answer).
    Ringing,
    /// Local user has accepted, media is being set up.
    Connecting,
    /// Media is flowing with at least one peer.
    Connected,
    /// Local side has left the call; awaiting cleanup.
    Ended,
}

impl CallStatus {
    /// Whether `self -> next` is an edge of the call state machine.
    ///
    /// Staying in the same state is not an edge; callers treat it as a no-op.
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        use CallStatus::*;
        matches!(
            (self, next),
            (Ringing, Connecting)
                | (Ringing, Connected)
                | (Connecting, Connected)
                | (Ringing, Ended)
                | (Connecting, Ended)
                | (Connected, Ended)
        )
    }

    /// Statuses during which the initiator's ringing timer runs.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Ringing | Self::Connecting)
    }

    pub fn is_ended(self) -> bool {
        matches!(self, Self::Ended)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ended => "ended",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side's media a readiness flag refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Local,
    Remote,
}

/// Why a session entered [`CallStatus::Ended`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    /// The local user hung up.
    LocalHangup,
    /// Another participant ended the call for us.
    RemoteHangup,
    /// The initiator's ringing window elapsed without an answer.
    RingTimeout,
    /// Local media could not be acquired.
    MediaFailure,
    /// Every peer connection dropped and none could be re-established.
    ConnectionLost,
    /// Every other participant left.
    ParticipantsLeft,
    /// The relay refused the call.
    Rejected,
}

impl EndReason {
    /// Reasons that originate on this process and must be announced to the relay.
    pub fn is_local(self) -> bool {
        matches!(
            self,
            Self::LocalHangup | Self::RingTimeout | Self::MediaFailure | Self::ConnectionLost
        )
    }
}
