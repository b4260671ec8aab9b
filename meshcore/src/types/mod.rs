pub mod call;

pub use call::{
    CallId, CallParticipant, CallStatus, ChatId, EndReason, Participant, PeerId, StreamKind,
    UserId,
};
