//! In-process signaling relay.
//!
//! A fan-out relay for tests and the demo binary. It knows which users belong
//! to which chat and keeps one call room per chat, enforcing the two rules a
//! real relay enforces: one call per chat and a participant cap.
//!
//! Deliveries go through a single FIFO outbox. A handler that emits while a
//! delivery is in progress has its consequences queued behind the signals
//! already in flight, so every user observes events in relay order.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info};
use meshcore::signaling::{IncomingSignal, OutgoingSignal};
use meshcore::types::{CallId, CallParticipant, ChatId, UserId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::listeners::{Listeners, SubscriptionId};
use super::signaling::{SignalHandler, SignalingChannel};

/// Participant cap used when none is given.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 4;

pub const CALL_FULL: &str = "Call is full";
pub const NO_CALL_IN_CHAT: &str = "No active call in this chat";
pub const UNKNOWN_CHAT: &str = "Unknown chat";

struct Room {
    call_id: CallId,
    /// In join order.
    members: Vec<CallParticipant>,
}

#[derive(Default)]
struct Mailbox {
    handlers: Listeners<dyn SignalHandler>,
    received: Mutex<Vec<IncomingSignal>>,
}

struct RelayInner {
    max_participants: usize,
    chats: DashMap<ChatId, Vec<UserId>>,
    rooms: DashMap<ChatId, Room>,
    mailboxes: DashMap<UserId, Arc<Mailbox>>,
    outbox: Mutex<VecDeque<(UserId, IncomingSignal)>>,
    delivering: AtomicBool,
}

/// Shared relay; cheap to clone.
#[derive(Clone)]
pub struct LocalRelay {
    inner: Arc<RelayInner>,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PARTICIPANTS)
    }
}

impl LocalRelay {
    pub fn new(max_participants: usize) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                max_participants,
                chats: DashMap::new(),
                rooms: DashMap::new(),
                mailboxes: DashMap::new(),
                outbox: Mutex::new(VecDeque::new()),
                delivering: AtomicBool::new(false),
            }),
        }
    }

    /// Register a chat and its members.
    pub fn add_chat(&self, chat_id: impl Into<ChatId>, members: &[UserId]) {
        self.inner.chats.insert(chat_id.into(), members.to_vec());
    }

    /// Open a channel for `user_id`. Reconnecting replaces the old mailbox.
    pub fn connect(&self, user_id: impl Into<UserId>) -> Arc<RelayChannel> {
        let user_id = user_id.into();
        let mailbox = Arc::new(Mailbox::default());
        self.inner
            .mailboxes
            .insert(user_id.clone(), mailbox.clone());
        debug!("Relay: {} connected", user_id);
        Arc::new(RelayChannel {
            user_id,
            mailbox,
            relay: self.inner.clone(),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Members of the call room in `chat_id`, in join order.
    pub fn room_members(&self, chat_id: &ChatId) -> Option<Vec<UserId>> {
        self.inner.rooms.get(chat_id).map(|room| {
            room.members
                .iter()
                .map(|m| m.user_id().clone())
                .collect()
        })
    }

    pub fn room_call_id(&self, chat_id: &ChatId) -> Option<CallId> {
        self.inner.rooms.get(chat_id).map(|room| room.call_id.clone())
    }

    pub fn active_rooms(&self) -> usize {
        self.inner.rooms.len()
    }
}

impl RelayInner {
    fn handle(&self, from: &UserId, signal: OutgoingSignal) {
        let deliveries = match signal {
            OutgoingSignal::CallInitiate {
                chat_id,
                call_id,
                caller,
                peer_id,
            } => self.initiate(from, chat_id, call_id, CallParticipant::new(caller, peer_id)),
            OutgoingSignal::CallJoin {
                chat_id,
                user,
                peer_id,
            } => self.join(from, chat_id, CallParticipant::new(user, peer_id)),
            OutgoingSignal::CallHangup { chat_id, user_id } => self.hang_up(chat_id, user_id),
        };
        self.post(deliveries);
    }

    fn initiate(
        &self,
        from: &UserId,
        chat_id: ChatId,
        call_id: CallId,
        caller: CallParticipant,
    ) -> Vec<(UserId, IncomingSignal)> {
        let Some(members) = self.chats.get(&chat_id).map(|m| m.value().clone()) else {
            return vec![(
                from.clone(),
                IncomingSignal::CallError {
                    chat_id,
                    reason: UNKNOWN_CHAT.to_string(),
                },
            )];
        };

        match self.rooms.entry(chat_id.clone()) {
            Entry::Occupied(_) => {
                debug!("Relay: call already running in {}", chat_id);
                return vec![(from.clone(), IncomingSignal::CallExists {})];
            }
            Entry::Vacant(slot) => {
                slot.insert(Room {
                    call_id: call_id.clone(),
                    members: vec![caller.clone()],
                });
            }
        }
        info!("Relay: {} started call {} in {}", from, call_id, chat_id);

        let incoming = IncomingSignal::CallIncoming {
            chat_id,
            call_id,
            caller: caller.user,
            peer_id: caller.peer_id,
        };
        members
            .into_iter()
            .filter(|member| member != from)
            .map(|member| (member, incoming.clone()))
            .collect()
    }

    fn join(
        &self,
        from: &UserId,
        chat_id: ChatId,
        joiner: CallParticipant,
    ) -> Vec<(UserId, IncomingSignal)> {
        let reject = |reason: &str| {
            vec![(
                from.clone(),
                IncomingSignal::CallError {
                    chat_id: chat_id.clone(),
                    reason: reason.to_string(),
                },
            )]
        };

        let members = {
            let Some(mut room) = self.rooms.get_mut(&chat_id) else {
                return reject(NO_CALL_IN_CHAT);
            };
            if room
                .members
                .iter()
                .any(|m| m.user_id() == joiner.user_id())
            {
                debug!("Relay: {} already in call in {}", joiner.user_id(), chat_id);
                return Vec::new();
            }
            if room.members.len() >= self.max_participants {
                info!("Relay: call in {} is full, refusing {}", chat_id, from);
                return reject(CALL_FULL);
            }
            room.members.push(joiner.clone());
            room.members.clone()
        };
        info!("Relay: {} joined call in {}", joiner.user_id(), chat_id);

        let joined = IncomingSignal::CallUserJoined {
            chat_id,
            user: joiner.user,
            peer_id: joiner.peer_id,
            current_participants: members.clone(),
        };
        members
            .into_iter()
            .map(|member| (member.user.id, joined.clone()))
            .collect()
    }

    fn hang_up(&self, chat_id: ChatId, user_id: UserId) -> Vec<(UserId, IncomingSignal)> {
        let remaining = {
            let Some(mut room) = self.rooms.get_mut(&chat_id) else {
                debug!("Relay: hangup for {} without a call", chat_id);
                return Vec::new();
            };
            let before = room.members.len();
            room.members.retain(|m| m.user_id() != &user_id);
            if room.members.len() == before {
                return Vec::new();
            }
            room.members
                .iter()
                .map(|m| m.user_id().clone())
                .collect::<Vec<_>>()
        };
        info!("Relay: {} left call in {}", user_id, chat_id);

        let mut deliveries: Vec<(UserId, IncomingSignal)> = remaining
            .iter()
            .map(|member| {
                (
                    member.clone(),
                    IncomingSignal::CallUserLeft {
                        chat_id: chat_id.clone(),
                        user_id: user_id.clone(),
                    },
                )
            })
            .collect();

        if remaining.len() <= 1 {
            self.rooms.remove(&chat_id);
            info!("Relay: call in {} ended", chat_id);
            let ended = IncomingSignal::CallEnded {
                chat_id: chat_id.clone(),
                last_user_id: remaining.first().cloned(),
            };
            // Remaining members plus everyone still ringing
            let mut notify = remaining;
            let ringing: Vec<UserId> = self
                .chats
                .get(&chat_id)
                .map(|members| {
                    members
                        .iter()
                        .filter(|m| **m != user_id && !notify.contains(*m))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            notify.extend(ringing);
            deliveries.extend(notify.into_iter().map(|member| (member, ended.clone())));
        }
        deliveries
    }

    /// Queue deliveries and drain the outbox unless a drain is already running.
    fn post(&self, deliveries: Vec<(UserId, IncomingSignal)>) {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(deliveries);

        loop {
            if self.delivering.swap(true, Ordering::AcqRel) {
                return;
            }
            while let Some((to, signal)) = self.next_delivery() {
                self.deliver(&to, &signal);
            }
            self.delivering.store(false, Ordering::Release);

            if self
                .outbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
            {
                return;
            }
        }
    }

    fn next_delivery(&self) -> Option<(UserId, IncomingSignal)> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn deliver(&self, to: &UserId, signal: &IncomingSignal) {
        let Some(mailbox) = self.mailboxes.get(to).map(|m| m.value().clone()) else {
            debug!("Relay: {} not connected, dropping {}", to, signal.event_name());
            return;
        };
        debug!("Relay: {} -> {}", signal.event_name(), to);
        mailbox
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(signal.clone());
        for handler in mailbox.handlers.snapshot() {
            handler.on_signal(signal);
        }
    }
}

/// One user's connection to a [`LocalRelay`].
pub struct RelayChannel {
    user_id: UserId,
    mailbox: Arc<Mailbox>,
    relay: Arc<RelayInner>,
    sent: Mutex<Vec<OutgoingSignal>>,
}

impl RelayChannel {
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Everything emitted on this channel, oldest first.
    pub fn sent(&self) -> Vec<OutgoingSignal> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Everything delivered to this channel, oldest first.
    pub fn received(&self) -> Vec<IncomingSignal> {
        self.mailbox
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SignalingChannel for RelayChannel {
    fn emit(&self, signal: OutgoingSignal) {
        debug!(
            "Relay: {} <- {} from {}",
            signal.event_name(),
            signal.chat_id(),
            self.user_id
        );
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(signal.clone());
        self.relay.handle(&self.user_id, signal);
    }

    fn subscribe(&self, handler: Arc<dyn SignalHandler>) -> SubscriptionId {
        self.mailbox.handlers.add(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.mailbox.handlers.remove(id)
    }
}
