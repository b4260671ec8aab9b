//! Call session store.
//!
//! Hosts the [`SessionState`] reducer from `meshcore` as the single writer of
//! the process-wide call session. Dispatch is serialized: one thread at a time
//! drains the queue, so every listener observes every update in apply order.
//! A dispatch from inside a listener is queued and applied after the current
//! action. A dispatch from any other thread blocks until its action has been
//! applied.
//!
//! The store also owns the initiator's ringing timer. It runs while the local
//! side initiated the call and the call is still `ringing` or `connecting`,
//! and is cleared on any transition out of those states.

use log::{debug, info, warn};
use meshcore::types::{CallId, ChatId, EndReason};
use meshcore::{CallSession, SessionAction, SessionError, SessionState};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::listeners::{Listeners, SubscriptionId};

/// Default ringing window before an unanswered outgoing call is hung up.
pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(30);

/// What listeners receive after each dispatched action.
#[derive(Debug, Clone)]
pub struct SessionUpdate {
    pub action: SessionAction,
    /// `Err` when the reducer rejected the action; the state is then unchanged.
    pub result: Result<(), SessionError>,
    /// The session before the action was applied.
    pub previous: Option<CallSession>,
    pub state: SessionState,
}

impl SessionUpdate {
    pub fn call(&self) -> Option<&CallSession> {
        self.state.active_call.as_ref()
    }

    pub fn status_changed(&self) -> bool {
        self.previous.as_ref().map(|c| c.call_status) != self.state.status()
    }
}

pub trait SessionListener: Send + Sync {
    fn on_session_update(&self, update: &SessionUpdate);
}

impl<F> SessionListener for F
where
    F: Fn(&SessionUpdate) + Send + Sync,
{
    fn on_session_update(&self, update: &SessionUpdate) {
        self(update)
    }
}

struct RingTimer {
    call_id: CallId,
    handle: JoinHandle<()>,
}

type ApplyResult = Result<(), SessionError>;

#[derive(Default)]
struct DispatchQueue {
    pending: VecDeque<(u64, SessionAction)>,
    next_seq: u64,
    /// Thread currently applying queued actions.
    drainer: Option<ThreadId>,
    /// Results owed to dispatches blocked on another thread's drain.
    awaited: HashMap<u64, Option<ApplyResult>>,
}

pub struct SessionStore {
    state: RwLock<SessionState>,
    queue: Mutex<DispatchQueue>,
    applied: Condvar,
    listeners: Listeners<dyn SessionListener>,
    ring_timer: Mutex<Option<RingTimer>>,
    ring_timeout: Duration,
    runtime: Option<Handle>,
    this: Weak<SessionStore>,
}

impl SessionStore {
    /// Create a store. The ring timer runs on the tokio runtime current at
    /// construction, whichever thread later applies the action that arms it.
    pub fn new(ring_timeout: Duration) -> Arc<Self> {
        Self::build(ring_timeout, Handle::try_current().ok())
    }

    /// Create a store outside the runtime its ring timer should run on.
    pub fn with_runtime(ring_timeout: Duration, runtime: Handle) -> Arc<Self> {
        Self::build(ring_timeout, Some(runtime))
    }

    fn build(ring_timeout: Duration, runtime: Option<Handle>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            state: RwLock::new(SessionState::new()),
            queue: Mutex::new(DispatchQueue::default()),
            applied: Condvar::new(),
            listeners: Listeners::default(),
            ring_timer: Mutex::new(None),
            ring_timeout,
            runtime,
            this: this.clone(),
        })
    }

    /// Current state. Cheap enough to call from every listener.
    pub fn snapshot(&self) -> SessionState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn active_call(&self) -> Option<CallSession> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active_call
            .clone()
    }

    pub fn error(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .error
            .clone()
    }

    pub fn subscribe(&self, listener: Arc<dyn SessionListener>) -> SubscriptionId {
        self.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Whether the ringing timer is currently armed.
    pub fn ring_timer_armed(&self) -> bool {
        self.ring_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Whether the calling thread is inside a listener of this store.
    pub fn in_dispatch(&self) -> bool {
        self.lock_queue().drainer == Some(thread::current().id())
    }

    /// Apply `action` and return the reducer's verdict.
    ///
    /// Returns `None` only when called from inside a listener of this store:
    /// the action is then queued and applied once the current one has been
    /// delivered to every listener.
    pub fn dispatch(&self, action: SessionAction) -> Option<Result<(), SessionError>> {
        let me = thread::current().id();
        let mut queue = self.lock_queue();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.pending.push_back((seq, action));

        loop {
            if let Some(result) = queue.awaited.get_mut(&seq).and_then(Option::take) {
                queue.awaited.remove(&seq);
                return Some(result);
            }
            match queue.drainer {
                Some(owner) if owner == me => return None,
                Some(_) => {
                    queue.awaited.entry(seq).or_insert(None);
                    queue = self
                        .applied
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                None => {
                    queue.drainer = Some(me);
                    queue.awaited.remove(&seq);
                    drop(queue);
                    return self.drain(me, seq);
                }
            }
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, DispatchQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply queued actions until the queue is empty. Returns the result for `mine`.
    fn drain(&self, me: ThreadId, mine: u64) -> Option<ApplyResult> {
        let _release = DrainRelease { store: self, me };
        let mut outcome = None;
        loop {
            let next = {
                let mut queue = self.lock_queue();
                let next = queue.pending.pop_front();
                if next.is_none() {
                    queue.drainer = None;
                    self.applied.notify_all();
                }
                next
            };
            let Some((seq, action)) = next else {
                return outcome;
            };

            let result = self.apply(action);
            if seq == mine {
                outcome = Some(result);
            } else {
                let mut queue = self.lock_queue();
                if let Some(slot) = queue.awaited.get_mut(&seq) {
                    *slot = Some(result);
                    self.applied.notify_all();
                }
            }
        }
    }

    fn apply(&self, action: SessionAction) -> ApplyResult {
        let (previous, result, state) = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let previous = state.active_call.clone();
            let result = state.apply(&action);
            (previous, result, state.clone())
        };

        if let Err(e) = &result {
            debug!("Session ignored {}: {}", action.name(), e);
        }

        self.sync_ring_timer(&state);

        let update = SessionUpdate {
            action,
            result,
            previous,
            state,
        };
        for listener in self.listeners.snapshot() {
            listener.on_session_update(&update);
        }
        update.result
    }

    fn sync_ring_timer(&self, state: &SessionState) {
        let pending = state
            .active_call
            .as_ref()
            .filter(|call| call.is_initiator && call.call_status.is_pending());

        let mut timer = self
            .ring_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match (pending, timer.as_ref()) {
            (Some(call), Some(running)) if running.call_id == call.call_id => {}
            (Some(call), _) => {
                if let Some(stale) = timer.take() {
                    stale.handle.abort();
                }
                *timer = self.arm_ring_timer(call);
            }
            (None, Some(_)) => {
                if let Some(running) = timer.take() {
                    debug!("Ring timer cleared for call {}", running.call_id);
                    running.handle.abort();
                }
            }
            (None, None) => {}
        }
    }

    fn arm_ring_timer(&self, call: &CallSession) -> Option<RingTimer> {
        let Some(runtime) = self
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
        else {
            warn!(
                "No async runtime; ring timeout disabled for call {}",
                call.call_id
            );
            return None;
        };

        let store = self.this.clone();
        let chat_id = call.chat_id.clone();
        let call_id = call.call_id.clone();
        let timeout = self.ring_timeout;
        debug!("Ring timer armed for call {} ({:?})", call_id, timeout);

        let handle = runtime.spawn({
            let call_id = call_id.clone();
            async move {
                tokio::time::sleep(timeout).await;
                if let Some(store) = store.upgrade() {
                    store.ring_timeout_elapsed(&chat_id, &call_id);
                }
            }
        });
        Some(RingTimer { call_id, handle })
    }

    fn ring_timeout_elapsed(&self, chat_id: &ChatId, call_id: &CallId) {
        {
            let mut timer = self
                .ring_timer
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match timer.as_ref() {
                // Disarm before dispatching so the hangup cannot fire twice
                Some(running) if &running.call_id == call_id => {
                    timer.take();
                }
                _ => return,
            }
        }

        let Some(call) = self.active_call().filter(|call| {
            &call.call_id == call_id && call.is_initiator && call.call_status.is_pending()
        }) else {
            return;
        };

        info!(
            "Call {} unanswered after {:?}, hanging up",
            call_id, self.ring_timeout
        );
        self.dispatch(SessionAction::CallHangup {
            chat_id: chat_id.clone(),
            user_id: call.caller_id,
            reason: EndReason::RingTimeout,
        });
    }
}

/// Hands the drain back if a listener panics mid-apply, so blocked
/// dispatches can take over.
struct DrainRelease<'a> {
    store: &'a SessionStore,
    me: ThreadId,
}

impl Drop for DrainRelease<'_> {
    fn drop(&mut self) {
        let mut queue = self.store.lock_queue();
        if queue.drainer == Some(self.me) {
            queue.drainer = None;
            self.store.applied.notify_all();
        }
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        let timer = self
            .ring_timer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            timer.handle.abort();
        }
    }
}
