//! Correlation tables for calls in flight.
//!
//! Outbound entries belong to calls this system made and are waiting for a
//! reply; inbound entries belong to calls a peer made that are executing here.
//! Both are keyed by (peer, call id). Removing an outbound entry is the single
//! point where a call reaches its terminal state, so whoever removes it owns
//! the outcome and everyone racing with it sees a no-op. Inbound entries live
//! until the reply is sent; their token decides whether it is sent at all.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::ids::CallKey;
use crate::value::Value;

pub(crate) type ResultSender = oneshot::Sender<Result<Value>>;

struct OutboundCall {
    sender: ResultSender,
    /// Liveness pings are calls too, but are never pinged themselves
    is_ping: bool,
    /// Set once the call is on the wire; a ping must not overtake it
    sent: bool,
    inserted: Instant,
}

#[derive(Default)]
pub(crate) struct OutboundTable {
    calls: DashMap<CallKey, OutboundCall>,
}

impl OutboundTable {
    pub fn insert(&self, key: CallKey, sender: ResultSender, is_ping: bool) {
        self.calls.insert(
            key,
            OutboundCall {
                sender,
                is_ping,
                sent: false,
                inserted: Instant::now(),
            },
        );
    }

    pub fn mark_sent(&self, key: &CallKey) {
        if let Some(mut call) = self.calls.get_mut(key) {
            call.sent = true;
        }
    }

    /// Pop the entry and deliver `result` to its caller
    ///
    /// Returns false when the call is no longer pending.
    pub fn resolve(&self, key: &CallKey, result: Result<Value>) -> bool {
        match self.calls.remove(key) {
            Some((_, call)) => {
                // Caller may have stopped waiting
                let _ = call.sender.send(result);
                true
            }
            None => false,
        }
    }

    /// Drop the entry without resolving it
    pub fn remove(&self, key: &CallKey) -> bool {
        self.calls.remove(key).is_some()
    }

    pub fn contains(&self, key: &CallKey) -> bool {
        self.calls.contains_key(key)
    }

    /// Keys of every sent call that isn't itself a liveness ping
    pub fn snapshot(&self) -> Vec<CallKey> {
        self.calls
            .iter()
            .filter(|entry| entry.value().sent && !entry.value().is_ping)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Keys of calls still waiting on their send since before `cutoff`
    ///
    /// A send that never completes (a peer whose socket buffer stays full)
    /// keeps its call out of the ping snapshot, so these are failed directly.
    pub fn unsent_since(&self, cutoff: Instant) -> Vec<CallKey> {
        self.calls
            .iter()
            .filter(|entry| {
                let call = entry.value();
                !call.sent && !call.is_ping && call.inserted <= cutoff
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Resolve every pending call with the error built by `error`
    pub fn fail_all(&self, error: impl Fn(&CallKey) -> crate::error::Error) -> usize {
        let keys: Vec<CallKey> = self.calls.iter().map(|entry| entry.key().clone()).collect();
        keys.into_iter()
            .filter(|key| self.resolve(key, Err(error(key))))
            .count()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

#[derive(Default)]
pub(crate) struct InboundTable {
    calls: DashMap<CallKey, CancellationToken>,
}

impl InboundTable {
    /// Register an execution, returning its cancellation token
    ///
    /// Returns `None` if the key is already executing.
    pub fn begin(&self, key: CallKey) -> Option<CancellationToken> {
        match self.calls.entry(key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let token = CancellationToken::new();
                vacant.insert(token.clone());
                Some(token)
            }
        }
    }

    /// Remove a finished execution; false if it was cancelled meanwhile
    pub fn finish(&self, key: &CallKey) -> bool {
        self.calls.remove(key).is_some()
    }

    /// Remove and cancel an execution; false if it already finished
    pub fn cancel(&self, key: &CallKey) -> bool {
        match self.calls.remove(key) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let keys: Vec<CallKey> = self.calls.iter().map(|entry| entry.key().clone()).collect();
        keys.iter().filter(|key| self.cancel(key)).count()
    }

    pub fn contains(&self, key: &CallKey) -> bool {
        self.calls.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}
