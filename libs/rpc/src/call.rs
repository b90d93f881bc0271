use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::value::Value;

/// Removes the outbound entry and notifies the peer; false if already settled
pub(crate) type Canceller = Box<dyn FnOnce() -> bool + Send>;

type LocalCall = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

enum State {
    /// Fast path: the target function lives in this process
    Local(LocalCall),
    Remote {
        receiver: oneshot::Receiver<Result<Value>>,
        cancel: Option<Canceller>,
    },
    Done(Option<Result<Value>>),
}

/// The pending result of an invocation
///
/// Resolves to the function's return value, or to an error: the remote
/// function failed ([`Error::Failed`]), the peer was lost
/// ([`Error::LostPeer`]), the send failed, or the call was cancelled.
///
/// Dropping an unfinished call cancels it, as does [`RemoteCall::cancel`].
#[must_use = "calls are cancelled when dropped"]
pub struct RemoteCall {
    state: State,
}

impl RemoteCall {
    pub(crate) fn local(call: LocalCall) -> Self {
        Self {
            state: State::Local(call),
        }
    }

    pub(crate) fn remote(receiver: oneshot::Receiver<Result<Value>>, cancel: Canceller) -> Self {
        Self {
            state: State::Remote {
                receiver,
                cancel: Some(cancel),
            },
        }
    }

    pub(crate) fn ready(result: Result<Value>) -> Self {
        Self {
            state: State::Done(Some(result)),
        }
    }

    /// Cancel the call if it is still outstanding
    ///
    /// Local bookkeeping is dropped immediately and the peer is told to stop
    /// executing (best effort). Returns true if this call actually cancelled
    /// anything; cancelling a settled call, or cancelling twice, is a no-op
    /// that leaves any already-received result in place.
    pub fn cancel(&mut self) -> bool {
        match std::mem::replace(&mut self.state, State::Done(None)) {
            State::Local(_) => {
                self.state = State::Done(Some(Err(Error::Cancelled)));
                true
            }
            State::Remote {
                receiver,
                cancel: Some(cancel),
            } => {
                if cancel() {
                    self.state = State::Done(Some(Err(Error::Cancelled)));
                    true
                } else {
                    self.state = State::Remote {
                        receiver,
                        cancel: None,
                    };
                    false
                }
            }
            state => {
                self.state = state;
                false
            }
        }
    }
}

impl Future for RemoteCall {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = match &mut this.state {
            State::Local(call) => ready!(call.as_mut().poll(cx)),
            // Sender dropped without a result: the entry was removed by a cancel
            State::Remote { receiver, .. } => {
                ready!(Pin::new(receiver).poll(cx)).unwrap_or(Err(Error::Cancelled))
            }
            State::Done(result) => result.take().unwrap_or(Err(Error::Cancelled)),
        };
        this.state = State::Done(None);
        Poll::Ready(result)
    }
}

impl Drop for RemoteCall {
    fn drop(&mut self) {
        if let State::Remote { cancel, .. } = &mut self.state {
            if let Some(cancel) = cancel.take() {
                cancel();
            }
        }
    }
}
