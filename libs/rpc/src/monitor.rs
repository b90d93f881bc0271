//! Liveness monitoring for outbound calls.
//!
//! A call whose peer dies without closing the connection would otherwise
//! wait forever. Every `ping_interval` the monitor asks the peer of each
//! outstanding call, via the reserved ping function, whether it is still
//! executing that call. A failed, timed out or negative ping fails the call
//! with [`Error::LostPeer`], bounding detection to roughly
//! `ping_interval + ping_timeout`. A call whose send is still blocked after
//! that long is failed the same way without a ping.

use std::sync::{Arc, Weak};

use constellation_core::PeerId;
use constellation_fabric::codec::Codec;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::callable::{CallResult, Callable};
use crate::error::Error;
use crate::failure::Failure;
use crate::ids::{CallId, CallKey};
use crate::pending::InboundTable;
use crate::system::Inner;
use crate::value::{Args, Kwargs, Value};

/// Arguments of a ping for `call_id`, sent by `own_id`
pub(crate) fn ping_args(own_id: &PeerId, call_id: CallId) -> Args {
    vec![
        Value::from(own_id.as_str()),
        Value::from(call_id.to_string()),
    ]
}

fn parse_ping_args(args: &[Value]) -> Result<CallKey, Failure> {
    let (peer, call_id) = match args {
        [Value::String(peer), Value::String(call_id)] => (peer, call_id),
        _ => {
            return Err(Failure::invalid_arguments(
                "ping expects (peer id, call id)",
            ))
        }
    };
    let peer = PeerId::new(peer.as_str()).map_err(|e| Failure::invalid_arguments(e.to_string()))?;
    let call_id = call_id
        .parse()
        .map_err(|e: uuid::Error| Failure::invalid_arguments(e.to_string()))?;
    Ok(CallKey::new(peer, call_id))
}

/// Reserved function answering "is this call still running here?"
pub(crate) struct PingHandler {
    inbound: Arc<InboundTable>,
}

impl PingHandler {
    pub fn new(inbound: Arc<InboundTable>) -> Self {
        Self { inbound }
    }
}

#[async_trait::async_trait]
impl Callable for PingHandler {
    async fn call(&self, args: Args, _kwargs: Kwargs) -> CallResult {
        let key = parse_ping_args(&args)?;
        if self.inbound.contains(&key) {
            Ok(Value::Bool(true))
        } else {
            Err(Failure::no_such_call(format!(
                "no call {} from {} in progress",
                key.call_id, key.peer
            )))
        }
    }
}

/// Run the monitor until the system is dropped or the task is aborted
pub(crate) async fn run<C: Codec + 'static>(system: Weak<Inner<C>>) {
    loop {
        let interval = match system.upgrade() {
            Some(inner) => inner.config.ping_interval,
            None => break,
        };
        tokio::time::sleep(interval).await;

        let Some(inner) = system.upgrade() else {
            break;
        };
        check_outstanding(&inner).await;
    }
    tracing::debug!("liveness monitor stopped");
}

/// One monitor iteration: ping every outstanding call concurrently
pub(crate) async fn check_outstanding<C: Codec + 'static>(inner: &Arc<Inner<C>>) {
    // Calls whose send has been blocked for a whole liveness window
    let window = inner.config.ping_interval + inner.config.ping_timeout;
    if let Some(cutoff) = Instant::now().checked_sub(window) {
        for key in inner.outbound.unsent_since(cutoff) {
            lose(inner, &key, "call could not be sent");
        }
    }

    let keys = inner.outbound.snapshot();
    if keys.is_empty() {
        return;
    }
    tracing::trace!(count = keys.len(), "pinging outstanding calls");

    let timeout = inner.config.ping_timeout;
    let mut pings = JoinSet::new();
    for key in keys {
        // A reply may have landed since the snapshot
        if !inner.outbound.contains(&key) {
            continue;
        }
        let ping = inner.ping(&key);
        pings.spawn(async move {
            let lost = match tokio::time::timeout(timeout, ping).await {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("ping timed out".to_string()),
            };
            (key, lost)
        });
    }

    while let Some(joined) = pings.join_next().await {
        let Ok((key, Some(reason))) = joined else {
            continue;
        };
        lose(inner, &key, &reason);
    }
}

fn lose<C: Codec + 'static>(inner: &Inner<C>, key: &CallKey, reason: &str) {
    let error = Error::LostPeer {
        peer: key.peer.clone(),
        call_id: key.call_id,
    };
    if inner.outbound.resolve(key, Err(error)) {
        tracing::warn!(
            peer = %key.peer,
            call_id = %key.call_id,
            reason,
            "lost communication to peer during call"
        );
    }
}
