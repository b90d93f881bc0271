use std::sync::{Arc, Weak};
use std::time::Duration;

use constellation_core::PeerId;
use constellation_fabric::codec::{BincodeCodec, Codec};
use constellation_fabric::{PacketHandler, Transport};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::call::{Canceller, RemoteCall};
use crate::callable::{CallResult, Callable};
use crate::config::{RpcConfig, RpcSystemBuilder};
use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::failure::Failure;
use crate::ids::{CallId, CallKey, FunctionId};
use crate::message::{Message, MESSAGE_TYPE};
use crate::monitor::{self, PingHandler};
use crate::pending::{InboundTable, OutboundTable};
use crate::registry::Registry;
use crate::stub::{Invoker, RemoteFunctionStub};
use crate::value::{Args, Kwargs, Value};

enum Lifecycle {
    Idle,
    Opening,
    /// Tasks are spawned on the runtime the system was opened in, so calls
    /// can be made from threads outside it
    Open {
        monitor: JoinHandle<()>,
        runtime: Handle,
    },
    Closed,
}

/// RPC runtime for one node
///
/// Publishes local functions for remote peers, hands out stubs for remote
/// functions, correlates replies with outstanding calls and runs the liveness
/// monitor. Cloning is cheap and every clone drives the same system.
///
/// ```no_run
/// use std::time::Duration;
///
/// use constellation_fabric::transport::TcpTransport;
/// use constellation_rpc::{callable, Failure, RpcSystem, Value};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpTransport::bind("127.0.0.1:7000".parse()?).await?;
/// let system = RpcSystem::new(transport, Duration::from_secs(5), Duration::from_secs(2));
/// system.open().await?;
///
/// let add = callable::from_fn(|args, _| async move {
///     match (args.first().and_then(Value::as_i64), args.get(1).and_then(Value::as_i64)) {
///         (Some(a), Some(b)) => Ok(Value::Int(a + b)),
///         _ => Err(Failure::invalid_arguments("expected two integers")),
///     }
/// });
/// let url = system.export_url(&add);
///
/// // On another node, after receiving `url` out of band:
/// let stub = system.create_stub(&url)?;
/// assert_eq!(stub.call_args(vec![2.into(), 3.into()]).await?, Value::Int(5));
/// # Ok(())
/// # }
/// ```
pub struct RpcSystem<C = BincodeCodec> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for RpcSystem<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct Inner<C> {
    this: Weak<Inner<C>>,
    own_id: PeerId,
    transport: Arc<dyn Transport>,
    codec: C,
    pub(crate) config: RpcConfig,
    registry: Registry,
    pub(crate) outbound: OutboundTable,
    inbound: Arc<InboundTable>,
    lifecycle: Mutex<Lifecycle>,
}

impl RpcSystem<BincodeCodec> {
    /// Create a system over `transport` with the given liveness settings
    pub fn new(
        transport: impl Transport + 'static,
        ping_interval: Duration,
        ping_timeout: Duration,
    ) -> Self {
        Self::builder(transport)
            .ping_interval(ping_interval)
            .ping_timeout(ping_timeout)
            .build()
    }

    pub fn builder(transport: impl Transport + 'static) -> RpcSystemBuilder<BincodeCodec> {
        RpcSystemBuilder::new(transport)
    }
}

impl<C: Codec + 'static> RpcSystem<C> {
    pub(crate) fn from_parts(transport: Arc<dyn Transport>, codec: C, config: RpcConfig) -> Self {
        let inbound = Arc::new(InboundTable::default());
        let registry = Registry::new();
        registry.reserve(
            FunctionId::ping(),
            Arc::new(PingHandler::new(inbound.clone())),
        );

        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            own_id: transport.own_id().clone(),
            transport,
            codec,
            config,
            registry,
            outbound: OutboundTable::default(),
            inbound,
            lifecycle: Mutex::new(Lifecycle::Idle),
        });
        Self { inner }
    }

    /// Open the transport and start the liveness monitor
    ///
    /// A system opens once; opening it again fails with
    /// [`Error::AlreadyOpen`], or [`Error::Closed`] after a close.
    pub async fn open(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Idle => *lifecycle = Lifecycle::Opening,
                Lifecycle::Opening | Lifecycle::Open { .. } => return Err(Error::AlreadyOpen),
                Lifecycle::Closed => return Err(Error::Closed),
            }
        }

        let weak = self.inner.this.clone();
        let handler: PacketHandler =
            Arc::new(move |peer: PeerId, message_type: &str, payload: Vec<u8>| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_packet(peer, message_type, payload);
                }
            });

        if let Err(e) = self.inner.transport.open(handler).await {
            *self.inner.lifecycle.lock() = Lifecycle::Idle;
            return Err(e.into());
        }

        let monitor = runtime.spawn(monitor::run(self.inner.this.clone()));
        *self.inner.lifecycle.lock() = Lifecycle::Open { monitor, runtime };
        tracing::debug!(peer = %self.inner.own_id, "rpc system open");
        Ok(())
    }

    /// Stop the liveness monitor and close the transport
    ///
    /// Calls still waiting for a reply fail with [`Error::Closed`] and
    /// functions executing on behalf of peers are cancelled.
    pub async fn close(&self) -> Result<()> {
        let monitor = {
            let mut lifecycle = self.inner.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
                Lifecycle::Open { monitor, .. } => monitor,
                other => {
                    *lifecycle = other;
                    return Err(Error::NotOpen);
                }
            }
        };
        monitor.abort();

        let closed = self.inner.transport.close().await;

        let failed = self.inner.outbound.fail_all(|_| Error::Closed);
        let cancelled = self.inner.inbound.cancel_all();
        tracing::debug!(
            peer = %self.inner.own_id,
            failed,
            cancelled,
            "rpc system closed"
        );
        closed.map_err(Into::into)
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub fn own_id(&self) -> &PeerId {
        &self.inner.own_id
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    /// Publish `callable`, returning its function id
    ///
    /// Publishing the same callable again returns the id it already has.
    pub fn publish(&self, callable: &Arc<dyn Callable>) -> FunctionId {
        self.inner.registry.publish(callable)
    }

    /// Withdraw a published function; later calls to it are rejected
    pub fn unpublish(&self, function_id: &FunctionId) -> bool {
        self.inner.registry.unpublish(function_id)
    }

    /// Publish `callable` and return a descriptor peers can resolve
    pub fn export_url(&self, callable: &Arc<dyn Callable>) -> String {
        let function_id = self.publish(callable);
        Descriptor::new(self.inner.own_id.clone(), function_id).to_string()
    }

    /// Descriptor of an existing stub, for forwarding to another peer
    pub fn export_stub_url(&self, stub: &RemoteFunctionStub) -> String {
        stub.url()
    }

    /// Resolve a descriptor into a stub bound to this system
    pub fn create_stub(&self, descriptor: &str) -> Result<RemoteFunctionStub> {
        let descriptor: Descriptor = descriptor.parse().map_err(|e: Error| {
            tracing::warn!(error = %e, "rejecting descriptor");
            e
        })?;
        Ok(self.stub(descriptor.peer_id, descriptor.function_id))
    }

    /// Stub for `function_id` on `peer`, bound to this system
    pub fn stub(&self, peer: PeerId, function_id: FunctionId) -> RemoteFunctionStub {
        RemoteFunctionStub::new(peer, function_id, self.invoker())
    }

    /// Publish `callable` and return a stub for it, e.g. to pass it as an argument
    pub fn local_stub(&self, callable: &Arc<dyn Callable>) -> RemoteFunctionStub {
        let function_id = self.publish(callable);
        self.stub(self.inner.own_id.clone(), function_id)
    }

    /// Call `function_id` on `peer`
    ///
    /// Calls to this system's own id run locally without touching the
    /// transport. The returned future has no timeout of its own: a call that
    /// never completes is only failed by the liveness monitor.
    pub fn invoke(
        &self,
        peer: &PeerId,
        function_id: FunctionId,
        args: Args,
        kwargs: Kwargs,
    ) -> RemoteCall {
        self.inner.invoke(peer.clone(), function_id, args, kwargs)
    }

    /// Outbound calls waiting for a reply, liveness pings included
    pub fn pending_outbound(&self) -> usize {
        self.inner.outbound.len()
    }

    /// Inbound calls executing on behalf of peers
    pub fn pending_inbound(&self) -> usize {
        self.inner.inbound.len()
    }

    pub(crate) fn invoker(&self) -> Weak<dyn Invoker> {
        let weak: Weak<Inner<C>> = Arc::downgrade(&self.inner);
        weak
    }
}

impl<C: Codec + 'static> Inner<C> {
    fn is_open(&self) -> bool {
        self.runtime().is_some()
    }

    /// Runtime of an open system
    fn runtime(&self) -> Option<Handle> {
        match &*self.lifecycle.lock() {
            Lifecycle::Open { runtime, .. } => Some(runtime.clone()),
            _ => None,
        }
    }

    fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>> {
        self.codec.encode(message).map_err(codec_error)
    }

    fn invoke_local(&self, function_id: FunctionId, args: Args, kwargs: Kwargs) -> RemoteCall {
        let Some(callable) = self.registry.get(&function_id) else {
            return RemoteCall::ready(Err(Error::UnknownFunction(function_id)));
        };
        RemoteCall::local(Box::pin(async move {
            callable.call(args, kwargs).await.map_err(Error::Failed)
        }))
    }

    fn invoke_remote(
        &self,
        runtime: &Handle,
        peer: PeerId,
        function_id: FunctionId,
        args: Args,
        kwargs: Kwargs,
        is_ping: bool,
    ) -> RemoteCall {
        let call_id = CallId::new();
        let payload = match self.encode(&Message::Call {
            call_id,
            function_id,
            args,
            kwargs,
        }) {
            Ok(payload) => payload,
            Err(e) => return RemoteCall::ready(Err(e)),
        };

        // Registered before sending so a fast reply always finds its entry
        let key = CallKey::new(peer, call_id);
        let (sender, receiver) = oneshot::channel();
        self.outbound.insert(key.clone(), sender, is_ping);

        let this = self.this.clone();
        let send_key = key.clone();
        runtime.spawn(async move {
            let Some(inner) = this.upgrade() else {
                return;
            };
            match inner
                .transport
                .send(&send_key.peer, MESSAGE_TYPE, &payload)
                .await
            {
                Ok(()) => inner.outbound.mark_sent(&send_key),
                Err(e) => {
                    tracing::debug!(
                        peer = %send_key.peer,
                        call_id = %send_key.call_id,
                        error = %e,
                        "failed to send call"
                    );
                    inner.outbound.resolve(&send_key, Err(Error::Transport(e)));
                }
            }
        });

        RemoteCall::remote(receiver, self.canceller(key))
    }

    /// Liveness ping for an outstanding call
    pub(crate) fn ping(&self, key: &CallKey) -> RemoteCall {
        let Some(runtime) = self.runtime() else {
            return RemoteCall::ready(Err(Error::NotOpen));
        };
        self.invoke_remote(
            &runtime,
            key.peer.clone(),
            FunctionId::ping(),
            monitor::ping_args(&self.own_id, key.call_id),
            Kwargs::new(),
            true,
        )
    }

    fn canceller(&self, key: CallKey) -> Canceller {
        let this = self.this.clone();
        Box::new(move || {
            this.upgrade()
                .is_some_and(|inner| inner.cancel_outbound(key))
        })
    }

    fn cancel_outbound(&self, key: CallKey) -> bool {
        if !self.outbound.remove(&key) {
            return false;
        }
        tracing::debug!(peer = %key.peer, call_id = %key.call_id, "cancelling call");

        let payload = match self.encode(&Message::CallCancel {
            call_id: key.call_id,
        }) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode cancellation");
                return true;
            }
        };

        // Best effort: the peer may never hear about it
        match self.runtime() {
            Some(runtime) => {
                let transport = self.transport.clone();
                runtime.spawn(async move {
                    if let Err(e) = transport.send(&key.peer, MESSAGE_TYPE, &payload).await {
                        tracing::debug!(
                            peer = %key.peer,
                            call_id = %key.call_id,
                            error = %e,
                            "failed to send cancellation"
                        );
                    }
                });
            }
            None => {
                tracing::debug!(call_id = %key.call_id, "system not open, cancellation not sent");
            }
        }
        true
    }

    fn on_packet(&self, peer: PeerId, message_type: &str, payload: Vec<u8>) {
        if message_type != MESSAGE_TYPE {
            tracing::trace!(peer = %peer, message_type, "ignoring non-rpc packet");
            return;
        }

        let message: Message = match self.codec.decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "dropping undecodable packet");
                return;
            }
        };
        tracing::trace!(
            peer = %peer,
            call_id = %message.call_id(),
            kind = message.kind(),
            "received message"
        );

        match message {
            Message::Call {
                call_id,
                function_id,
                args,
                kwargs,
            } => self.handle_call(CallKey::new(peer, call_id), function_id, args, kwargs),
            Message::CallReturn { call_id, value } => {
                self.handle_reply(CallKey::new(peer, call_id), Ok(value))
            }
            Message::CallFail { call_id, failure } => {
                self.handle_reply(CallKey::new(peer, call_id), Err(Error::Failed(failure)))
            }
            Message::CallCancel { call_id } => self.handle_cancel(CallKey::new(peer, call_id)),
        }
    }

    fn handle_call(&self, key: CallKey, function_id: FunctionId, args: Args, kwargs: Kwargs) {
        let Some(runtime) = self.runtime() else {
            tracing::debug!(peer = %key.peer, call_id = %key.call_id, "system not open, dropping call");
            return;
        };
        let Some(callable) = self.registry.get(&function_id) else {
            // No reply: the caller finds out through its liveness pings
            tracing::error!(
                peer = %key.peer,
                call_id = %key.call_id,
                function_id = %function_id,
                "protocol violation: call to unknown function"
            );
            return;
        };

        let Some(token) = self.inbound.begin(key.clone()) else {
            tracing::warn!(
                peer = %key.peer,
                call_id = %key.call_id,
                "duplicate call id, ignoring"
            );
            return;
        };

        let this = self.this.clone();
        runtime.spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(peer = %key.peer, call_id = %key.call_id, "call cancelled by caller");
                    return;
                }
                outcome = callable.call(args, kwargs) => outcome,
            };
            if let Some(inner) = this.upgrade() {
                inner.complete_call(key, token, outcome).await;
            }
        });
    }

    async fn complete_call(&self, key: CallKey, token: CancellationToken, outcome: CallResult) {
        let call_id = key.call_id;
        let payload = match outcome {
            Ok(value) => match self.encode(&Message::CallReturn { call_id, value }) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!(
                        peer = %key.peer,
                        call_id = %call_id,
                        error = %e,
                        "failed to serialize return value"
                    );
                    self.encode_failure(call_id, Failure::serialization(e.to_string()))
                }
            },
            Err(failure) => self.encode_failure(call_id, failure),
        };

        if token.is_cancelled() {
            tracing::debug!(peer = %key.peer, call_id = %call_id, "call cancelled, dropping result");
            return;
        }

        // The call stays in the table until its reply is out, so pings
        // answer positively right up to the reply
        if let Some(payload) = payload {
            if let Err(e) = self.transport.send(&key.peer, MESSAGE_TYPE, &payload).await {
                tracing::warn!(
                    peer = %key.peer,
                    call_id = %call_id,
                    error = %e,
                    "failed to send call result"
                );
            }
        }
        self.inbound.finish(&key);
    }

    fn encode_failure(&self, call_id: CallId, failure: Failure) -> Option<Vec<u8>> {
        let encoded = self
            .encode(&Message::CallFail { call_id, failure })
            .or_else(|e| {
                self.encode(&Message::CallFail {
                    call_id,
                    failure: Failure::serialization(format!("failure could not be encoded: {}", e)),
                })
            });
        match encoded {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::error!(call_id = %call_id, error = %e, "failed to serialize call failure");
                None
            }
        }
    }

    fn handle_reply(&self, key: CallKey, result: Result<Value>) {
        if !self.outbound.resolve(&key, result) {
            tracing::warn!(
                peer = %key.peer,
                call_id = %key.call_id,
                "stale reply for a call that is no longer pending"
            );
        }
    }

    fn handle_cancel(&self, key: CallKey) {
        if self.inbound.cancel(&key) {
            tracing::debug!(peer = %key.peer, call_id = %key.call_id, "cancelled inbound call");
        } else {
            tracing::trace!(peer = %key.peer, call_id = %key.call_id, "cancel for finished call");
        }
    }
}

impl<C: Codec + 'static> Invoker for Inner<C> {
    fn invoke(
        &self,
        peer: PeerId,
        function_id: FunctionId,
        args: Args,
        kwargs: Kwargs,
    ) -> RemoteCall {
        let Some(runtime) = self.runtime() else {
            return RemoteCall::ready(Err(Error::NotOpen));
        };
        if peer == self.own_id {
            return self.invoke_local(function_id, args, kwargs);
        }
        self.invoke_remote(&runtime, peer, function_id, args, kwargs, false)
    }
}

fn codec_error(error: constellation_fabric::Error) -> Error {
    match error {
        constellation_fabric::Error::Codec(message) => Error::Codec(message),
        other => Error::Transport(other),
    }
}
