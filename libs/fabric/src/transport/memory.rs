//! In-process transport for tests and single-process topologies.
//!
//! A [`MemoryNetwork`] is a hub that routes packets between the
//! [`MemoryTransport`]s created from it. Each open transport owns an mpsc
//! queue drained by a pump task, so delivery is asynchronous and FIFO per
//! receiver, like a pooled TCP connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use constellation_core::PeerId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::transport::{PacketHandler, Transport};

struct Delivery {
    from: PeerId,
    message_type: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<PeerId, mpsc::UnboundedSender<Delivery>>,
    disconnected: HashSet<PeerId>,
    stalled: HashSet<PeerId>,
}

/// Hub connecting in-memory transports
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport attached to this network under `id`
    pub fn transport(&self, id: PeerId) -> MemoryTransport {
        MemoryTransport {
            own_id: id,
            network: self.clone(),
            pump: Mutex::new(None),
        }
    }

    /// Cut `peer` off: every send to or from it fails until [`reconnect`](Self::reconnect)
    pub fn disconnect(&self, peer: &PeerId) {
        tracing::debug!(peer = %peer, "memory network: disconnect");
        self.state.lock().disconnected.insert(peer.clone());
    }

    /// Silently drop everything sent to or from `peer`
    ///
    /// Sends keep succeeding, as they would into the socket buffer of a
    /// process that hung or was killed without its connections closing.
    pub fn stall(&self, peer: &PeerId) {
        tracing::debug!(peer = %peer, "memory network: stall");
        self.state.lock().stalled.insert(peer.clone());
    }

    /// Undo [`disconnect`](Self::disconnect) and [`stall`](Self::stall)
    pub fn reconnect(&self, peer: &PeerId) {
        tracing::debug!(peer = %peer, "memory network: reconnect");
        let mut state = self.state.lock();
        state.disconnected.remove(peer);
        state.stalled.remove(peer);
    }

    /// Whether `peer` currently has an open transport on this network
    pub fn is_open(&self, peer: &PeerId) -> bool {
        self.state.lock().endpoints.contains_key(peer)
    }

    fn deliver(
        &self,
        from: &PeerId,
        to: &PeerId,
        message_type: &str,
        payload: &[u8],
    ) -> Result<()> {
        let state = self.state.lock();
        if state.disconnected.contains(from) || state.disconnected.contains(to) {
            return Err(Error::Unreachable(to.clone()));
        }
        if state.stalled.contains(from) || state.stalled.contains(to) {
            return Ok(());
        }
        let endpoint = state
            .endpoints
            .get(to)
            .ok_or_else(|| Error::Unreachable(to.clone()))?;
        endpoint
            .send(Delivery {
                from: from.clone(),
                message_type: message_type.to_string(),
                payload: payload.to_vec(),
            })
            .map_err(|_| Error::Unreachable(to.clone()))
    }
}

/// One node's view of a [`MemoryNetwork`]
pub struct MemoryTransport {
    own_id: PeerId,
    network: MemoryNetwork,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn own_id(&self) -> &PeerId {
        &self.own_id
    }

    async fn open(&self, handler: PacketHandler) -> Result<()> {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return Err(Error::AlreadyOpen);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        {
            let mut state = self.network.state.lock();
            if state.endpoints.contains_key(&self.own_id) {
                return Err(Error::Custom(format!(
                    "peer id {} already open on this network",
                    self.own_id
                )));
            }
            state.endpoints.insert(self.own_id.clone(), tx);
        }

        *pump = Some(tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                handler(delivery.from, &delivery.message_type, delivery.payload);
            }
        }));
        Ok(())
    }

    async fn send(&self, peer: &PeerId, message_type: &str, payload: &[u8]) -> Result<()> {
        if self.pump.lock().is_none() {
            return Err(Error::NotOpen);
        }
        self.network.deliver(&self.own_id, peer, message_type, payload)
    }

    async fn close(&self) -> Result<()> {
        let pump = self.pump.lock().take().ok_or(Error::NotOpen)?;
        self.network.state.lock().endpoints.remove(&self.own_id);
        pump.abort();
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            self.network.state.lock().endpoints.remove(&self.own_id);
            pump.abort();
        }
    }
}
