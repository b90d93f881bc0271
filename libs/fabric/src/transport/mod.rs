use std::sync::Arc;

use constellation_core::PeerId;

use crate::error::Result;

pub mod memory;
pub mod tcp;

pub use self::memory::{MemoryNetwork, MemoryTransport};
pub use self::tcp::{TcpTransport, TcpTransportBuilder};

/// Receive callback invoked for every packet delivered by a transport
///
/// Arguments are the sending peer, the message type the sender used and the
/// raw payload. Handlers must not block; long work belongs on a spawned task.
pub type PacketHandler = Arc<dyn Fn(PeerId, &str, Vec<u8>) + Send + Sync>;

/// Message-oriented transport over a pool of peer connections
///
/// A transport is identified by its own [`PeerId`]. Payloads are opaque bytes
/// tagged with a message type so several protocols can share one transport.
/// Delivery is FIFO per sender/receiver pair.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// The id remote peers use to reach this transport
    fn own_id(&self) -> &PeerId;

    /// Start accepting packets, delivering each one to `handler`
    async fn open(&self, handler: PacketHandler) -> Result<()>;

    /// Send a typed payload to `peer`
    ///
    /// Fails with [`Error::Unreachable`](crate::Error::Unreachable) or an IO
    /// error when the peer cannot be reached.
    async fn send(&self, peer: &PeerId, message_type: &str, payload: &[u8]) -> Result<()>;

    /// Stop receiving and drop every pooled connection
    async fn close(&self) -> Result<()>;
}
