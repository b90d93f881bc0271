use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use constellation_core::PeerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::codec::{BincodeCodec, Codec};
use crate::error::{Error, Result};
use crate::transport::{PacketHandler, Transport};

/// Largest frame accepted by default (100MB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Unit of data on a pooled connection
///
/// Every outbound connection starts with a `Hello` naming the sender's own
/// peer id, since the socket's source address is an ephemeral port.
#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Hello {
        peer_id: PeerId,
    },
    Packet {
        message_type: String,
        payload: Vec<u8>,
    },
}

type Connection = Arc<tokio::sync::Mutex<TcpStream>>;

/// TCP connection pool keyed by peer id, with length-prefix framing
///
/// The transport's own id is its listen address. Outbound connections are
/// opened lazily on first send and reused; packets from remote peers arrive
/// on the connections they opened to us. Frames carry a 4-byte big-endian
/// length prefix.
pub struct TcpTransport {
    own_id: PeerId,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    connections: Mutex<HashMap<PeerId, Connection>>,
    shutdown: Mutex<Option<CancellationToken>>,
    connect_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    max_frame_len: usize,
}

impl TcpTransport {
    /// Bind to a local address with default settings
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Self::builder().address(addr).bind().await
    }

    /// Create a builder for configuring the transport
    pub fn builder() -> TcpTransportBuilder {
        TcpTransportBuilder::new()
    }

    /// Get the local address this transport listens on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of pooled outbound connections
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    async fn connection(&self, peer: &PeerId) -> Result<Connection> {
        if let Some(conn) = self.connections.lock().get(peer) {
            return Ok(conn.clone());
        }

        let connect_op = TcpStream::connect(peer.as_str());
        let connected = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect_op)
                .await
                .map_err(|_| Error::Custom("Connect timeout exceeded".to_string()))?,
            None => connect_op.await,
        };
        let mut stream = connected.map_err(|e| {
            tracing::debug!(peer = %peer, error = %e, "connect failed");
            Error::Unreachable(peer.clone())
        })?;

        let hello = BincodeCodec::new().encode(&Frame::Hello {
            peer_id: self.own_id.clone(),
        })?;
        write_frame(&mut stream, &hello, self.max_frame_len).await?;

        let conn = Arc::new(tokio::sync::Mutex::new(stream));
        let conn = self
            .connections
            .lock()
            .entry(peer.clone())
            .or_insert(conn)
            .clone();
        Ok(conn)
    }

    fn evict(&self, peer: &PeerId, conn: &Connection) {
        let mut connections = self.connections.lock();
        if connections
            .get(peer)
            .is_some_and(|pooled| Arc::ptr_eq(pooled, conn))
        {
            connections.remove(peer);
        }
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn own_id(&self) -> &PeerId {
        &self.own_id
    }

    async fn open(&self, handler: PacketHandler) -> Result<()> {
        if self.shutdown.lock().is_some() {
            return Err(Error::AlreadyOpen);
        }
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| Error::Custom("Transport cannot be reopened after close".to_string()))?;

        let token = CancellationToken::new();
        *self.shutdown.lock() = Some(token.clone());

        let max_frame_len = self.max_frame_len;
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(serve_connection(
                            stream,
                            addr,
                            handler.clone(),
                            token.child_token(),
                            max_frame_len,
                        ));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
            tracing::debug!("accept loop stopped");
        });

        tracing::debug!(peer = %self.own_id, "tcp transport open");
        Ok(())
    }

    async fn send(&self, peer: &PeerId, message_type: &str, payload: &[u8]) -> Result<()> {
        if self.shutdown.lock().is_none() {
            return Err(Error::NotOpen);
        }

        let frame = BincodeCodec::new().encode(&Frame::Packet {
            message_type: message_type.to_string(),
            payload: payload.to_vec(),
        })?;
        let conn = self.connection(peer).await?;

        let result = {
            let mut stream = conn.lock().await;
            let send_op = write_frame(&mut *stream, &frame, self.max_frame_len);
            match self.send_timeout {
                Some(timeout) => tokio::time::timeout(timeout, send_op)
                    .await
                    .map_err(|_| Error::Custom("Send timeout exceeded".to_string()))
                    .and_then(|sent| sent),
                None => send_op.await,
            }
        };

        if let Err(e) = &result {
            tracing::debug!(peer = %peer, error = %e, "send failed, dropping connection");
            self.evict(peer, &conn);
        }
        result
    }

    async fn close(&self) -> Result<()> {
        let token = self.shutdown.lock().take().ok_or(Error::NotOpen)?;
        token.cancel();

        let connections: Vec<Connection> = self
            .connections
            .lock()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            // Peer may already be gone
            let _ = conn.lock().await.shutdown().await;
        }

        tracing::debug!(peer = %self.own_id, "tcp transport closed");
        Ok(())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(token) = self.shutdown.get_mut().take() {
            token.cancel();
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    handler: PacketHandler,
    token: CancellationToken,
    max_frame_len: usize,
) {
    tokio::select! {
        _ = token.cancelled() => {}
        result = read_packets(&mut stream, &handler, max_frame_len) => match result {
            Err(Error::ConnectionClosed) => {
                tracing::debug!(addr = %addr, "connection closed by peer");
            }
            Err(e) => tracing::warn!(addr = %addr, error = %e, "dropping connection"),
            Ok(()) => {}
        },
    }
}

async fn read_packets(
    stream: &mut TcpStream,
    handler: &PacketHandler,
    max_frame_len: usize,
) -> Result<()> {
    let codec = BincodeCodec::new();

    let peer = match codec.decode::<Frame>(&read_frame(stream, max_frame_len).await?)? {
        Frame::Hello { peer_id } => peer_id,
        Frame::Packet { .. } => {
            return Err(Error::InvalidFrame("expected hello frame".to_string()));
        }
    };
    tracing::trace!(peer = %peer, "accepted connection");

    loop {
        match codec.decode::<Frame>(&read_frame(stream, max_frame_len).await?)? {
            Frame::Packet {
                message_type,
                payload,
            } => handler(peer.clone(), &message_type, payload),
            Frame::Hello { .. } => {
                return Err(Error::InvalidFrame("unexpected hello frame".to_string()));
            }
        }
    }
}

async fn write_frame<W>(writer: &mut W, bytes: &[u8], max_frame_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if bytes.len() > max_frame_len {
        return Err(Error::InvalidFrame(format!(
            "Message too large: {} bytes",
            bytes.len()
        )));
    }

    // Write length prefix (4 bytes, big-endian)
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R>(reader: &mut R, max_frame_len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await.map_err(closed_on_eof)? as usize;

    if len > max_frame_len {
        return Err(Error::InvalidFrame(format!(
            "Message too large: {} bytes",
            len
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(closed_on_eof)?;
    Ok(buf)
}

fn closed_on_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        e.into()
    }
}

/// Builder for configuring TCP transport
#[derive(Default)]
pub struct TcpTransportBuilder {
    address: Option<SocketAddr>,
    connect_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    max_frame_len: Option<usize>,
}

impl TcpTransportBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address to listen on
    pub fn address(mut self, addr: SocketAddr) -> Self {
        self.address = Some(addr);
        self
    }

    /// Set the timeout for opening connections to peers
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the send timeout
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Set the largest frame accepted in either direction
    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = Some(len);
        self
    }

    /// Bind the listener with the configured settings
    ///
    /// The transport's peer id is the bound address, so binding port 0
    /// yields the OS-assigned port.
    pub async fn bind(self) -> Result<TcpTransport> {
        let addr = self
            .address
            .ok_or_else(|| Error::Custom("Address not set".to_string()))?;

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(TcpTransport {
            own_id: PeerId::from(local_addr),
            local_addr,
            listener: Mutex::new(Some(listener)),
            connections: Mutex::new(HashMap::new()),
            shutdown: Mutex::new(None),
            connect_timeout: self.connect_timeout,
            send_timeout: self.send_timeout,
            max_frame_len: self.max_frame_len.unwrap_or(DEFAULT_MAX_FRAME_LEN),
        })
    }
}
