//! Constellation Fabric - Low-level transport and codec layer
//!
//! Provides the message-oriented [`Transport`] abstraction (a pool of peer
//! connections that delivers typed byte packets), a TCP implementation with
//! length-prefix framing, an in-memory network for tests, and codec support
//! (bincode) for payloads.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use constellation_fabric::transport::{TcpTransport, Transport};
//! use constellation_fabric::PeerId;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = TcpTransport::bind("127.0.0.1:0".parse()?).await?;
//! transport
//!     .open(Arc::new(|peer: PeerId, message_type: &str, payload: Vec<u8>| {
//!         println!("{peer} sent {} bytes of {message_type}", payload.len());
//!     }))
//!     .await?;
//!
//! let remote: PeerId = "127.0.0.1:9000".parse()?;
//! transport.send(&remote, "greeting", b"hello").await?;
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod transport;

// Re-exports for convenience
pub use constellation_core::PeerId;
pub use error::{Error, Result};
pub use transport::{PacketHandler, Transport};
