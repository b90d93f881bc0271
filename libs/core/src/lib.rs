//! Constellation Core - Shared identifiers and errors
//!
//! Types shared by every constellation library, most importantly [`PeerId`],
//! the opaque key that names a reachable node on the fabric.

pub mod error;
pub mod peer;

pub use error::{Error, Result};
pub use peer::PeerId;
