use constellation_core::PeerId;
use thiserror::Error;

use crate::failure::Failure;
use crate::ids::{CallId, FunctionId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] constellation_fabric::Error),

    /// The invoked function itself failed
    #[error("Call failed: {0}")]
    Failed(Failure),

    /// The peer stopped answering liveness pings for this call
    #[error("Lost communication to peer {peer} during call {call_id}")]
    LostPeer { peer: PeerId, call_id: CallId },

    #[error("Call cancelled")]
    Cancelled,

    #[error("RPC system closed")]
    Closed,

    #[error("RPC system is not open")]
    NotOpen,

    #[error("RPC system is already open")]
    AlreadyOpen,

    #[error("RPC system must be opened inside a Tokio runtime")]
    NoRuntime,

    #[error("RPC system has been dropped")]
    SystemDropped,

    #[error("No default RPC system configured")]
    NoDefaultSystem,

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(FunctionId),

    #[error("Codec error: {0}")]
    Codec(String),
}

impl Error {
    /// Whether this error means the peer was lost rather than the call failing
    pub fn is_lost_peer(&self) -> bool {
        matches!(self, Error::LostPeer { .. })
    }

    /// The remote failure description, if the function itself failed
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Error::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
