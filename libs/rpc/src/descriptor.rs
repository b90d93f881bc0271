use std::fmt;
use std::str::FromStr;

use constellation_core::PeerId;

use crate::error::{Error, Result};
use crate::ids::FunctionId;

/// URL scheme of exported function descriptors
pub const SCHEME: &str = "constellation+rpc";

/// Out-of-band address of a published function: `constellation+rpc://<peer>/<function id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub peer_id: PeerId,
    pub function_id: FunctionId,
}

impl Descriptor {
    pub fn new(peer_id: PeerId, function_id: FunctionId) -> Self {
        Self {
            peer_id,
            function_id,
        }
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", SCHEME, self.peer_id, self.function_id)
    }
}

impl FromStr for Descriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(SCHEME)
            .and_then(|rest| rest.strip_prefix("://"))
            .ok_or_else(|| Error::InvalidDescriptor(format!("{:?} is not a {} url", s, SCHEME)))?;

        let (peer, function) = rest
            .split_once('/')
            .ok_or_else(|| Error::InvalidDescriptor(format!("{:?} has no function id", s)))?;

        let peer_id = PeerId::new(peer).map_err(|e| Error::InvalidDescriptor(e.to_string()))?;
        let function_id = function.parse().map_err(|e: uuid::Error| {
            Error::InvalidDescriptor(format!("bad function id {:?}: {}", function, e))
        })?;

        Ok(Self {
            peer_id,
            function_id,
        })
    }
}
