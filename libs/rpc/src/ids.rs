use std::fmt;
use std::str::FromStr;

use constellation_core::PeerId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for reserved function ids.
///
/// Reserved ids are version-5 UUIDs derived from this namespace, while
/// published functions always get random version-4 ids, so the two id
/// spaces can never overlap.
const RESERVED_NAMESPACE: Uuid = Uuid::from_u128(0x6c6f_7374_2d63_6f6e_7374_656c_6c61_7469);

const PING_NAME: &str = "constellation.rpc.ping";

/// Identifier of a published function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionId(Uuid);

impl FunctionId {
    /// Mint a fresh id for a user function
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Well-known id for a reserved runtime function
    pub fn reserved(name: &str) -> Self {
        Self(Uuid::new_v5(&RESERVED_NAMESPACE, name.as_bytes()))
    }

    /// Id of the liveness ping every system answers
    pub fn ping() -> Self {
        Self::reserved(PING_NAME)
    }

    pub fn is_reserved(&self) -> bool {
        self.0.get_version_num() == 5
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FunctionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for FunctionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Correlation id of a single call, minted by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CallId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Key of both pending-call tables: the remote side of the call plus its id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub peer: PeerId,
    pub call_id: CallId,
}

impl CallKey {
    pub fn new(peer: PeerId, call_id: CallId) -> Self {
        Self { peer, call_id }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.peer, self.call_id)
    }
}
