//! Remote function stubs and the process-wide default system.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Weak;

use constellation_core::PeerId;
use constellation_fabric::codec::Codec;
use parking_lot::RwLock;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::call::RemoteCall;
use crate::descriptor::Descriptor;
use crate::error::Error;
use crate::ids::FunctionId;
use crate::system::RpcSystem;
use crate::value::{Args, Kwargs};

/// What a stub needs from the system that owns it
pub(crate) trait Invoker: Send + Sync {
    fn invoke(
        &self,
        peer: PeerId,
        function_id: FunctionId,
        args: Args,
        kwargs: Kwargs,
    ) -> RemoteCall;
}

/// System that decoded stubs attach to.
///
/// Set once at startup by the embedding application; replacing it while
/// stubs from the previous default are alive leaves those stubs bound to the
/// old system.
static DEFAULT_SYSTEM: RwLock<Option<Weak<dyn Invoker>>> = parking_lot::const_rwlock(None);

/// Make `system` the one stubs attach to when they are deserialized
pub fn set_default<C: Codec + 'static>(system: &RpcSystem<C>) {
    *DEFAULT_SYSTEM.write() = Some(system.invoker());
}

pub fn clear_default() {
    *DEFAULT_SYSTEM.write() = None;
}

fn default_system() -> Option<Weak<dyn Invoker>> {
    DEFAULT_SYSTEM
        .read()
        .as_ref()
        .filter(|system| system.strong_count() > 0)
        .cloned()
}

/// Local proxy for a function published by some peer
///
/// Calling the stub is shorthand for `system.invoke(peer, function, ..)` on
/// the system it is bound to. Stubs compare equal when they name the same
/// (peer, function) pair, whichever system they are bound to. On the wire a
/// stub is just that pair.
#[derive(Clone)]
pub struct RemoteFunctionStub {
    peer_id: PeerId,
    function_id: FunctionId,
    system: Weak<dyn Invoker>,
}

impl RemoteFunctionStub {
    pub(crate) fn new(peer_id: PeerId, function_id: FunctionId, system: Weak<dyn Invoker>) -> Self {
        Self {
            peer_id,
            function_id,
            system,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn function_id(&self) -> FunctionId {
        self.function_id
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(self.peer_id.clone(), self.function_id)
    }

    /// Descriptor string that resolves back to this function
    pub fn url(&self) -> String {
        self.descriptor().to_string()
    }

    /// Invoke the remote function
    pub fn call(&self, args: Args, kwargs: Kwargs) -> RemoteCall {
        match self.system.upgrade() {
            Some(system) => system.invoke(self.peer_id.clone(), self.function_id, args, kwargs),
            None => RemoteCall::ready(Err(Error::SystemDropped)),
        }
    }

    /// Invoke with positional arguments only
    pub fn call_args(&self, args: Args) -> RemoteCall {
        self.call(args, Kwargs::new())
    }
}

impl PartialEq for RemoteFunctionStub {
    fn eq(&self, other: &Self) -> bool {
        self.peer_id == other.peer_id && self.function_id == other.function_id
    }
}

impl Eq for RemoteFunctionStub {}

impl Hash for RemoteFunctionStub {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer_id.hash(state);
        self.function_id.hash(state);
    }
}

impl fmt::Debug for RemoteFunctionStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFunctionStub")
            .field("peer_id", &self.peer_id)
            .field("function_id", &self.function_id)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct StubRepr {
    peer_id: PeerId,
    function_id: FunctionId,
}

impl Serialize for RemoteFunctionStub {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        StubRepr {
            peer_id: self.peer_id.clone(),
            function_id: self.function_id,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RemoteFunctionStub {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = StubRepr::deserialize(deserializer)?;
        let system = default_system().ok_or_else(|| D::Error::custom(Error::NoDefaultSystem))?;
        Ok(Self::new(repr.peer_id, repr.function_id, system))
    }
}
