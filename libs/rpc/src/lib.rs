//! Constellation RPC - Remote procedure calls over the fabric
//!
//! Lets a node publish local functions for remote peers and call functions
//! published by them, over any [`Transport`](constellation_fabric::Transport).
//!
//! * [`RpcSystem`] owns the function registry, correlates replies with the
//!   calls that are waiting for them and runs the liveness monitor.
//! * [`RemoteFunctionStub`] is a local proxy for a function on some peer;
//!   stubs travel inside call arguments and results.
//! * [`RemoteCall`] is the pending result of an invocation; dropping or
//!   cancelling it tells the peer to stop.
//!
//! Calls carry no timeout of their own. Instead, every outstanding call is
//! periodically pinged on its peer; a peer that is unreachable or no longer
//! knows the call makes the call fail with [`Error::LostPeer`].

pub mod call;
pub mod callable;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod failure;
pub mod ids;
pub mod message;
mod monitor;
mod pending;
pub mod registry;
pub mod stub;
pub mod system;
pub mod value;

// Re-exports for convenience
pub use call::RemoteCall;
pub use callable::{CallResult, Callable};
pub use config::{RpcConfig, RpcSystemBuilder};
pub use descriptor::Descriptor;
pub use error::{Error, Result};
pub use failure::{Failure, FailureKind};
pub use ids::{CallId, CallKey, FunctionId};
pub use message::{Message, MESSAGE_TYPE};
pub use stub::{clear_default, set_default, RemoteFunctionStub};
pub use system::RpcSystem;
pub use value::{Args, Kwargs, Value};

pub use constellation_core::PeerId;
