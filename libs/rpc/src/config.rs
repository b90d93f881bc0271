use std::sync::Arc;
use std::time::Duration;

use constellation_fabric::codec::{BincodeCodec, Codec};
use constellation_fabric::Transport;

use crate::system::RpcSystem;

/// Default delay between liveness monitor iterations
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Default time a peer gets to answer a liveness ping
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Runtime settings of an [`RpcSystem`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcConfig {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }
}

/// Builder for configuring an RPC system
pub struct RpcSystemBuilder<C = BincodeCodec> {
    transport: Arc<dyn Transport>,
    codec: C,
    ping_interval: Option<Duration>,
    ping_timeout: Option<Duration>,
}

impl RpcSystemBuilder<BincodeCodec> {
    /// Create a new builder over `transport`, using bincode for payloads
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::shared(Arc::new(transport))
    }

    /// Create a builder over a transport that is also used elsewhere
    pub fn shared(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            codec: BincodeCodec::default(),
            ping_interval: None,
            ping_timeout: None,
        }
    }
}

impl<C: Codec + 'static> RpcSystemBuilder<C> {
    /// Set the delay between liveness monitor iterations
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    /// Set how long a peer gets to answer a liveness ping
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = Some(timeout);
        self
    }

    /// Apply every setting from `config`
    pub fn config(self, config: RpcConfig) -> Self {
        self.ping_interval(config.ping_interval)
            .ping_timeout(config.ping_timeout)
    }

    /// Use a different payload codec
    pub fn codec<D: Codec + 'static>(self, codec: D) -> RpcSystemBuilder<D> {
        RpcSystemBuilder {
            transport: self.transport,
            codec,
            ping_interval: self.ping_interval,
            ping_timeout: self.ping_timeout,
        }
    }

    /// Build the system; it still has to be opened
    pub fn build(self) -> RpcSystem<C> {
        let defaults = RpcConfig::default();
        let config = RpcConfig {
            ping_interval: self.ping_interval.unwrap_or(defaults.ping_interval),
            ping_timeout: self.ping_timeout.unwrap_or(defaults.ping_timeout),
        };
        RpcSystem::from_parts(self.transport, self.codec, config)
    }
}
