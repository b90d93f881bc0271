#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use constellation_fabric::transport::MemoryNetwork;
use constellation_rpc::{callable, Callable, Failure, PeerId, RpcSystem, Value};

/// Fast liveness settings so lost peers surface within a test's patience
pub const PING_INTERVAL: Duration = Duration::from_millis(50);
pub const PING_TIMEOUT: Duration = Duration::from_millis(100);

/// How long a silent peer may go unnoticed: a monitor round already in
/// flight, a full interval, then the ping that times out
pub const LIVENESS_BOUND: Duration = Duration::from_millis(
    (2 * PING_INTERVAL.as_millis() + 2 * PING_TIMEOUT.as_millis()) as u64 + 250,
);

/// Upper bound on how long anything in these tests should take
pub const PATIENCE: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn peer(id: &str) -> PeerId {
    PeerId::new(id).unwrap()
}

/// An opened system attached to `network` as `id`
pub async fn node(network: &MemoryNetwork, id: &str) -> RpcSystem {
    init_tracing();
    let system = RpcSystem::new(network.transport(peer(id)), PING_INTERVAL, PING_TIMEOUT);
    system.open().await.unwrap();
    system
}

/// Await `fut`, failing the test if it hangs
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(PATIENCE, fut)
        .await
        .expect("operation did not finish in time")
}

/// Poll `condition` until it holds, failing the test if it never does
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

pub fn add() -> Arc<dyn Callable> {
    callable::from_fn(|args, _kwargs| async move {
        match (
            args.first().and_then(Value::as_i64),
            args.get(1).and_then(Value::as_i64),
        ) {
            (Some(a), Some(b)) => Ok(Value::Int(a + b)),
            _ => Err(Failure::invalid_arguments("add expects two integers")),
        }
    })
}

/// Sleeps for the given number of milliseconds, then returns it
pub fn sleeper() -> Arc<dyn Callable> {
    callable::from_fn(|args, _kwargs| async move {
        let millis = args
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| Failure::invalid_arguments("sleeper expects milliseconds"))?;
        tokio::time::sleep(Duration::from_millis(millis as u64)).await;
        Ok(Value::Int(millis))
    })
}
