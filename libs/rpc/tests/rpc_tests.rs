mod common;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{
    add, eventually, node, peer, sleeper, within, LIVENESS_BOUND, PING_INTERVAL, PING_TIMEOUT,
};
use constellation_fabric::codec::{BincodeCodec, Codec};
use constellation_fabric::transport::MemoryNetwork;
use constellation_fabric::{PacketHandler, Transport};
use constellation_rpc::{
    callable, CallId, Error, Failure, FailureKind, FunctionId, Kwargs, Message, RpcSystem, Value,
    MESSAGE_TYPE,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;

fn ints(values: &[i64]) -> Vec<Value> {
    values.iter().copied().map(Value::Int).collect()
}

#[tokio::test]
async fn local_call_skips_the_transport() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let id = a.publish(&add());

    let result = within(a.invoke(a.own_id(), id, ints(&[2, 3]), Kwargs::new())).await;
    assert_eq!(result.unwrap(), Value::Int(5));
    assert_eq!(a.pending_outbound(), 0);

    let stub = a.local_stub(&add());
    assert_eq!(stub.peer_id(), a.own_id());
    assert_eq!(within(stub.call_args(ints(&[4, 4]))).await.unwrap(), Value::Int(8));
}

#[tokio::test]
async fn local_call_to_unknown_function_fails_fast() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let missing = FunctionId::new();

    let err = a
        .invoke(a.own_id(), missing, vec![], Kwargs::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownFunction(id) if id == missing));
}

#[tokio::test]
async fn remote_add_then_peer_stops() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let b = node(&network, "b").await;

    let url = a.export_url(&add());
    let stub = b.create_stub(&url).unwrap();
    assert_eq!(stub.peer_id(), a.own_id());
    assert_eq!(within(stub.call_args(ints(&[2, 3]))).await.unwrap(), Value::Int(5));

    // A goes silent without its connections closing
    network.stall(a.own_id());
    let stalled = Instant::now();
    let err = within(stub.call_args(ints(&[2, 3]))).await.unwrap_err();
    assert!(err.is_lost_peer(), "unexpected error: {err}");
    assert!(
        stalled.elapsed() <= LIVENESS_BOUND,
        "detected after {:?}",
        stalled.elapsed()
    );
    assert_eq!(b.pending_outbound(), 0);
}

#[tokio::test]
async fn arguments_and_results_keep_their_shape() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let b = node(&network, "b").await;

    let echo = callable::from_fn(|args, kwargs| async move {
        Ok(Value::List(vec![Value::List(args), Value::Map(kwargs)]))
    });
    let stub = b.create_stub(&a.export_url(&echo)).unwrap();

    let args = vec![
        Value::Null,
        Value::Bool(true),
        Value::Int(-7),
        Value::Float(1.5),
        Value::from("text"),
        Value::Bytes(vec![0, 1, 255]),
        Value::List(ints(&[1, 2, 3])),
    ];
    let mut kwargs = Kwargs::new();
    kwargs.insert("mode".to_string(), Value::from("fast"));
    kwargs.insert(
        "nested".to_string(),
        Value::Map(BTreeMap::from([("depth".to_string(), Value::Int(2))])),
    );

    let result = within(stub.call(args.clone(), kwargs.clone())).await.unwrap();
    assert_eq!(result, Value::List(vec![Value::List(args), Value::Map(kwargs)]));
}

#[test]
fn calls_can_be_made_outside_the_runtime() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let network = MemoryNetwork::new();
    let a = runtime.block_on(node(&network, "a"));
    let b = runtime.block_on(node(&network, "b"));
    let stub = b.create_stub(&a.export_url(&add())).unwrap();

    // Issued from a thread with no runtime context
    let call = stub.call_args(ints(&[2, 3]));
    assert_eq!(runtime.block_on(within(call)).unwrap(), Value::Int(5));

    let pending = stub.call_args(ints(&[1, 1]));
    drop(pending);
    runtime.block_on(eventually(|| b.pending_outbound() == 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_are_correlated() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let b = node(&network, "b").await;

    // Later calls finish first
    let delayed = callable::from_fn(|args, _| async move {
        let n = args.first().and_then(Value::as_i64).unwrap_or_default();
        tokio::time::sleep(Duration::from_millis(((20 - n) * 3) as u64)).await;
        Ok(Value::Int(n))
    });
    let id = a.publish(&delayed);

    let mut calls = JoinSet::new();
    for n in 0..20 {
        let call = b.invoke(a.own_id(), id, ints(&[n]), Kwargs::new());
        calls.spawn(async move { (n, call.await) });
    }
    assert_eq!(b.pending_outbound(), 20);

    within(async {
        while let Some(joined) = calls.join_next().await {
            let (n, result) = joined.unwrap();
            assert_eq!(result.unwrap(), Value::Int(n));
        }
    })
    .await;
    assert_eq!(b.pending_outbound(), 0);
    eventually(|| a.pending_inbound() == 0).await;
}

#[tokio::test]
async fn remote_failure_is_not_a_lost_peer() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let b = node(&network, "b").await;

    let boom = callable::from_fn(|_, _| async move { Err(Failure::execution("boom")) });
    let stub = b.create_stub(&a.export_url(&boom)).unwrap();

    let err = within(stub.call_args(vec![])).await.unwrap_err();
    assert!(!err.is_lost_peer());
    let failure = err.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Execution);
    assert_eq!(failure.message, "boom");

    let add = b.create_stub(&a.export_url(&add())).unwrap();
    let err = within(add.call_args(vec![Value::from("two"), Value::from("three")]))
        .await
        .unwrap_err();
    assert_eq!(err.failure().unwrap().kind, FailureKind::InvalidArguments);
}

#[tokio::test]
async fn cancel_stops_remote_execution() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let b = node(&network, "b").await;

    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();
    let slow = callable::from_fn(move |_, _| {
        let flag = flag.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(Value::Null)
        }
    });
    let stub = b.create_stub(&a.export_url(&slow)).unwrap();

    let mut call = stub.call_args(vec![]);
    eventually(|| a.pending_inbound() == 1).await;

    assert!(call.cancel());
    assert!(!call.cancel());
    assert_eq!(b.pending_outbound(), 0);
    assert!(matches!(call.await, Err(Error::Cancelled)));

    eventually(|| a.pending_inbound() == 0).await;
    assert!(!finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn cancel_after_completion_is_a_no_op() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let b = node(&network, "b").await;
    let stub = b.create_stub(&a.export_url(&add())).unwrap();

    let mut call = stub.call_args(ints(&[1, 1]));
    assert_eq!(within(&mut call).await.unwrap(), Value::Int(2));
    assert!(!call.cancel());
    assert_eq!(b.pending_outbound(), 0);
}

#[tokio::test]
async fn dropping_a_call_cancels_it() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let b = node(&network, "b").await;
    let id = a.publish(&sleeper());

    let call = b.invoke(a.own_id(), id, ints(&[30_000]), Kwargs::new());
    eventually(|| a.pending_inbound() == 1).await;

    drop(call);
    assert_eq!(b.pending_outbound(), 0);
    eventually(|| a.pending_inbound() == 0).await;
}

#[tokio::test]
async fn disconnected_peer_is_detected() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let b = node(&network, "b").await;
    let id = a.publish(&sleeper());

    let call = b.invoke(a.own_id(), id, ints(&[30_000]), Kwargs::new());
    eventually(|| a.pending_inbound() == 1).await;
    network.disconnect(a.own_id());
    let disconnected = Instant::now();

    match within(call).await {
        Err(Error::LostPeer { peer, .. }) => assert_eq!(&peer, a.own_id()),
        other => panic!("expected lost peer, got {other:?}"),
    }
    assert!(
        disconnected.elapsed() <= LIVENESS_BOUND,
        "detected after {:?}",
        disconnected.elapsed()
    );
    assert_eq!(b.pending_outbound(), 0);
}

#[tokio::test]
async fn unknown_remote_function_surfaces_as_lost_peer() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let b = node(&network, "b").await;

    let stub = b.stub(a.own_id().clone(), FunctionId::new());
    let err = within(stub.call_args(vec![])).await.unwrap_err();
    assert!(err.is_lost_peer(), "unexpected error: {err}");
    assert_eq!(a.pending_inbound(), 0);
}

#[tokio::test]
async fn unpublished_function_is_rejected() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let b = node(&network, "b").await;

    let id = a.publish(&add());
    let stub = b.stub(a.own_id().clone(), id);
    assert_eq!(within(stub.call_args(ints(&[1, 2]))).await.unwrap(), Value::Int(3));

    assert!(a.unpublish(&id));
    assert!(!a.unpublish(&id));
    assert!(!a.unpublish(&FunctionId::ping()));

    let err = within(stub.call_args(ints(&[1, 2]))).await.unwrap_err();
    assert!(err.is_lost_peer());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pings_keep_slow_calls_alive() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let b = node(&network, "b").await;
    let id = a.publish(&sleeper());

    // Spans several monitor iterations
    let millis = ((PING_INTERVAL + PING_TIMEOUT) * 4).as_millis() as i64;
    let result = within(b.invoke(a.own_id(), id, ints(&[millis]), Kwargs::new())).await;
    assert_eq!(result.unwrap(), Value::Int(millis));
}

#[tokio::test]
async fn unserializable_result_becomes_a_failure() {
    let network = MemoryNetwork::new();
    let a = RpcSystem::builder(network.transport(peer("a")))
        .ping_interval(PING_INTERVAL)
        .ping_timeout(PING_TIMEOUT)
        .codec(BincodeCodec::with_limit(1024))
        .build();
    a.open().await.unwrap();
    let b = node(&network, "b").await;

    let big = callable::from_fn(|_, _| async move { Ok(Value::from("x".repeat(4096))) });
    let stub = b.create_stub(&a.export_url(&big)).unwrap();

    let err = within(stub.call_args(vec![])).await.unwrap_err();
    assert_eq!(err.failure().unwrap().kind, FailureKind::Serialization);
    eventually(|| a.pending_inbound() == 0).await;
}

#[tokio::test]
async fn send_failure_is_reported_immediately() {
    let network = MemoryNetwork::new();
    let b = node(&network, "b").await;

    let err = within(b.invoke(&peer("nowhere"), FunctionId::new(), vec![], Kwargs::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "unexpected error: {err}");
    assert_eq!(b.pending_outbound(), 0);
}

#[tokio::test]
async fn stale_and_malformed_packets_are_ignored() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let b = node(&network, "b").await;

    let rogue = network.transport(peer("rogue"));
    rogue
        .open(Arc::new(|_: constellation_rpc::PeerId, _: &str, _: Vec<u8>| {}))
        .await
        .unwrap();
    let codec = BincodeCodec::new();
    let replies = [
        Message::CallReturn {
            call_id: CallId::new(),
            value: Value::Int(1),
        },
        Message::CallFail {
            call_id: CallId::new(),
            failure: Failure::execution("nobody asked"),
        },
        Message::CallCancel {
            call_id: CallId::new(),
        },
    ];
    for reply in &replies {
        let payload = codec.encode(reply).unwrap();
        rogue.send(a.own_id(), MESSAGE_TYPE, &payload).await.unwrap();
    }
    rogue
        .send(a.own_id(), MESSAGE_TYPE, &[0xff, 0xfe, 0xfd])
        .await
        .unwrap();
    rogue
        .send(a.own_id(), "something.else", b"not for rpc")
        .await
        .unwrap();

    let stub = a.create_stub(&b.export_url(&add())).unwrap();
    assert_eq!(within(stub.call_args(ints(&[20, 22]))).await.unwrap(), Value::Int(42));
    assert_eq!(a.pending_outbound(), 0);
    assert_eq!(a.pending_inbound(), 0);
}

#[tokio::test]
async fn raw_peer_speaks_the_wire_protocol() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let id = a.publish(&sleeper());

    let raw = network.transport(peer("raw"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler: PacketHandler = Arc::new(
        move |_: constellation_rpc::PeerId, message_type: &str, payload: Vec<u8>| {
            assert_eq!(message_type, MESSAGE_TYPE);
            let _ = tx.send(payload);
        },
    );
    raw.open(handler).await.unwrap();

    let codec = BincodeCodec::new();
    let call_id = CallId::new();
    let call = codec
        .encode(&Message::Call {
            call_id,
            function_id: id,
            args: ints(&[50]),
            kwargs: Kwargs::new(),
        })
        .unwrap();
    // The duplicate is dropped while the first is executing
    raw.send(a.own_id(), MESSAGE_TYPE, &call).await.unwrap();
    raw.send(a.own_id(), MESSAGE_TYPE, &call).await.unwrap();

    let payload = within(rx.recv()).await.unwrap();
    match codec.decode::<Message>(&payload).unwrap() {
        Message::CallReturn { call_id: id, value } => {
            assert_eq!(id, call_id);
            assert_eq!(value, Value::Int(50));
        }
        other => panic!("expected a return, got {other:?}"),
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn close_fails_pending_calls() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let b = node(&network, "b").await;
    let id = a.publish(&sleeper());

    let call = b.invoke(a.own_id(), id, ints(&[30_000]), Kwargs::new());
    eventually(|| a.pending_inbound() == 1).await;

    b.close().await.unwrap();
    assert!(!b.is_open());
    assert!(matches!(within(call).await, Err(Error::Closed)));
    assert_eq!(b.pending_outbound(), 0);

    assert!(matches!(
        b.invoke(a.own_id(), id, vec![], Kwargs::new()).await,
        Err(Error::NotOpen)
    ));
    assert!(matches!(b.close().await, Err(Error::NotOpen)));
    assert!(matches!(b.open().await, Err(Error::Closed)));

    a.close().await.unwrap();
    assert_eq!(a.pending_inbound(), 0);
}

#[tokio::test]
async fn lifecycle_is_enforced() {
    let network = MemoryNetwork::new();
    let a = RpcSystem::new(network.transport(peer("a")), PING_INTERVAL, PING_TIMEOUT);
    assert!(!a.is_open());
    assert_eq!(a.config().ping_interval, PING_INTERVAL);
    assert_eq!(a.config().ping_timeout, PING_TIMEOUT);

    let id = a.publish(&add());
    assert!(matches!(
        a.invoke(a.own_id(), id, ints(&[1, 2]), Kwargs::new()).await,
        Err(Error::NotOpen)
    ));
    assert!(matches!(a.close().await, Err(Error::NotOpen)));

    a.open().await.unwrap();
    assert!(a.is_open());
    assert!(matches!(a.open().await, Err(Error::AlreadyOpen)));
}

#[tokio::test]
async fn open_fails_when_the_transport_does() {
    let network = MemoryNetwork::new();
    let _a = node(&network, "a").await;

    // Same peer id is already taken on this network
    let twin = RpcSystem::new(network.transport(peer("a")), PING_INTERVAL, PING_TIMEOUT);
    assert!(matches!(twin.open().await, Err(Error::Transport(_))));
    assert!(!twin.is_open());
}

#[tokio::test]
async fn malformed_descriptors_are_rejected() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;

    let id = FunctionId::new();
    for descriptor in [
        "".to_string(),
        "nonsense".to_string(),
        format!("http://a/{id}"),
        "constellation+rpc://a/not-a-uuid".to_string(),
        format!("constellation+rpc:///{id}"),
    ] {
        assert!(
            matches!(a.create_stub(&descriptor), Err(Error::InvalidDescriptor(_))),
            "accepted {descriptor:?}"
        );
    }
}

#[tokio::test]
async fn export_is_idempotent_and_stubs_compare_by_target() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let b = node(&network, "b").await;

    let add = add();
    let url = a.export_url(&add);
    assert_eq!(a.export_url(&add), url);
    assert_eq!(a.publish(&add).to_string(), url.rsplit('/').next().unwrap());

    let from_a = a.create_stub(&url).unwrap();
    let from_b = b.create_stub(&url).unwrap();
    assert_eq!(from_a, from_b);
    assert_eq!(b.export_stub_url(&from_b), url);
    assert_eq!(HashSet::from([from_a, from_b]).len(), 1);
}

#[tokio::test]
async fn stub_outliving_its_system_fails() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a").await;
    let b = node(&network, "b").await;
    let stub = b.create_stub(&a.export_url(&add())).unwrap();

    drop(b);
    assert!(matches!(
        stub.call_args(ints(&[1, 2])).await,
        Err(Error::SystemDropped)
    ));
}
