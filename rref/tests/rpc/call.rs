use rref::{codec, Call, RpcError};
use std::time::Duration;

use crate::{cluster, test_cfg};

#[tokio::test]
async fn sync_builtin() {
    crate::init();
    let cluster = cluster(2, test_cfg());
    let (a, b) = (&cluster.rpcs[0], &cluster.workers[1]);

    let ret = a.rpc_sync(b, Call::builtin("add", &(40i64, 2i64)).unwrap()).await.unwrap();
    let sum: i64 = codec::decode(&ret).unwrap();
    assert_eq!(sum, 42);

    let ret = a.rpc_sync(b, Call::udf("whoami", &()).unwrap()).await.unwrap();
    let name: String = codec::decode(&ret).unwrap();
    assert_eq!(name, "worker1");

    cluster.shutdown().await;
}

#[tokio::test]
async fn call_self() {
    crate::init();
    let cluster = cluster(2, test_cfg());
    let a = &cluster.rpcs[0];
    let me = a.worker_info().clone();

    let ret = a.rpc_sync(&me, Call::udf("square", &12i64).unwrap()).await.unwrap();
    let square: i64 = codec::decode(&ret).unwrap();
    assert_eq!(square, 144);

    let ret = a.rpc_sync(&me, Call::udf("whoami", &()).unwrap()).await.unwrap();
    assert_eq!(codec::decode::<String>(&ret).unwrap(), "worker0");

    cluster.shutdown().await;
}

#[tokio::test]
async fn async_out_of_order() {
    crate::init();
    let cluster = cluster(2, test_cfg());
    let (a, b) = (&cluster.rpcs[0], &cluster.workers[1]);

    let slow = a.rpc_async(b, Call::script("sleep_echo", &(500u64, 1i64)).unwrap());
    let fast = a.rpc_async(b, Call::script("sleep_echo", &(0u64, 2i64)).unwrap());

    let ret = fast.await.unwrap();
    assert_eq!(codec::decode::<i64>(&ret).unwrap(), 2);
    assert!(!slow.is_done());

    let ret = slow.await.unwrap();
    assert_eq!(codec::decode::<i64>(&ret).unwrap(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn blocking_wait() {
    crate::init();
    let cluster = cluster(2, test_cfg());
    let (a, b) = (&cluster.rpcs[0], &cluster.workers[1]);

    let fut = a.rpc_async(b, Call::udf("square", &9i64).unwrap());
    let ret = tokio::task::spawn_blocking(move || fut.wait()).await.unwrap().unwrap();
    assert_eq!(codec::decode::<i64>(&ret).unwrap(), 81);

    cluster.shutdown().await;
}

#[tokio::test]
async fn callbacks_and_then() {
    crate::init();
    let cluster = cluster(2, test_cfg());
    let (a, b) = (&cluster.rpcs[0], &cluster.workers[1]);

    let (tx, rx) = tokio::sync::oneshot::channel();
    let fut = a.rpc_async(b, Call::builtin("add", &(1i64, 2i64)).unwrap());
    fut.add_callback(move |res| {
        let _ = tx.send(res.clone());
    });
    let decoded = fut.then(|res| Ok(codec::decode::<i64>(&res?)?));

    assert_eq!(decoded.await.unwrap(), 3);
    let ret = rx.await.unwrap().unwrap();
    assert_eq!(codec::decode::<i64>(&ret).unwrap(), 3);

    cluster.shutdown().await;
}

#[tokio::test]
async fn unknown_function() {
    crate::init();
    let cluster = cluster(2, test_cfg());
    let (a, b) = (&cluster.rpcs[0], &cluster.workers[1]);

    match a.rpc_sync(b, Call::udf("no_such_function", &()).unwrap()).await {
        Err(RpcError::RemoteExecution(msg)) => assert!(msg.contains("no_such_function"), "{}", msg),
        other => panic!("unexpected result {:?}", other),
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn failing_function() {
    crate::init();
    let cluster = cluster(2, test_cfg());
    let (a, b) = (&cluster.rpcs[0], &cluster.workers[1]);

    let res = a.rpc_sync(b, Call::udf("fail", &"boom").unwrap()).await;
    assert_eq!(res, Err(RpcError::RemoteExecution("boom".into())));

    let res = a.rpc_sync(b, Call::builtin("add", &"not a pair").unwrap()).await;
    assert!(matches!(res, Err(RpcError::Deserialization(_))), "{:?}", res);

    cluster.shutdown().await;
}

#[tokio::test]
async fn timeout() {
    crate::init();
    let cfg = rref::Cfg {
        rpc_timeout: Duration::from_millis(200),
        shutdown_timeout: Duration::from_secs(1),
        ..test_cfg()
    };
    let cluster = cluster(2, cfg);
    let (a, b) = (&cluster.rpcs[0], &cluster.workers[1]);
    assert_eq!(a.rpc_timeout(), Duration::from_millis(200));

    let res = a.rpc_sync(b, Call::script("sleep_echo", &(2000u64, 0i64)).unwrap()).await;
    assert!(matches!(res, Err(RpcError::Transport(rref::TransportError::Timeout(_)))), "{:?}", res);
    assert_eq!(a.agent().in_flight(), 0);

    cluster.shutdown().await;
}
