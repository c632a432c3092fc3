use bytes::Bytes;
use futures::{
    future::{self, join_all},
    FutureExt,
};
use rref::{
    agent::{mem::MemNetwork, GroupAgent, HandlerFuture, LinkEvent, RequestHandler, RpcAgent, Transport},
    msg::{Message, MessageType},
    Call, Cfg, RpcError, TransportError, WorkerInfo,
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{cluster, eventually, test_cfg};

/// Answers every request with its payload.
#[derive(Default)]
struct Echo {
    lost: AtomicUsize,
}

impl RequestHandler for Echo {
    fn handle(&self, _src: &WorkerInfo, request: Message) -> HandlerFuture {
        future::ready(Message::new(MessageType::BuiltinRet, request.payload)).boxed()
    }

    fn peer_lost(&self, _worker: &WorkerInfo) {
        self.lost.fetch_add(1, Ordering::SeqCst);
    }
}

fn workers(n: u32) -> Vec<WorkerInfo> {
    (0..n).map(|id| WorkerInfo::new(format!("worker{}", id), id).unwrap()).collect()
}

#[tokio::test]
async fn worker_lookup() {
    crate::init();
    let cluster = cluster(3, test_cfg());
    let a = &cluster.rpcs[0];

    assert_eq!(a.get_worker_info("worker2").unwrap(), cluster.workers[2]);
    assert_eq!(a.agent().get_worker_info_by_id(1).unwrap(), cluster.workers[1]);
    assert_eq!(a.agent().workers(), cluster.workers);
    assert_eq!(a.get_worker_info("ghost"), Err(RpcError::UnknownWorker("ghost".into())));
    assert_eq!(a.agent().get_worker_info_by_id(9), Err(RpcError::UnknownWorker("9".into())));

    let ghost = WorkerInfo::new("ghost", 9).unwrap();
    let res = a.rpc_sync(&ghost, Call::udf("square", &1i64).unwrap()).await;
    assert_eq!(res, Err(RpcError::UnknownWorker("9".into())));

    cluster.shutdown().await;
}

#[tokio::test]
async fn sync_barrier() {
    crate::init();
    let cluster = cluster(4, test_cfg());

    for _ in 0..3 {
        for result in join_all(cluster.rpcs.iter().map(|rpc| rpc.agent().sync())).await {
            result.unwrap();
        }
    }

    // Waits for outstanding requests before arriving.
    let pending = cluster.rpcs[1].rpc_async(&cluster.workers[2], Call::script("sleep_echo", &(200u64, 7i64)).unwrap());
    for result in join_all(cluster.rpcs.iter().map(|rpc| rpc.agent().sync())).await {
        result.unwrap();
    }
    assert!(pending.is_done());

    cluster.shutdown().await;
}

#[tokio::test]
async fn join_without_coordinator() {
    crate::init();
    let cluster = cluster(3, test_cfg());
    let (b, c) = (&cluster.rpcs[1], &cluster.rpcs[2]);

    cluster.network.kill(0);

    let start = Instant::now();
    let (b_res, c_res) = tokio::join!(b.shutdown(), c.shutdown());
    assert_eq!(b_res, Err(RpcError::Transport(TransportError::Unreachable(0))));
    assert_eq!(c_res, Err(RpcError::Transport(TransportError::Unreachable(0))));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn membership_validation() {
    crate::init();
    let network = MemNetwork::new();
    let workers = workers(2);

    let mut duplicate_id = workers.clone();
    duplicate_id.push(WorkerInfo::new("other", 1).unwrap());
    let (transport, inbound) = network.join(0);
    let res = GroupAgent::new(workers[0].clone(), duplicate_id, transport, inbound, Cfg::default());
    assert!(matches!(res, Err(RpcError::InvalidArgument(_))), "{:?}", res);

    let mut duplicate_name = workers.clone();
    duplicate_name.push(WorkerInfo::new("worker1", 5).unwrap());
    let (transport, inbound) = network.join(0);
    let res = GroupAgent::new(workers[0].clone(), duplicate_name, transport, inbound, Cfg::default());
    assert!(matches!(res, Err(RpcError::InvalidArgument(_))), "{:?}", res);

    let stranger = WorkerInfo::new("stranger", 7).unwrap();
    let (transport, inbound) = network.join(7);
    let res = GroupAgent::new(stranger, workers.clone(), transport, inbound, Cfg::default());
    assert!(matches!(res, Err(RpcError::InvalidArgument(_))), "{:?}", res);

    let impostor = WorkerInfo::new("impostor", 1).unwrap();
    let (transport, inbound) = network.join(1);
    let res = GroupAgent::new(impostor, workers, transport, inbound, Cfg::default());
    assert!(matches!(res, Err(RpcError::InvalidArgument(_))), "{:?}", res);
}

#[test]
fn requires_runtime() {
    let network = MemNetwork::new();
    let workers = workers(1);
    let (transport, inbound) = network.join(0);
    let res = GroupAgent::new(workers[0].clone(), workers, transport, inbound, Cfg::default());
    assert!(matches!(res, Err(RpcError::InvalidArgument(_))), "{:?}", res);
}

#[tokio::test]
async fn raw_messages() {
    crate::init();
    let network = MemNetwork::new();
    let workers = workers(1);
    let (transport, inbound) = network.join(0);
    let agent = GroupAgent::new(workers[0].clone(), workers.clone(), transport, inbound, test_cfg()).unwrap();

    agent.start(Arc::new(Echo::default())).unwrap();
    let res = agent.start(Arc::new(Echo::default()));
    assert!(matches!(res, Err(RpcError::InvalidArgument(_))), "{:?}", res);

    let request = Message::new(MessageType::BuiltinCall, Bytes::from_static(b"ping"));
    let response = agent.send(&workers[0], request).await.unwrap();
    assert_eq!(response.kind, MessageType::BuiltinRet);
    assert_eq!(&response.payload[..], b"ping");
    assert_eq!(agent.in_flight(), 0);

    agent.join().await.unwrap();
    let res = agent.send(&workers[0], Message::new(MessageType::BuiltinCall, Bytes::new())).await;
    assert_eq!(res, Err(RpcError::Transport(TransportError::Closed)));
}

#[tokio::test]
async fn lost_workers() {
    crate::init();
    let network = MemNetwork::new();
    let workers = workers(3);
    let cfg = test_cfg();

    let mut agents = Vec::new();
    let mut handlers = Vec::new();
    for worker in &workers {
        let (transport, inbound) = network.join(worker.id);
        let agent = GroupAgent::new(worker.clone(), workers.clone(), transport, inbound, cfg.clone()).unwrap();
        let handler = Arc::new(Echo::default());
        agent.start(handler.clone()).unwrap();
        agents.push(agent);
        handlers.push(handler);
    }

    network.kill(2);
    eventually("loss detected", || agents[0].lost_workers() == vec![2] && agents[1].lost_workers() == vec![2]).await;
    assert_eq!(handlers[0].lost.load(Ordering::SeqCst), 1);

    let res = agents[0].send(&workers[2], Message::new(MessageType::BuiltinCall, Bytes::new())).await;
    assert_eq!(res, Err(RpcError::Transport(TransportError::Unreachable(2))));

    // Lost workers count as arrived.
    let (a, b) = tokio::join!(agents[0].sync(), agents[1].sync());
    a.unwrap();
    b.unwrap();

    let (a, b) = tokio::join!(agents[0].join(), agents[1].join());
    a.unwrap();
    b.unwrap();
}

#[tokio::test]
async fn responses_only_from_destination() {
    crate::init();
    let network = MemNetwork::new();
    let workers = workers(3);
    let (transport, inbound) = network.join(0);
    let agent = GroupAgent::new(workers[0].clone(), workers.clone(), transport, inbound, test_cfg()).unwrap();
    agent.start(Arc::new(Echo::default())).unwrap();

    let (bystander, _bystander_inbound) = network.join(1);
    let (peer, mut peer_inbound) = network.join(2);

    let response = agent.send(&workers[2], Message::new(MessageType::BuiltinCall, Bytes::from_static(b"ping")));
    let request = match peer_inbound.recv().await.unwrap() {
        LinkEvent::Frame(src, frame) => {
            assert_eq!(src, 0);
            Message::read(frame).unwrap()
        }
        other => panic!("unexpected event {:?}", other),
    };
    assert_eq!(request.kind, MessageType::BuiltinCall);

    let forged = Message { id: request.id, kind: MessageType::BuiltinRet, payload: Bytes::from_static(b"forged") };
    bystander.send(0, forged.write()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!response.is_done());
    assert_eq!(agent.in_flight(), 1);

    let reply = Message { id: request.id, kind: MessageType::BuiltinRet, payload: request.payload.clone() };
    peer.send(0, reply.write()).unwrap();
    assert_eq!(&response.await.unwrap().payload[..], b"ping");
    assert_eq!(agent.in_flight(), 0);

    network.kill(1);
    network.kill(2);
    agent.join().await.unwrap();
}
