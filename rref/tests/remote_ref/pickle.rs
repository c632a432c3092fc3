use rref::{codec, rref::RRefEvent, Call, Cfg, RRef, RRefForkData, RpcError, TransportError, WorkerInfo};
use std::time::{Duration, Instant};

use crate::{cluster, eventually, test_cfg};

#[tokio::test]
async fn user_to_user() {
    crate::init();
    let cluster = cluster(3, test_cfg());
    let (a, b, c) = (&cluster.rpcs[0], &cluster.rpcs[1], &cluster.rpcs[2]);

    let user = a.remote(&cluster.workers[1], Call::udf("square", &4i64).unwrap()).unwrap();
    user.confirmed().await.unwrap();

    let data = a.pickle(&RRef::from(user.clone())).unwrap();
    assert_eq!(data.owner, cluster.workers[1]);
    assert_eq!(data.rref_id, user.rref_id());
    assert_eq!(data.parent, cluster.workers[0]);
    assert!(a.context().snapshot().pending_children.contains(&data.fork_id));

    // Sent over the wire.
    let data: RRefForkData = codec::decode(&codec::encode(&data).unwrap()).unwrap();
    let child_fork = data.fork_id;
    let child = c.unpickle(data).unwrap();
    assert!(!child.is_owner());
    assert_eq!(child.rref_id(), user.rref_id());
    assert_eq!(child.to_here_as::<i64>().await.unwrap(), 16);

    cluster.settle().await;
    assert!(a.context().snapshot().pending_children.is_empty());
    assert!(c.context().snapshot().confirmed_users.contains(&child_fork));
    let snapshot = b.context().snapshot();
    let forks = &snapshot.owners[&user.rref_id()].forks;
    assert_eq!(forks.len(), 2);
    assert_eq!(forks[&user.fork_id()], Some(0));
    assert_eq!(forks[&child_fork], Some(2));

    // The parent may go away before the child.
    drop(user);
    cluster.settle().await;
    assert_eq!(b.context().snapshot().owners[&child.rref_id()].forks.len(), 1);
    assert_eq!(child.to_here_as::<i64>().await.unwrap(), 16);

    drop(child);
    cluster.settle().await;
    assert!(b.context().snapshot().owners.is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn owner_to_user() {
    crate::init();
    let cluster = cluster(2, test_cfg());
    let (a, b) = (&cluster.rpcs[0], &cluster.rpcs[1]);

    let owner = b.rref(codec::encode(&"shared").unwrap());
    let data = b.pickle(&RRef::from(owner.clone())).unwrap();
    assert_eq!(b.context().snapshot().owners[&owner.rref_id()].forks[&data.fork_id], None);

    let fork_id = data.fork_id;
    let user = a.unpickle(data).unwrap();
    assert_eq!(user.owner(), &cluster.workers[1]);
    match &user {
        RRef::User(user) => assert!(user.is_confirmed()),
        RRef::Owner(_) => panic!("unpickled owner reference on user"),
    }
    assert_eq!(user.to_here_as::<String>().await.unwrap(), "shared");

    cluster.settle().await;
    assert_eq!(b.context().snapshot().owners[&owner.rref_id()].forks[&fork_id], Some(0));

    // The owner entry outlives the local handle while the fork exists.
    let rref_id = owner.rref_id();
    drop(owner);
    let snapshot = b.context().snapshot();
    let entry = &snapshot.owners[&rref_id];
    assert_eq!(entry.local_refs, 0);
    assert_eq!(entry.forks.len(), 1);

    drop(user);
    cluster.settle().await;
    assert!(b.context().snapshot().owners.is_empty());
    assert!(b.context().events().contains(&RRefEvent::OwnerCollected { rref_id, forced: false }));

    cluster.shutdown().await;
}

#[tokio::test]
async fn back_to_owner() {
    crate::init();
    let cluster = cluster(2, test_cfg());
    let (a, b) = (&cluster.rpcs[0], &cluster.rpcs[1]);

    // Pickled by a user.
    let user = a.remote(&cluster.workers[1], Call::udf("square", &8i64).unwrap()).unwrap();
    user.confirmed().await.unwrap();
    let data = a.pickle(&RRef::from(user.clone())).unwrap();
    let rref = b.unpickle(data).unwrap();
    assert!(rref.is_owner());
    assert_eq!(rref.to_here_as::<i64>().await.unwrap(), 64);

    cluster.settle().await;
    assert!(a.context().snapshot().pending_children.is_empty());
    assert_eq!(b.context().snapshot().owners[&rref.rref_id()].forks.len(), 1);

    drop(user);
    cluster.settle().await;
    assert_eq!(b.context().snapshot().owners[&rref.rref_id()].local_refs, 1);
    drop(rref);
    assert!(b.context().snapshot().owners.is_empty());

    // Pickled by the owner itself.
    let owner = b.rref(codec::encode(&1i64).unwrap());
    let data = b.pickle(&RRef::from(owner.clone())).unwrap();
    assert_eq!(b.context().snapshot().owners[&owner.rref_id()].forks.len(), 1);
    let rref = b.unpickle(data).unwrap();
    assert!(rref.is_owner());
    let snapshot = b.context().snapshot();
    let entry = &snapshot.owners[&owner.rref_id()];
    assert!(entry.forks.is_empty());
    assert_eq!(entry.local_refs, 2);

    drop(rref);
    drop(owner);
    assert!(b.context().snapshot().owners.is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn unknown_owner_entry() {
    crate::init();
    let cluster = cluster(2, test_cfg());
    let (a, b) = (&cluster.rpcs[0], &cluster.rpcs[1]);

    let owner = b.rref(codec::encode(&0i64).unwrap());
    let rref_id = owner.rref_id();
    let data = b.pickle(&RRef::from(owner.clone())).unwrap();
    let stale = RRefForkData { parent: cluster.workers[0].clone(), ..data.clone() };

    // Consumes the fork, then the entry is collected with its last handle.
    drop(b.unpickle(data).unwrap());
    drop(owner);
    assert!(b.context().snapshot().owners.is_empty());
    assert_eq!(b.unpickle(stale).unwrap_err(), RpcError::UnknownRRef(rref_id));

    // A user whose owner never created the value.
    let user = a.context().create_user_rref(&cluster.workers[1]);
    assert!(a.context().handle_fork_failed(user.fork_id(), RpcError::Protocol("never sent".into())));
    assert_eq!(user.confirmed().await, Err(RpcError::Protocol("never sent".into())));
    assert_eq!(user.to_here().await, Err(RpcError::UnknownRRef(user.rref_id())));

    drop(user);
    cluster.settle().await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn failed_registration_releases_parent() {
    crate::init();
    let cluster = cluster(3, test_cfg());
    let (a, b, c) = (&cluster.rpcs[0], &cluster.rpcs[1], &cluster.rpcs[2]);

    let user = a.remote(&cluster.workers[1], Call::udf("square", &6i64).unwrap()).unwrap();
    user.confirmed().await.unwrap();
    let data = a.pickle(&RRef::from(user.clone())).unwrap();
    assert!(a.context().snapshot().pending_children.contains(&data.fork_id));

    // The child cannot reach the owner it was told about.
    let ghost = WorkerInfo::new("ghost", 9).unwrap();
    let child = c.unpickle(RRefForkData { owner: ghost, ..data }).unwrap();
    match &child {
        RRef::User(child) => assert_eq!(child.confirmed().await, Err(RpcError::UnknownWorker("9".into()))),
        RRef::Owner(_) => panic!("unpickled owner reference on user"),
    }
    eventually("parent released its fork", || a.context().snapshot().pending_children.is_empty()).await;
    assert!(c.context().snapshot().pending_users.is_empty());

    drop(child);
    drop(user);
    cluster.settle().await;
    assert!(b.context().snapshot().owners.is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn lost_owner_releases_forks() {
    crate::init();
    let cfg = Cfg { shutdown_timeout: Duration::from_secs(3), ..test_cfg() };
    let cluster = cluster(3, cfg);
    let (a, c) = (&cluster.rpcs[0], &cluster.rpcs[2]);

    let user = a.remote(&cluster.workers[1], Call::udf("square", &5i64).unwrap()).unwrap();
    user.confirmed().await.unwrap();
    let data = a.pickle(&RRef::from(user.clone())).unwrap();
    let snapshot = a.context().snapshot();
    assert!(snapshot.pending_children.contains(&data.fork_id));
    assert!(snapshot.confirmed_users.contains(&user.fork_id()));

    cluster.network.kill(1);
    eventually("forks owned by lost worker forgotten", || {
        let snapshot = a.context().snapshot();
        snapshot.pending_children.is_empty() && snapshot.confirmed_users.is_empty()
    })
    .await;

    let child = c.unpickle(data).unwrap();
    match &child {
        RRef::User(child) => {
            assert_eq!(child.confirmed().await, Err(RpcError::Transport(TransportError::Unreachable(1))))
        }
        RRef::Owner(_) => panic!("unpickled owner reference on user"),
    }
    assert!(c.context().snapshot().pending_users.is_empty());

    drop(child);
    drop(user);
    let start = Instant::now();
    let (a_res, c_res) = tokio::join!(a.shutdown(), c.shutdown());
    a_res.unwrap();
    c_res.unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
}
