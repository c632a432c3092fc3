use bytes::Bytes;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rref::{codec, rref::RRefEvent, Call, ForkId, GloballyUniqueId, RRef, RpcError};

use crate::{cluster, test_cfg};

#[tokio::test]
async fn remote_to_here() {
    crate::init();
    let cluster = cluster(2, test_cfg());
    let (a, b) = (&cluster.rpcs[0], &cluster.rpcs[1]);
    let worker_b = &cluster.workers[1];

    let user = a.remote(worker_b, Call::udf("square", &3i64).unwrap()).unwrap();
    assert_eq!(user.owner(), worker_b);

    let rref = RRef::from(user.clone());
    assert!(!rref.is_owner());
    assert_eq!(rref.local_value().unwrap_err(), RpcError::NotOwner(user.rref_id()));
    assert_eq!(rref.to_here_as::<i64>().await.unwrap(), 9);

    assert!(user.is_confirmed());
    let users = a.context().snapshot();
    assert!(users.pending_users.is_empty());
    assert_eq!(users.confirmed_users.iter().copied().collect::<Vec<_>>(), vec![user.fork_id()]);

    let owners = b.context().snapshot();
    let entry = &owners.owners[&user.rref_id()];
    assert_eq!(entry.forks.len(), 1);
    assert_eq!(entry.forks[&user.fork_id()], Some(0));

    let (rref_id, fork_id) = (user.rref_id(), user.fork_id());
    drop(rref);
    drop(user);
    cluster.settle().await;

    assert!(b.context().snapshot().owners.is_empty());
    assert!(a.context().snapshot().confirmed_users.is_empty());
    assert!(a.context().events().contains(&RRefEvent::UserDeleted { rref_id, fork_id }));
    assert!(b.context().events().contains(&RRefEvent::ForkDeleted { rref_id, fork_id }));

    cluster.shutdown().await;
}

#[tokio::test]
async fn remote_failure_surfaces_on_to_here() {
    crate::init();
    let cluster = cluster(2, test_cfg());
    let (a, b) = (&cluster.rpcs[0], &cluster.workers[1]);

    let user = a.remote(b, Call::udf("fail", &"no value").unwrap()).unwrap();
    user.confirmed().await.unwrap();
    let res = RRef::from(user).to_here().await;
    assert_eq!(res, Err(RpcError::RemoteExecution("no value".into())));

    cluster.shutdown().await;
}

#[tokio::test]
async fn self_owned_to_here() {
    crate::init();
    let cluster = cluster(2, test_cfg());
    let a = &cluster.rpcs[0];
    let me = a.worker_info().clone();

    // Owned through a remote call to itself: still a user reference.
    let user = a.remote(&me, Call::udf("square", &6i64).unwrap()).unwrap();
    let rref = RRef::from(user.clone());
    assert!(!rref.is_owner());
    assert_eq!(rref.owner(), &me);
    assert_eq!(rref.to_here_as::<i64>().await.unwrap(), 36);
    assert!(user.is_confirmed());

    let snapshot = a.context().snapshot();
    assert_eq!(snapshot.owners[&user.rref_id()].forks[&user.fork_id()], Some(me.id));
    assert!(snapshot.confirmed_users.contains(&user.fork_id()));

    drop(rref);
    drop(user);
    cluster.settle().await;
    assert!(a.context().snapshot().owners.is_empty());

    // Wrapped local value.
    let owner = a.rref(codec::encode(&"local").unwrap());
    let rref = RRef::from(owner.clone());
    assert!(rref.is_owner());
    assert!(rref.local_value().unwrap().is_done());
    assert_eq!(rref.to_here_as::<String>().await.unwrap(), "local");
    assert_eq!(a.context().snapshot().owners[&owner.rref_id()].local_refs, 2);

    drop(rref);
    drop(owner);
    assert!(a.context().snapshot().owners.is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn idempotent_ack_and_delete() {
    crate::init();
    let cluster = cluster(2, test_cfg());
    let a = &cluster.rpcs[0];
    let ctx = a.context();

    let owner = a.rref(Bytes::from_static(b"5"));
    let rref_id = owner.rref_id();
    let fork_id = ForkId(GloballyUniqueId::new(1, 1000));

    assert!(ctx.handle_fork_add(1, rref_id, fork_id));
    let added = ctx.snapshot();
    assert!(!ctx.handle_fork_add(1, rref_id, fork_id));
    assert_eq!(ctx.snapshot(), added);

    assert!(ctx.handle_user_delete(rref_id, fork_id));
    let deleted = ctx.snapshot();
    assert!(!ctx.handle_user_delete(rref_id, fork_id));
    assert_eq!(ctx.snapshot(), deleted);
    assert!(deleted.owners[&rref_id].forks.is_empty());

    let user = ctx.create_user_rref(&cluster.workers[1]);
    assert!(!user.is_confirmed());
    assert!(ctx.handle_fork_ack(user.fork_id()));
    let acked = ctx.snapshot();
    assert!(!ctx.handle_fork_ack(user.fork_id()));
    assert_eq!(ctx.snapshot(), acked);
    assert!(user.is_confirmed());
    assert!(!ctx.handle_fork_failed(user.fork_id(), RpcError::Protocol("late".into())));
    assert!(user.is_confirmed());

    let adds = ctx.events().iter().filter(|event| matches!(event, RRefEvent::ForkAdded { .. })).count();
    assert_eq!(adds, 1);
    let acks = ctx.events().iter().filter(|event| matches!(event, RRefEvent::ForkAcked { .. })).count();
    assert_eq!(acks, 1);

    drop(user);
    drop(owner);
    cluster.settle().await;
    assert_eq!(ctx.snapshot(), Default::default());

    cluster.shutdown().await;
}

#[tokio::test]
async fn fork_set_empty_iff_all_forks_deleted() {
    crate::init();
    let cluster = cluster(4, test_cfg());
    let owner_rpc = &cluster.rpcs[0];
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for round in 0..8i64 {
        let owner = owner_rpc.rref(codec::encode(&round).unwrap());
        let rref_id = owner.rref_id();

        let mut forks: Vec<(usize, RRef)> = Vec::new();
        for _ in 0..rng.gen_range(1..10) {
            let holder = rng.gen_range(1..4);
            let data = match forks.choose(&mut rng) {
                Some((parent, rref)) if rng.gen_bool(0.5) => cluster.rpcs[*parent].pickle(rref).unwrap(),
                _ => owner_rpc.pickle(&RRef::from(owner.clone())).unwrap(),
            };
            let data = codec::decode(&codec::encode(&data).unwrap()).unwrap();
            forks.push((holder, cluster.rpcs[holder].unpickle(data).unwrap()));
        }
        drop(owner);
        cluster.settle().await;

        forks.shuffle(&mut rng);
        loop {
            let snapshot = owner_rpc.context().snapshot();
            match snapshot.owners.get(&rref_id) {
                Some(entry) => {
                    assert!(!forks.is_empty(), "round {}: entry kept without forks", round);
                    assert_eq!(entry.forks.len(), forks.len(), "round {}", round);
                }
                None => assert!(forks.is_empty(), "round {}: entry collected with forks", round),
            }

            if forks.pop().is_none() {
                break;
            }
            cluster.settle().await;
        }
    }

    for rpc in &cluster.rpcs {
        let snapshot = rpc.context().snapshot();
        assert!(snapshot.owners.is_empty());
        assert!(snapshot.pending_users.is_empty());
        assert!(snapshot.confirmed_users.is_empty());
        assert!(snapshot.pending_children.is_empty());
    }

    cluster.shutdown().await;
}
