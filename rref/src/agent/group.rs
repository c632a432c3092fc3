//! Agent over a group of workers connected by a [Transport].

use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{runtime::Handle, sync::Notify, task::AbortHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{Inbound, LinkEvent, RequestHandler, RpcAgent, Transport};
use crate::{
    msg::{BarrierKind, BarrierMsg, Message, MessageType, ShutdownMsg},
    Cfg, RpcError, RpcFuture, TransportError, WorkerId, WorkerInfo,
};

/// A request awaiting its response.
struct Pending {
    dst: WorkerId,
    fut: RpcFuture<Message>,
    timer: Option<AbortHandle>,
}

struct Shared {
    me: WorkerInfo,
    workers: BTreeMap<WorkerId, WorkerInfo>,
    cfg: Cfg,
    runtime: Handle,
    transport: Arc<dyn Transport>,
    inbound: Mutex<Option<Inbound>>,
    handler: Mutex<Option<Arc<dyn RequestHandler>>>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    in_flight: AtomicUsize,
    drained: Notify,
    joining: AtomicBool,
    stopped: AtomicBool,
    lost: Mutex<HashSet<WorkerId>>,
    sync_round: AtomicU64,
    join_round: AtomicU64,
    barriers: Mutex<HashMap<BarrierMsg, Vec<(WorkerId, u64)>>>,
    tasks: TaskTracker,
    stop: CancellationToken,
}

/// An [RpcAgent] for a fixed group of workers exchanging frames over a [Transport].
///
/// Requests are correlated with their responses by an id assigned when sending.
/// Each request fails after the [RPC timeout](Cfg::rpc_timeout) if no
/// response arrives, and immediately when its destination is lost.
///
/// Barriers for [sync](RpcAgent::sync) and [join](RpcAgent::join) are
/// coordinated by the worker with the lowest id.
/// Workers that have been lost or have shut down count as arrived.
pub struct GroupAgent {
    shared: Arc<Shared>,
}

impl fmt::Debug for GroupAgent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GroupAgent")
            .field("worker", &self.shared.me)
            .field("workers", &self.shared.workers.len())
            .field("in_flight", &self.shared.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

impl GroupAgent {
    /// Creates an agent for the local worker `me`.
    ///
    /// `workers` lists all members of the cluster, including `me`.
    /// Frames are sent using `transport` and received from `inbound`.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Panics
    /// Panics if the configuration is invalid.
    pub fn new(
        me: WorkerInfo, workers: Vec<WorkerInfo>, transport: impl Transport, inbound: Inbound, cfg: Cfg,
    ) -> Result<Self, RpcError> {
        cfg.check();

        let runtime = Handle::try_current()
            .map_err(|_| RpcError::InvalidArgument("agent must be created within a Tokio runtime".into()))?;

        let mut by_id = BTreeMap::new();
        let mut names = HashSet::new();
        for worker in workers {
            if !names.insert(worker.name.clone()) {
                return Err(RpcError::InvalidArgument(format!("duplicate worker name {}", &worker.name)));
            }
            if let Some(other) = by_id.insert(worker.id, worker) {
                return Err(RpcError::InvalidArgument(format!("duplicate worker id {}", other.id)));
            }
        }
        if by_id.get(&me.id) != Some(&me) {
            return Err(RpcError::InvalidArgument(format!("local worker {} is not a member of the cluster", &me)));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                me,
                workers: by_id,
                cfg,
                runtime,
                transport: Arc::new(transport),
                inbound: Mutex::new(Some(inbound)),
                handler: Mutex::new(None),
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
                joining: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                lost: Mutex::new(HashSet::new()),
                sync_round: AtomicU64::new(0),
                join_round: AtomicU64::new(0),
                barriers: Mutex::new(HashMap::new()),
                tasks: TaskTracker::new(),
                stop: CancellationToken::new(),
            }),
        })
    }

    /// Workers that have failed or left the cluster.
    pub fn lost_workers(&self) -> Vec<WorkerId> {
        let mut lost: Vec<_> = self.shared.lost.lock().unwrap().iter().copied().collect();
        lost.sort_unstable();
        lost
    }
}

impl Drop for GroupAgent {
    fn drop(&mut self) {
        if !self.shared.stopped.swap(true, Ordering::SeqCst) {
            self.shared.stop.cancel();
            self.shared.transport.close();
            self.shared.handler.lock().unwrap().take();
        }
    }
}

impl Shared {
    /// Worker coordinating barriers.
    fn coordinator(&self) -> WorkerId {
        *self.workers.keys().next().expect("cluster contains local worker")
    }

    fn send(self: &Arc<Self>, dst: WorkerId, mut msg: Message, timeout: Duration) -> RpcFuture<Message> {
        if self.stopped.load(Ordering::SeqCst) {
            return RpcFuture::failed(TransportError::Closed.into());
        }
        if msg.kind.is_user_call() && self.joining.load(Ordering::SeqCst) {
            return RpcFuture::failed(RpcError::ShutdownInProgress);
        }
        if !self.workers.contains_key(&dst) {
            return RpcFuture::failed(RpcError::UnknownWorker(dst.to_string()));
        }
        if self.lost.lock().unwrap().contains(&dst) {
            return RpcFuture::failed(TransportError::Unreachable(dst).into());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        msg.id = id;

        let fut = RpcFuture::new();
        self.pending.lock().unwrap().insert(id, Pending { dst, fut: fut.clone(), timer: None });
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        tracing::trace!(worker = %self.me, dst, id, kind = ?msg.kind, "sending request");
        if let Err(err) = self.transport.send(dst, msg.write()) {
            self.fail_pending(id, err.into());
            return fut;
        }

        let weak = Arc::downgrade(self);
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                shared.fail_pending(id, TransportError::Timeout(timeout).into());
            }
        });
        match self.pending.lock().unwrap().get_mut(&id) {
            Some(pending) => pending.timer = Some(timer.abort_handle()),
            None => timer.abort(),
        }

        fut
    }

    /// Completes a request that has been removed from the pending map.
    ///
    /// The request stops counting as in flight after the callbacks of its
    /// future have run.
    fn finish(&self, pending: Pending, result: Result<Message, RpcError>) {
        if let Some(timer) = pending.timer {
            timer.abort();
        }
        pending.fut.set(result);
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Waits until no requests are in flight.
    async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn fail_pending(&self, id: u64, err: RpcError) {
        let pending = self.pending.lock().unwrap().remove(&id);
        if let Some(pending) = pending {
            tracing::debug!(worker = %self.me, dst = pending.dst, id, %err, "request failed");
            self.finish(pending, Err(err));
        }
    }

    fn fail_all(&self, err: TransportError) {
        let pending: Vec<_> = self.pending.lock().unwrap().drain().map(|(_, pending)| pending).collect();
        for pending in pending {
            self.finish(pending, Err(err.clone().into()));
        }
    }

    /// Completes the pending request answered by a response.
    ///
    /// Only the destination of a request can answer it.
    fn complete(&self, src: WorkerId, msg: Message) {
        let pending = {
            let mut pending = self.pending.lock().unwrap();
            match pending.get(&msg.id).map(|p| p.dst) {
                Some(dst) if dst != src => {
                    tracing::debug!(worker = %self.me, src, dst, id = msg.id, "ignoring response from unexpected worker");
                    return;
                }
                Some(_) => pending.remove(&msg.id),
                None => None,
            }
        };
        let Some(pending) = pending else {
            tracing::debug!(worker = %self.me, src, id = msg.id, "response to unknown or expired request");
            return;
        };
        let result = if msg.kind == MessageType::Exception { Err(msg.to_error()) } else { Ok(msg) };
        self.finish(pending, result);
    }

    fn respond(&self, dst: WorkerId, msg: Message) {
        tracing::trace!(worker = %self.me, dst, id = msg.id, kind = ?msg.kind, "sending response");
        if let Err(err) = self.transport.send(dst, msg.write()) {
            tracing::debug!(worker = %self.me, dst, %err, "sending response failed");
        }
    }

    fn respond_error(&self, dst: WorkerId, id: u64, err: &RpcError) {
        let mut msg = Message::exception(err);
        msg.id = id;
        self.respond(dst, msg);
    }

    async fn recv_loop(self: Arc<Self>, mut inbound: Inbound) {
        loop {
            let event = tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                event = inbound.recv() => match event {
                    Some(event) => event,
                    None => {
                        tracing::debug!(worker = %self.me, "transport closed");
                        self.fail_all(TransportError::Closed);
                        break;
                    }
                },
            };

            match event {
                LinkEvent::Frame(src, frame) => match Message::read(frame) {
                    Ok(msg) => self.dispatch(src, msg),
                    Err(err) => tracing::warn!(worker = %self.me, src, %err, "dropping malformed frame"),
                },
                LinkEvent::PeerLost(id) => self.peer_lost(id),
            }
        }
        tracing::debug!(worker = %self.me, "receive loop terminated");
    }

    fn dispatch(self: &Arc<Self>, src: WorkerId, msg: Message) {
        let Some(src_info) = self.workers.get(&src).cloned() else {
            tracing::warn!(worker = %self.me, src, kind = ?msg.kind, "dropping message from unknown worker");
            return;
        };

        if msg.kind.is_response() {
            self.complete(src, msg);
            return;
        }

        tracing::trace!(worker = %self.me, src, id = msg.id, kind = ?msg.kind, "received request");
        match msg.kind {
            MessageType::Barrier => self.arrive(src, msg),
            MessageType::Shutdown => {
                tracing::debug!(worker = %self.me, peer = %src_info, "peer is shutting down");
                self.peer_lost(src);
            }
            _ => {
                let handler = self.handler.lock().unwrap().clone();
                let Some(handler) = handler else {
                    self.respond_error(src, msg.id, &RpcError::ShutdownInProgress);
                    return;
                };
                let id = msg.id;
                let response = handler.handle(&src_info, msg);
                let shared = self.clone();
                self.tasks.spawn_on(
                    async move {
                        let mut response = response.await;
                        response.id = id;
                        shared.respond(src, response);
                    },
                    &self.runtime,
                );
            }
        }
    }

    fn arrive(&self, src: WorkerId, msg: Message) {
        let barrier: BarrierMsg = match msg.decode() {
            Ok(barrier) => barrier,
            Err(err) => {
                self.respond_error(src, msg.id, &err.into());
                return;
            }
        };
        if self.coordinator() != self.me.id {
            let err = RpcError::Protocol(format!("worker {} does not coordinate barriers", &self.me));
            self.respond_error(src, msg.id, &err);
            return;
        }

        tracing::debug!(worker = %self.me, src, ?barrier, "worker arrived at barrier");
        self.barriers.lock().unwrap().entry(barrier).or_default().push((src, msg.id));
        self.release_barriers();
    }

    /// Releases all barriers every live worker has arrived at.
    fn release_barriers(&self) {
        let lost = self.lost.lock().unwrap().clone();
        let released: Vec<_> = {
            let mut barriers = self.barriers.lock().unwrap();
            let complete: Vec<_> = barriers
                .iter()
                .filter(|(_, arrivals)| {
                    self.workers.keys().all(|w| lost.contains(w) || arrivals.iter().any(|(a, _)| a == w))
                })
                .map(|(barrier, _)| *barrier)
                .collect();
            complete.into_iter().filter_map(|barrier| barriers.remove_entry(&barrier)).collect()
        };

        for (barrier, arrivals) in released {
            tracing::debug!(worker = %self.me, ?barrier, "releasing barrier");
            for (worker, id) in arrivals {
                let mut ack = Message::ack();
                ack.id = id;
                self.respond(worker, ack);
            }
        }
    }

    async fn barrier(self: &Arc<Self>, kind: BarrierKind, timeout: Duration) -> Result<(), RpcError> {
        let round = match kind {
            BarrierKind::Sync => self.sync_round.fetch_add(1, Ordering::SeqCst),
            BarrierKind::Join => self.join_round.fetch_add(1, Ordering::SeqCst),
        };
        let msg = Message::encode(MessageType::Barrier, &BarrierMsg { kind, round })?;
        self.send(self.coordinator(), msg, timeout).await?.expect(MessageType::Ack)?;
        Ok(())
    }

    fn peer_lost(&self, id: WorkerId) {
        if id == self.me.id || !self.lost.lock().unwrap().insert(id) {
            return;
        }
        if !self.stopped.load(Ordering::SeqCst) {
            tracing::warn!(worker = %self.me, peer = id, "lost connection to worker");
        }

        let failed: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            let ids: Vec<_> = pending.iter().filter(|(_, p)| p.dst == id).map(|(id, _)| *id).collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for pending in failed {
            self.finish(pending, Err(TransportError::Unreachable(id).into()));
        }

        self.release_barriers();

        let handler = self.handler.lock().unwrap().clone();
        if let (Some(handler), Some(worker)) = (handler, self.workers.get(&id)) {
            handler.peer_lost(worker);
        }
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        match Message::encode(MessageType::Shutdown, &ShutdownMsg { worker: self.me.clone() }) {
            Ok(notice) => {
                let frame = notice.write();
                let lost = self.lost.lock().unwrap().clone();
                for &worker in self.workers.keys().filter(|w| **w != self.me.id && !lost.contains(*w)) {
                    if let Err(err) = self.transport.send(worker, frame.clone()) {
                        tracing::debug!(worker = %self.me, dst = worker, %err, "sending shutdown notice failed");
                    }
                }
            }
            Err(err) => tracing::warn!(worker = %self.me, %err, "encoding shutdown notice failed"),
        }

        self.stop.cancel();
        self.transport.close();
        self.fail_all(TransportError::Closed);
        self.handler.lock().unwrap().take();

        self.tasks.close();
        if tokio::time::timeout(self.cfg.shutdown_timeout, self.tasks.wait()).await.is_err() {
            tracing::warn!(worker = %self.me, "inbound requests still running after shutdown");
        }
        tracing::info!(worker = %self.me, "agent stopped");
    }
}

#[async_trait]
impl RpcAgent for GroupAgent {
    fn worker_info(&self) -> &WorkerInfo {
        &self.shared.me
    }

    fn get_worker_info(&self, name: &str) -> Result<WorkerInfo, RpcError> {
        self.shared
            .workers
            .values()
            .find(|worker| worker.name == name)
            .cloned()
            .ok_or_else(|| RpcError::UnknownWorker(name.to_string()))
    }

    fn get_worker_info_by_id(&self, id: WorkerId) -> Result<WorkerInfo, RpcError> {
        self.shared.workers.get(&id).cloned().ok_or_else(|| RpcError::UnknownWorker(id.to_string()))
    }

    fn workers(&self) -> Vec<WorkerInfo> {
        self.shared.workers.values().cloned().collect()
    }

    fn rpc_timeout(&self) -> Duration {
        self.shared.cfg.rpc_timeout
    }

    fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    fn start(&self, handler: Arc<dyn RequestHandler>) -> Result<(), RpcError> {
        let inbound = self
            .shared
            .inbound
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RpcError::InvalidArgument("agent has already been started".into()))?;
        *self.shared.handler.lock().unwrap() = Some(handler);
        self.shared.runtime.spawn(self.shared.clone().recv_loop(inbound));
        tracing::info!(worker = %self.shared.me, workers = self.shared.workers.len(), "agent started");
        Ok(())
    }

    fn send(&self, dst: &WorkerInfo, msg: Message) -> RpcFuture<Message> {
        self.shared.send(dst.id, msg, self.shared.cfg.rpc_timeout)
    }

    async fn sync(&self) -> Result<(), RpcError> {
        self.shared.drain().await;
        self.shared.barrier(BarrierKind::Sync, self.shared.cfg.rpc_timeout).await
    }

    async fn join(&self) -> Result<(), RpcError> {
        let shared = &self.shared;
        if shared.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        shared.joining.store(true, Ordering::SeqCst);
        tracing::info!(worker = %shared.me, "joining");

        if tokio::time::timeout(shared.cfg.shutdown_timeout, shared.drain()).await.is_err() {
            tracing::warn!(worker = %shared.me, in_flight = self.in_flight(), "outstanding requests did not complete");
        }

        let result = shared.barrier(BarrierKind::Join, shared.cfg.shutdown_timeout).await;
        if let Err(err) = &result {
            tracing::warn!(worker = %shared.me, %err, "join barrier failed");
        }

        shared.stop().await;
        result
    }
}
