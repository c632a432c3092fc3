//! Call dispatch.
//!
//! [Rpc] is the entry point of a worker.
//! It issues calls to other workers and serves the calls, remote reference
//! protocol messages and value requests it receives from them.
//!
//! A call is issued in one of three ways:
//!
//!   * [rpc_sync](Rpc::rpc_sync) waits for the result,
//!   * [rpc_async](Rpc::rpc_async) returns a [future](RpcFuture) of the result,
//!   * [remote](Rpc::remote) returns a [UserRRef] to the result, which stays on
//!     the destination.
//!
//! Calls to the local worker take the same path as calls to other workers,
//! including serialization of the call and its result.

use bytes::Bytes;
use futures::{future, FutureExt};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::{
    agent::{HandlerFuture, RequestHandler, RpcAgent},
    call::{Call, Executor},
    msg::{ChildAccept, FetchCall, ForkMsg, Message, MessageType, RemoteCall},
    rref::{OwnerRRef, RRef, RRefContext, RRefForkData, UserRRef},
    Cfg, RpcError, RpcFuture, WorkerInfo,
};

struct RpcInner {
    agent: Arc<dyn RpcAgent>,
    ctx: RRefContext,
    executor: Arc<dyn Executor>,
    cfg: Cfg,
    shutting_down: AtomicBool,
    sweeper: CancellationToken,
}

/// RPC endpoint of a worker.
///
/// Clones share the same endpoint.
#[derive(Clone)]
pub struct Rpc {
    inner: Arc<RpcInner>,
}

impl fmt::Debug for Rpc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Rpc")
            .field("worker", self.inner.agent.worker_info())
            .field("shutting_down", &self.inner.shutting_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl Rpc {
    /// Starts serving requests received by the agent.
    ///
    /// Inbound calls are executed by `executor`.
    /// If a [fork timeout](Cfg::fork_timeout) is configured, a background task
    /// periodically releases expired unacknowledged references.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Panics
    /// Panics if the configuration is invalid.
    pub fn start(agent: impl RpcAgent, executor: impl Executor, cfg: Cfg) -> Result<Self, RpcError> {
        cfg.check();
        let runtime = Handle::try_current()
            .map_err(|_| RpcError::InvalidArgument("RPC must be started within a Tokio runtime".into()))?;

        let agent: Arc<dyn RpcAgent> = Arc::new(agent);
        let ctx = RRefContext::new(agent.clone(), cfg.clone());
        let inner = Arc::new(RpcInner {
            agent: agent.clone(),
            ctx,
            executor: Arc::new(executor),
            cfg,
            shutting_down: AtomicBool::new(false),
            sweeper: CancellationToken::new(),
        });

        agent.start(Arc::new(Handler { rpc: Arc::downgrade(&inner) }))?;

        if let Some(fork_timeout) = inner.cfg.fork_timeout {
            let weak = Arc::downgrade(&inner);
            let stop = inner.sweeper.clone();
            let interval = inner.cfg.sweep_interval;
            runtime.spawn(async move {
                let mut timer = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        () = stop.cancelled() => break,
                        _ = timer.tick() => (),
                    }
                    let Some(inner) = weak.upgrade() else { break };
                    let collected = inner.ctx.collect_expired(Instant::now());
                    if collected > 0 {
                        tracing::debug!(collected, ?fork_timeout, "sweep collected expired owner entries");
                    }
                }
            });
        }

        Ok(Self { inner })
    }

    /// The local worker.
    pub fn worker_info(&self) -> &WorkerInfo {
        self.inner.agent.worker_info()
    }

    /// The worker with the specified name.
    pub fn get_worker_info(&self, name: &str) -> Result<WorkerInfo, RpcError> {
        self.inner.agent.get_worker_info(name)
    }

    /// The agent used for communication.
    pub fn agent(&self) -> &Arc<dyn RpcAgent> {
        &self.inner.agent
    }

    /// The remote reference context of the local worker.
    pub fn context(&self) -> &RRefContext {
        &self.inner.ctx
    }

    /// Time after which a call without response fails.
    pub fn rpc_timeout(&self) -> Duration {
        self.inner.agent.rpc_timeout()
    }

    fn check_running(&self) -> Result<(), RpcError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            Err(RpcError::ShutdownInProgress)
        } else {
            Ok(())
        }
    }

    /// Calls a function on the destination and returns a future of its result.
    ///
    /// Calls to the same destination are sent in order, but may complete in
    /// any order.
    pub fn rpc_async(&self, dst: &WorkerInfo, call: Call) -> RpcFuture<Bytes> {
        if let Err(err) = self.check_running() {
            return RpcFuture::failed(err);
        }

        let kind = call.kind;
        let msg = match Message::encode(kind.request_type(), &call) {
            Ok(msg) => msg,
            Err(err) => return RpcFuture::failed(err.into()),
        };
        tracing::trace!(dst = %dst, %kind, name = %call.name, "calling");
        RpcFuture::then(&self.inner.agent.send(dst, msg), move |res| res?.expect(kind.response_type()))
    }

    /// Calls a function on the destination and waits for its result.
    pub async fn rpc_sync(&self, dst: &WorkerInfo, call: Call) -> Result<Bytes, RpcError> {
        self.rpc_async(dst, call).await
    }

    /// Calls a function on the destination, which keeps the result as owner.
    ///
    /// Returns a reference to the result immediately.
    /// The fork of the returned reference is registered with the owner by the
    /// same message that starts the call, see [UserRRef::confirmed].
    /// A failure of the call surfaces when obtaining the value.
    pub fn remote(&self, dst: &WorkerInfo, call: Call) -> Result<UserRRef, RpcError> {
        self.check_running()?;

        let ctx = &self.inner.ctx;
        let user = ctx.create_user_rref(dst);
        let body = RemoteCall { call, rref_id: user.rref_id(), fork_id: user.fork_id() };
        let msg = match Message::encode(MessageType::RemoteCall, &body) {
            Ok(msg) => msg,
            Err(err) => {
                let err = RpcError::from(err);
                ctx.handle_fork_failed(user.fork_id(), err.clone());
                return Err(err);
            }
        };

        tracing::trace!(dst = %dst, rref_id = %user.rref_id(), name = %body.call.name, "remote call");
        let response = self.inner.agent.send(dst, msg);
        ctx.track_registration(user.fork_id(), response.clone(), MessageType::RemoteRet);
        match response.result() {
            Some(Err(err)) => Err(err),
            _ => Ok(user),
        }
    }

    /// Wraps a local value into a reference owned by the local worker.
    pub fn rref(&self, value: Bytes) -> OwnerRRef {
        self.inner.ctx.create_owner_rref(value)
    }

    /// Creates fork data for sending the reference to another worker.
    pub fn pickle(&self, rref: &RRef) -> Result<RRefForkData, RpcError> {
        self.inner.ctx.pickle(rref)
    }

    /// Materializes a reference from fork data received from another worker.
    pub fn unpickle(&self, data: RRefForkData) -> Result<RRef, RpcError> {
        self.inner.ctx.unpickle(data)
    }

    /// Shuts down gracefully.
    ///
    /// New calls are rejected with [RpcError::ShutdownInProgress].
    /// Waits up to the [shutdown timeout](Cfg::shutdown_timeout) for all
    /// values owned by this worker to be released by their users, then
    /// leaves the cluster once all workers have shut down.
    pub async fn shutdown(&self) -> Result<(), RpcError> {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(worker = %self.worker_info(), "shutting down");

        if !inner.ctx.wait_quiescent(inner.cfg.shutdown_timeout).await {
            tracing::warn!(worker = %self.worker_info(), "remote references still in use at shutdown");
        }
        let result = inner.agent.join().await;
        inner.ctx.clear();
        inner.sweeper.cancel();

        tracing::info!(worker = %self.worker_info(), "shut down");
        result
    }

    fn handle(&self, src: &WorkerInfo, request: Message) -> Result<HandlerFuture, RpcError> {
        let ctx = &self.inner.ctx;
        match request.kind {
            MessageType::BuiltinCall | MessageType::ScriptCall | MessageType::PythonCall => {
                let call: Call = request.decode()?;
                if call.kind.request_type() != request.kind {
                    return Err(RpcError::Protocol(format!("{} call in {:?} message", call.kind, request.kind)));
                }
                let kind = call.kind;
                tracing::trace!(src = %src, %kind, name = %call.name, "executing call");
                let result = self.inner.executor.execute(self.clone(), call);
                Ok(async move {
                    match result.await {
                        Ok(ret) => Message::new(kind.response_type(), ret),
                        Err(err) => Message::exception(&err),
                    }
                }
                .boxed())
            }

            MessageType::RemoteCall => {
                let RemoteCall { call, rref_id, fork_id } = request.decode()?;
                ctx.handle_fork_add(src.id, rref_id, fork_id);
                let owner = ctx.get_or_create_owner(rref_id);

                tracing::trace!(src = %src, %rref_id, name = %call.name, "executing remote call");
                let result = self.inner.executor.execute(self.clone(), call);
                tokio::spawn(async move {
                    let result = result.await;
                    if let Err(err) = &result {
                        tracing::debug!(%rref_id, %err, "remote call failed");
                    }
                    owner.local_value().set(result);
                    drop(owner);
                });

                let ack = Message::encode(MessageType::RemoteRet, &ForkMsg { rref_id, fork_id })?;
                Ok(future::ready(ack).boxed())
            }

            MessageType::RRefFetchCall => {
                let FetchCall { rref_id } = request.decode()?;
                let value = ctx.owner_value(rref_id)?;
                Ok(async move {
                    match value.await {
                        Ok(value) => Message::new(MessageType::RRefFetchRet, value),
                        Err(err) => Message::exception(&err),
                    }
                }
                .boxed())
            }

            MessageType::RRefForkRequest => {
                let fork: ForkMsg = request.decode()?;
                ctx.handle_fork_add(src.id, fork.rref_id, fork.fork_id);
                Ok(future::ready(Message::encode(MessageType::RRefAck, &fork)?).boxed())
            }

            MessageType::RRefUserDelete => {
                let ForkMsg { rref_id, fork_id } = request.decode()?;
                ctx.handle_user_delete(rref_id, fork_id);
                Ok(future::ready(Message::ack()).boxed())
            }

            MessageType::RRefChildAccept => {
                let ChildAccept { rref_id, fork_id } = request.decode()?;
                ctx.handle_child_accept(src.id, rref_id, fork_id);
                Ok(future::ready(Message::ack()).boxed())
            }

            other => Err(RpcError::Protocol(format!("unexpected request {:?}", other))),
        }
    }
}

/// Serves requests on behalf of an [Rpc] without keeping it alive.
struct Handler {
    rpc: Weak<RpcInner>,
}

impl RequestHandler for Handler {
    fn handle(&self, src: &WorkerInfo, request: Message) -> HandlerFuture {
        let Some(inner) = self.rpc.upgrade() else {
            return future::ready(Message::exception(&RpcError::ShutdownInProgress)).boxed();
        };
        let kind = request.kind;
        match (Rpc { inner }).handle(src, request) {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(src = %src, ?kind, %err, "request failed");
                future::ready(Message::exception(&err)).boxed()
            }
        }
    }

    fn peer_lost(&self, worker: &WorkerInfo) {
        if let Some(inner) = self.rpc.upgrade() {
            inner.ctx.peer_lost(worker);
        }
    }
}
