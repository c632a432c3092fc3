//! Pluggable transport for messages between workers.
//!
//! The RPC layer talks to other workers exclusively through an [RpcAgent].
//! [GroupAgent] implements the agent on top of any [Transport], which
//! only has to move frames between workers while preserving their order per
//! destination.
//!
//! Two transports are provided:
//!
//!   * [mem::MemNetwork] connects workers living in the same process,
//!   * [tcp::TcpTransport] connects workers over TCP.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

use crate::{msg::Message, RpcError, RpcFuture, TransportError, WorkerId, WorkerInfo};

mod group;
pub mod mem;
pub mod tcp;

pub use group::GroupAgent;

/// Response to an inbound request.
pub type HandlerFuture = BoxFuture<'static, Message>;

/// Processes requests received from other workers.
pub trait RequestHandler: Send + Sync + 'static {
    /// Handles an inbound request.
    ///
    /// This is called on the receive loop of the agent in the order the requests
    /// arrived from each worker, so it must not block.
    /// Long running work belongs into the returned future, which is polled on
    /// a separate task and whose output is sent back as response.
    fn handle(&self, src: &WorkerInfo, request: Message) -> HandlerFuture;

    /// Called when a worker has failed or left the cluster.
    fn peer_lost(&self, _worker: &WorkerInfo) {}
}

/// Transport of messages between the workers of a cluster.
#[async_trait]
pub trait RpcAgent: Send + Sync + 'static {
    /// Identity of the local worker.
    fn worker_info(&self) -> &WorkerInfo;

    /// Identity of the worker with the specified name.
    fn get_worker_info(&self, name: &str) -> Result<WorkerInfo, RpcError>;

    /// Identity of the worker with the specified id.
    fn get_worker_info_by_id(&self, id: WorkerId) -> Result<WorkerInfo, RpcError>;

    /// All workers of the cluster, including the local one.
    fn workers(&self) -> Vec<WorkerInfo>;

    /// Time after which a request without response fails.
    fn rpc_timeout(&self) -> Duration;

    /// Number of sent requests still awaiting their response.
    fn in_flight(&self) -> usize;

    /// Starts processing inbound messages using the specified handler.
    fn start(&self, handler: Arc<dyn RequestHandler>) -> Result<(), RpcError>;

    /// Sends a request to the specified worker.
    ///
    /// The returned future completes with the response or fails with the
    /// error reported by the destination, a transport error or a timeout.
    fn send(&self, dst: &WorkerInfo, msg: Message) -> RpcFuture<Message>;

    /// Waits until all outstanding requests of this worker have completed and
    /// all workers of the cluster have called `sync`.
    async fn sync(&self) -> Result<(), RpcError>;

    /// Shuts down gracefully.
    ///
    /// New user calls are rejected from now on, while protocol messages are
    /// still sent and inbound requests are still served.
    /// Completes after all outstanding requests have completed and all workers
    /// have called `join`, or the shutdown timeout has expired.
    async fn join(&self) -> Result<(), RpcError>;
}

/// Event reported by a transport.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A frame was received from the specified worker.
    Frame(WorkerId, Bytes),
    /// The specified worker failed or closed its connection.
    PeerLost(WorkerId),
}

/// Receiver of transport events.
pub type Inbound = mpsc::UnboundedReceiver<LinkEvent>;

/// Moves frames between workers.
///
/// Frames sent to the same destination must be delivered in order.
pub trait Transport: Send + Sync + 'static {
    /// Queues a frame for delivery to the specified worker.
    ///
    /// Must not block.
    fn send(&self, dst: WorkerId, frame: Bytes) -> Result<(), TransportError>;

    /// Closes the transport after queued frames have been delivered.
    fn close(&self);
}
