//! Distributed remote references and RPC dispatch.
//!
//! A cluster consists of a fixed set of workers, each identified by a
//! [WorkerInfo].
//! Workers call functions on each other using an [Rpc] endpoint and share
//! values through remote references ([RRef]), which are reference counted
//! across the cluster without a central coordinator:
//! the worker owning a value keeps it alive as long as any other worker
//! holds a fork of its reference.
//!
//! Messages are moved between workers by an [agent](agent::RpcAgent).
//! [GroupAgent](agent::GroupAgent) implements it on top of an in-process
//! [network](agent::mem::MemNetwork) or [TCP](agent::tcp::TcpTransport).
//!
//! # Example
//!
//! ```
//! use rref::{agent::{mem::MemNetwork, GroupAgent}, Call, CallKind, Cfg, FunctionRegistry, Rpc, WorkerInfo};
//!
//! # #[tokio::main(flavor = "multi_thread")]
//! # async fn main() {
//! let workers = vec![WorkerInfo::new("a", 0).unwrap(), WorkerInfo::new("b", 1).unwrap()];
//! let functions = FunctionRegistry::new();
//! functions.register_fn(CallKind::Udf, "square", |x: i64| Ok(x * x));
//!
//! let network = MemNetwork::new();
//! let mut rpcs = Vec::new();
//! for worker in &workers {
//!     let (transport, inbound) = network.join(worker.id);
//!     let agent = GroupAgent::new(worker.clone(), workers.clone(), transport, inbound, Cfg::default()).unwrap();
//!     rpcs.push(Rpc::start(agent, functions.clone(), Cfg::default()).unwrap());
//! }
//!
//! let user = rpcs[0].remote(&workers[1], Call::udf("square", &7i64).unwrap()).unwrap();
//! let value: i64 = rref::RRef::from(user).to_here_as().await.unwrap();
//! assert_eq!(value, 49);
//!
//! let (a, b) = tokio::join!(rpcs[0].shutdown(), rpcs[1].shutdown());
//! a.unwrap();
//! b.unwrap();
//! # }
//! ```

#![warn(missing_docs)]

pub mod agent;
pub mod call;
mod cfg;
pub mod codec;
mod error;
mod future;
mod id;
pub mod msg;
pub mod prelude;
pub mod rpc;
pub mod rref;
mod worker;

pub use call::{Call, CallKind, Executor, FunctionRegistry};
pub use cfg::Cfg;
pub use error::{RpcError, TransportError};
pub use future::RpcFuture;
pub use id::{ForkId, GloballyUniqueId, IdGenerator, RRefId};
pub use rpc::Rpc;
pub use rref::{OwnerRRef, RRef, RRefForkData, UserRRef};
pub use worker::{WorkerId, WorkerInfo, MAX_NAME_LENGTH};
