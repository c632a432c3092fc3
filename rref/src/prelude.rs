//! Convenience re-export of common members.
//!
//! ```
//! use rref::prelude::*;
//! ```

#[doc(no_inline)]
pub use crate::agent::RpcAgent;

#[doc(no_inline)]
pub use crate::{Call, CallKind, Cfg, FunctionRegistry, RRef, Rpc, RpcError, RpcFuture, WorkerInfo};
