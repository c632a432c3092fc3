//! Call descriptors and their execution on the destination worker.
//!
//! A [Call] names a function of one of three [kinds](CallKind) and carries
//! its already serialized arguments.
//! The destination hands it to an [Executor], which resolves the name and
//! runs the function.
//! [FunctionRegistry] is an executor that dispatches to functions registered
//! by name.

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, RwLock},
};

use crate::{codec, msg::MessageType, Rpc, RpcError};

/// Kind of a called function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallKind {
    /// Builtin operator.
    Builtin,
    /// Precompiled function identified by its qualified name.
    Script,
    /// Generic user function.
    Udf,
}

impl CallKind {
    /// Message type of a request calling a function of this kind.
    pub fn request_type(self) -> MessageType {
        match self {
            Self::Builtin => MessageType::BuiltinCall,
            Self::Script => MessageType::ScriptCall,
            Self::Udf => MessageType::PythonCall,
        }
    }

    /// Message type of the response to a call of a function of this kind.
    pub fn response_type(self) -> MessageType {
        match self {
            Self::Builtin => MessageType::BuiltinRet,
            Self::Script => MessageType::ScriptRet,
            Self::Udf => MessageType::PythonRet,
        }
    }

    /// Kind of function called by a request of the specified message type.
    pub fn from_request_type(kind: MessageType) -> Option<Self> {
        match kind {
            MessageType::BuiltinCall => Some(Self::Builtin),
            MessageType::ScriptCall => Some(Self::Script),
            MessageType::PythonCall => Some(Self::Udf),
            _ => None,
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Builtin => write!(f, "builtin"),
            Self::Script => write!(f, "script"),
            Self::Udf => write!(f, "udf"),
        }
    }
}

/// A function call with serialized arguments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    /// Kind of function.
    pub kind: CallKind,
    /// Name of the function.
    pub name: String,
    /// Serialized arguments.
    pub args: Bytes,
}

impl Call {
    /// Creates a call with already serialized arguments.
    pub fn new(kind: CallKind, name: impl Into<String>, args: Bytes) -> Self {
        Self { kind, name: name.into(), args }
    }

    /// Creates a call of a function of the specified kind, encoding the arguments
    /// with the default codec.
    pub fn encode<A>(kind: CallKind, name: impl Into<String>, args: &A) -> Result<Self, RpcError>
    where
        A: Serialize,
    {
        Ok(Self::new(kind, name, codec::encode(args)?))
    }

    /// Creates a call of a builtin operator.
    pub fn builtin<A>(name: impl Into<String>, args: &A) -> Result<Self, RpcError>
    where
        A: Serialize,
    {
        Self::encode(CallKind::Builtin, name, args)
    }

    /// Creates a call of a precompiled function.
    pub fn script<A>(qualified_name: impl Into<String>, args: &A) -> Result<Self, RpcError>
    where
        A: Serialize,
    {
        Self::encode(CallKind::Script, qualified_name, args)
    }

    /// Creates a call of a generic user function.
    pub fn udf<A>(name: impl Into<String>, args: &A) -> Result<Self, RpcError>
    where
        A: Serialize,
    {
        Self::encode(CallKind::Udf, name, args)
    }
}

/// Executes calls received from remote workers.
pub trait Executor: Send + Sync + 'static {
    /// Executes the call.
    ///
    /// `rpc` is the local RPC instance, which the function may use to issue
    /// further calls or to deserialize remote references passed as arguments.
    fn execute(&self, rpc: Rpc, call: Call) -> BoxFuture<'static, Result<Bytes, RpcError>>;
}

type Function = Arc<dyn Fn(Rpc, Bytes) -> BoxFuture<'static, Result<Bytes, RpcError>> + Send + Sync>;

/// Executor dispatching calls to functions registered by kind and name.
///
/// Clones share the registered functions.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: Arc<RwLock<HashMap<(CallKind, String), Function>>>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let functions = self.functions.read().unwrap();
        let mut names: Vec<_> = functions.keys().map(|(kind, name)| format!("{}:{}", kind, name)).collect();
        names.sort();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}

impl FunctionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an asynchronous function operating on serialized arguments and result.
    ///
    /// A previously registered function with the same kind and name is replaced.
    pub fn register<F, Fut>(&self, kind: CallKind, name: impl Into<String>, f: F)
    where
        F: Fn(Rpc, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, RpcError>> + Send + 'static,
    {
        let function: Function = Arc::new(move |rpc: Rpc, args: Bytes| f(rpc, args).boxed());
        self.functions.write().unwrap().insert((kind, name.into()), function);
    }

    /// Registers a synchronous function with typed arguments and result.
    ///
    /// Arguments and result are encoded with the default codec.
    /// An error returned by the function is reported to the caller as
    /// [RpcError::RemoteExecution].
    pub fn register_fn<A, R, F>(&self, kind: CallKind, name: impl Into<String>, f: F)
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Result<R, String> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.register(kind, name, move |_rpc, args| {
            let f = f.clone();
            async move {
                let args: A = codec::decode(&args)?;
                let ret = (*f)(args).map_err(RpcError::RemoteExecution)?;
                Ok::<_, RpcError>(codec::encode(&ret)?)
            }
        });
    }

    /// Returns whether a function is registered.
    pub fn contains(&self, kind: CallKind, name: &str) -> bool {
        self.functions.read().unwrap().contains_key(&(kind, name.to_string()))
    }
}

impl Executor for FunctionRegistry {
    fn execute(&self, rpc: Rpc, call: Call) -> BoxFuture<'static, Result<Bytes, RpcError>> {
        let function = self.functions.read().unwrap().get(&(call.kind, call.name.clone())).cloned();
        match function {
            Some(function) => (*function)(rpc, call.args),
            None => {
                let err = RpcError::RemoteExecution(format!("unknown {} function {}", call.kind, call.name));
                futures::future::ready(Err(err)).boxed()
            }
        }
    }
}
