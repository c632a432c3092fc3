//! Errors of RPC calls and remote references.
//!
//! Errors are clonable and serializable so that a failure on the destination
//! worker can be transmitted back in an exception response and handed to
//! every waiter of a [future](crate::RpcFuture).

use serde::{Deserialize, Serialize};
use std::{error::Error, fmt, time::Duration};

use crate::{
    codec::{DeserializationError, SerializationError},
    RRefId, WorkerId,
};

/// Moving a message to or from a worker failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    /// The destination worker cannot be reached or has failed.
    Unreachable(WorkerId),
    /// No response was received within the timeout.
    Timeout(Duration),
    /// The local agent has been shut down.
    Closed,
    /// An IO error occurred on the physical connection.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unreachable(id) => write!(f, "worker {} is unreachable", id),
            Self::Timeout(timeout) => write!(f, "no response within {:?}", timeout),
            Self::Closed => write!(f, "agent is closed"),
            Self::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// An RPC or remote reference operation failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcError {
    /// Destination unreachable, timed out or the agent is closed.
    Transport(TransportError),
    /// The body of the call raised an error on the destination worker.
    RemoteExecution(String),
    /// The owner has no record of the referenced RRef.
    UnknownRRef(RRefId),
    /// New calls are rejected because shutdown has begun.
    ShutdownInProgress,
    /// No worker with the specified name or id is known.
    UnknownWorker(String),
    /// A local value was requested from an RRef that is not owned locally.
    NotOwner(RRefId),
    /// An unexpected message was received.
    Protocol(String),
    /// Serializing a payload failed.
    Serialization(String),
    /// Deserializing a payload failed.
    Deserialization(String),
    /// An argument was invalid.
    InvalidArgument(String),
}

impl RpcError {
    /// True, if the error was caused by the transport.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "transport error: {}", err),
            Self::RemoteExecution(msg) => write!(f, "remote execution failed: {}", msg),
            Self::UnknownRRef(id) => write!(f, "unknown {}", id),
            Self::ShutdownInProgress => write!(f, "shutdown in progress"),
            Self::UnknownWorker(worker) => write!(f, "unknown worker {}", worker),
            Self::NotOwner(id) => write!(f, "{} is not owned by this worker", id),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Serialization(msg) => write!(f, "serialization error: {}", msg),
            Self::Deserialization(msg) => write!(f, "deserialization error: {}", msg),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

impl Error for RpcError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<SerializationError> for RpcError {
    fn from(err: SerializationError) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<DeserializationError> for RpcError {
    fn from(err: DeserializationError) -> Self {
        Self::Deserialization(err.to_string())
    }
}
