//! Worker identity.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::RpcError;

/// Numeric id of a worker.
pub type WorkerId = u32;

/// Maximum length of a worker name in bytes.
pub const MAX_NAME_LENGTH: usize = 128;

/// Identity of a member of the cluster.
///
/// Created once per worker when its agent is constructed and never changed
/// afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Unique name of the worker.
    pub name: String,
    /// Unique numeric id of the worker.
    pub id: WorkerId,
}

impl WorkerInfo {
    /// Creates a worker identity, validating the name.
    ///
    /// Names must be non-empty, at most [MAX_NAME_LENGTH] bytes long and consist
    /// of ASCII alphanumerics and the characters `_`, `-`, `:` and `.`.
    pub fn new(name: impl Into<String>, id: WorkerId) -> Result<Self, RpcError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RpcError::InvalidArgument("worker name must not be empty".into()));
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(RpcError::InvalidArgument(format!(
                "worker name {name:?} exceeds {MAX_NAME_LENGTH} bytes"
            )));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.')) {
            return Err(RpcError::InvalidArgument(format!("worker name {name:?} contains invalid characters")));
        }
        Ok(Self { name, id })
    }
}

impl fmt::Display for WorkerInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", &self.name, self.id)
    }
}
