//! RPC and remote reference configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// RPC agent and remote reference configuration.
///
/// In most cases the default configuration ([Cfg::default]) is fine and should be used.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Cfg {
    /// Time after which a request without response fails with a
    /// [timeout error](crate::TransportError::Timeout).
    ///
    /// By default this is 60 seconds.
    /// This must not be zero.
    pub rpc_timeout: Duration,
    /// Maximum time shutdown waits for all owned remote references to be released
    /// by their users and for all workers to reach the shutdown barrier.
    ///
    /// Owner entries still referenced when this expires are collected forcibly.
    /// By default this is 60 seconds.
    /// This must not be zero.
    pub shutdown_timeout: Duration,
    /// Time after which unacknowledged state of an owned remote reference
    /// that showed no activity is released.
    ///
    /// This covers forks that were pickled but never accepted and values that
    /// were referenced by a fork request but never provided.
    /// Forks confirmed for a provided value are kept regardless.
    /// By default this is disabled.
    pub fork_timeout: Option<Duration>,
    /// Interval of the sweep checking for expired forks.
    ///
    /// Only used when [fork_timeout](Self::fork_timeout) is set.
    /// By default this is 1 second.
    pub sweep_interval: Duration,
    /// Record remote reference protocol events for inspection.
    ///
    /// By default this is disabled.
    pub record_events: bool,
    /// Maximum time the TCP transport tries to connect to a peer.
    ///
    /// By default this is 30 seconds.
    pub connect_timeout: Duration,
    /// Maximum size of a frame received over the TCP transport in bytes.
    ///
    /// By default this is 64 MB.
    /// This must be at least 64 bytes.
    pub max_frame_length: usize,
}

impl Default for Cfg {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),
            fork_timeout: None,
            sweep_interval: Duration::from_secs(1),
            record_events: false,
            connect_timeout: Duration::from_secs(30),
            max_frame_length: 64 * 1024 * 1024,
        }
    }
}

impl Cfg {
    /// Checks the configuration.
    ///
    /// # Panics
    /// Panics if the configuration is invalid.
    pub(crate) fn check(&self) {
        if self.rpc_timeout.is_zero() {
            panic!("RPC timeout must not be zero");
        }

        if self.shutdown_timeout.is_zero() {
            panic!("shutdown timeout must not be zero");
        }

        if self.fork_timeout.is_some() && self.sweep_interval.is_zero() {
            panic!("sweep interval must not be zero when fork timeout is enabled");
        }

        if self.max_frame_length < 64 {
            panic!("maximum frame length must be at least 64 bytes");
        }
    }
}
