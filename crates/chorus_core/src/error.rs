//! Error taxonomy for the coordination core.
//!
//! Domain outcomes the host has to match on are explicit sum types; plumbing
//! failures inside workers travel as `anyhow::Error` and are logged where
//! they are swallowed.

use thiserror::Error;

use crate::mask::NodeId;
use crate::membership::NodeStatus;

/// Failures of the distributed commit path. The host-integration layer is
/// the only place that translates these back into the engine's abort
/// mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    /// Transaction started while the node is not online. Retriable.
    #[error("cluster node is not online: current status {0}")]
    ClusterNotOnline(NodeStatus),

    /// Session is connected to a database other than the configured one.
    #[error("configured to work with database {expected:?}, session uses {got:?}")]
    WrongDatabase { expected: String, got: String },

    /// The node left the online state while the commit was in flight.
    /// Retriable once the node is back online.
    #[error("node went offline during commit")]
    WentOffline,

    /// A participant voted to abort or disappeared before voting. Carries
    /// the node that failed; the local transaction has been rolled back.
    #[error("transaction failed to prepare on node {0}")]
    PrepareFailed(NodeId),

    /// Process shutdown interrupted the commit before any outcome was
    /// reached.
    #[error("commit interrupted by shutdown")]
    Shutdown,
}

/// Fatal wire-format violations. A decode error kills the DMQ connection it
/// arrived on and the peer is treated as disconnected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown arbiter message code {0}")]
    UnknownCode(u8),

    #[error("truncated arbiter message: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("arbiter message carries unparsable gid {0:?}")]
    BadGid(String),
}

/// Startup configuration violations; the node refuses to start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("node_id must be in [1..={max}], got {got}")]
    NodeId { got: u8, max: usize },

    #[error("max_nodes must be in [1..={limit}], got {got}")]
    MaxNodes { got: usize, limit: usize },

    #[error("heartbeat timeouts must be positive and recv >= send (send={send_ms}ms recv={recv_ms}ms)")]
    Heartbeat { send_ms: u64, recv_ms: u64 },

    #[error("queue_size must be at least {min} bytes, got {got}")]
    QueueSize { got: usize, min: usize },

    #[error("max_workers={got} is too small: apply and service workers need at least {need}")]
    Workers { got: usize, need: usize },
}
