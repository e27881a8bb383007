//! Runtime configuration for a cluster node.
//!
//! All knobs have defaults; `validate` is called once at startup and a
//! violation refuses to start the node.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::mask::{NodeId, MAX_NODES};

/// Smallest sensible per-peer apply queue.
const MIN_QUEUE_SIZE: usize = 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// This node's identity, `[1..=max_nodes]`.
    pub node_id: NodeId,
    /// Database the cluster replicates; sessions against any other database
    /// are refused at pre-prepare.
    pub database: String,
    /// Period of broadcasting heartbeats to all peers.
    pub heartbeat_send_timeout_ms: u64,
    /// Silence window after which a peer is assumed dead.
    pub heartbeat_recv_timeout_ms: u64,
    /// Maximal number of cluster nodes.
    pub max_nodes: usize,
    /// Per-peer apply queue capacity in bytes.
    pub queue_size: usize,
    /// Transactions larger than this (KiB) are spilled to disk by the
    /// receiver rather than buffered.
    pub trans_spill_threshold_kb: usize,
    /// Upper bound on dynamic apply workers.
    pub max_workers: usize,
    /// Enforce globally monotonic sequence values.
    pub monotonic_sequences: bool,
    /// Skip replication of tables without a primary key.
    pub ignore_tables_without_pk: bool,
    /// Referee connection string; empty disables referee arbitration.
    pub referee_connstring: String,
    /// Functions executed remotely on all nodes instead of replicating
    /// their effects.
    pub remote_functions: Vec<String>,
    /// Pretend to be a plain single-node database: local sequences, fewer
    /// notices. Compatibility flag.
    pub volkswagen_mode: bool,
    /// Period of the distributed deadlock check.
    pub deadlock_detect_interval_ms: u64,
    /// Minimal spacing between syncpoint records.
    pub syncpoint_interval_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> CoreConfig {
        CoreConfig {
            node_id: 0,
            database: "chorus".to_string(),
            heartbeat_send_timeout_ms: 200,
            heartbeat_recv_timeout_ms: 1000,
            max_nodes: 6,
            queue_size: 10 * 1024 * 1024,
            trans_spill_threshold_kb: 100 * 1024,
            max_workers: 100,
            monotonic_sequences: false,
            ignore_tables_without_pk: false,
            referee_connstring: String::new(),
            remote_functions: vec!["lo_create".to_string(), "lo_unlink".to_string()],
            volkswagen_mode: false,
            deadlock_detect_interval_ms: 1000,
            syncpoint_interval_ms: 10_000,
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_nodes < 1 || self.max_nodes > MAX_NODES {
            return Err(ConfigError::MaxNodes {
                got: self.max_nodes,
                limit: MAX_NODES,
            });
        }
        if self.node_id < 1 || self.node_id as usize > self.max_nodes {
            return Err(ConfigError::NodeId {
                got: self.node_id,
                max: self.max_nodes,
            });
        }
        if self.heartbeat_send_timeout_ms == 0
            || self.heartbeat_recv_timeout_ms < self.heartbeat_send_timeout_ms
        {
            return Err(ConfigError::Heartbeat {
                send_ms: self.heartbeat_send_timeout_ms,
                recv_ms: self.heartbeat_recv_timeout_ms,
            });
        }
        if self.queue_size < MIN_QUEUE_SIZE {
            return Err(ConfigError::QueueSize {
                got: self.queue_size,
                min: MIN_QUEUE_SIZE,
            });
        }
        // One apply worker per peer, plus heartbeat/service/deadlock/resolver.
        let workers_required = 2 * self.max_nodes + 1;
        if self.max_workers < workers_required {
            return Err(ConfigError::Workers {
                got: self.max_workers,
                need: workers_required,
            });
        }
        Ok(())
    }
}
