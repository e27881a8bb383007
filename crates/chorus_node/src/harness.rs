//! Embedded multi-node cluster.
//!
//! Runs N coordination cores in one process, wired over the in-memory
//! message bus with fault injection: node stop/restart (disk survives),
//! link cuts and single-node partitions (which also sever the referee).
//! Integration tests and the demo binary drive clusters through this type.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chorus_core::{
    CommitError, CommitOutcome, CoreConfig, CoreContext, ClusterRuntime, HostHooks, MemoryDmqBus,
    NodeId, NodeStatus, Referee, SessionInfo, SessionKind,
};

use crate::engine::{EngineRegistry, MemEngine, Op};

/// Referee proxy that models network reachability: a partitioned node
/// cannot talk to the referee either.
pub struct HarnessReferee {
    inner: chorus_core::MemoryReferee,
    blocked: Mutex<std::collections::HashSet<NodeId>>,
}

impl HarnessReferee {
    fn new() -> Arc<HarnessReferee> {
        Arc::new(HarnessReferee {
            inner: chorus_core::MemoryReferee::new(),
            blocked: Mutex::new(Default::default()),
        })
    }

    fn set_blocked(&self, node: NodeId, blocked: bool) {
        let mut set = self.blocked.lock().unwrap();
        if blocked {
            set.insert(node);
        } else {
            set.remove(&node);
        }
    }

    fn check(&self, node: NodeId) -> anyhow::Result<()> {
        if self.blocked.lock().unwrap().contains(&node) {
            anyhow::bail!("referee unreachable from node {node}");
        }
        Ok(())
    }
}

impl Referee for HarnessReferee {
    fn request_grant(&self, node: NodeId, generation: u64) -> anyhow::Result<bool> {
        self.check(node)?;
        self.inner.request_grant(node, generation)
    }

    fn surrender(&self, node: NodeId) -> anyhow::Result<()> {
        self.check(node)?;
        self.inner.surrender(node)
    }

    fn winner(&self) -> anyhow::Result<Option<(NodeId, u64)>> {
        self.inner.winner()
    }
}

pub struct EmbeddedNode {
    pub ctx: Arc<CoreContext>,
    pub engine: Arc<MemEngine>,
    runtime: Option<ClusterRuntime>,
}

impl EmbeddedNode {
    fn session(&self) -> SessionInfo {
        SessionInfo {
            database: self.ctx.cfg.database.clone(),
            kind: SessionKind::User,
        }
    }

    pub fn status(&self) -> NodeStatus {
        self.ctx.membership.status()
    }

    /// One user transaction writing the given key/value pairs.
    pub fn put(&self, pairs: &[(&str, i64)]) -> Result<CommitOutcome, CommitError> {
        let ops = pairs
            .iter()
            .map(|(key, value)| Op::Put {
                key: key.to_string(),
                value: *value,
            })
            .collect::<Vec<_>>();
        self.execute(ops)
    }

    /// One user transaction applying the given deltas (a transfer).
    pub fn add(&self, deltas: &[(&str, i64)]) -> Result<CommitOutcome, CommitError> {
        let ops = deltas
            .iter()
            .map(|(key, delta)| Op::Add {
                key: key.to_string(),
                delta: *delta,
            })
            .collect::<Vec<_>>();
        self.execute(ops)
    }

    fn execute(&self, ops: Vec<Op>) -> Result<CommitOutcome, CommitError> {
        let mut tx = self.ctx.on_tx_start(&self.session())?;
        for op in ops {
            if self.engine.stage(tx.xid, op).is_err() {
                self.engine.rollback_active(tx.xid);
                return Err(CommitError::WentOffline);
            }
        }
        self.ctx.on_exec_start(&mut tx, true);
        self.ctx.on_exec_finish(&mut tx);
        let result = self.ctx.on_commit(&mut tx);
        if result.is_err() {
            self.engine.rollback_active(tx.xid);
        }
        result
    }

    pub fn read(&self, key: &str) -> Option<i64> {
        self.engine.read(key)
    }
}

pub struct EmbeddedCluster {
    n: usize,
    bus: MemoryDmqBus,
    referee: Arc<HarnessReferee>,
    registry: Arc<EngineRegistry>,
    nodes: HashMap<NodeId, EmbeddedNode>,
    /// Syncpoint state that would live on disk; restored on restart.
    syncpoints: HashMap<NodeId, chorus_core::syncpoint::SyncpointSnapshot>,
}

impl EmbeddedCluster {
    /// Start an n-node cluster and wait for every node to come online.
    pub fn start(n: usize) -> anyhow::Result<EmbeddedCluster> {
        let mut cluster = EmbeddedCluster::start_without_waiting(n)?;
        for id in 1..=n as NodeId {
            anyhow::ensure!(
                cluster.wait_for_status(id, NodeStatus::Online, Duration::from_secs(30)),
                "node {id} did not come online"
            );
        }
        Ok(cluster)
    }

    pub fn start_without_waiting(n: usize) -> anyhow::Result<EmbeddedCluster> {
        let mut cluster = EmbeddedCluster {
            n,
            bus: MemoryDmqBus::new(),
            referee: HarnessReferee::new(),
            registry: EngineRegistry::new(),
            nodes: HashMap::new(),
            syncpoints: HashMap::new(),
        };
        for id in 1..=n as NodeId {
            cluster.boot_node(id)?;
        }
        Ok(cluster)
    }

    fn boot_node(&mut self, id: NodeId) -> anyhow::Result<()> {
        let engine = match self.registry.get(id) {
            Some(engine) => engine,
            None => MemEngine::new(id, self.registry.clone()),
        };
        let cfg = CoreConfig {
            node_id: id,
            max_nodes: self.n,
            // Two-node clusters arbitrate splits through the referee.
            referee_connstring: if self.n == 2 {
                "memory://referee".to_string()
            } else {
                String::new()
            },
            ..CoreConfig::default()
        };
        let referee: Option<Arc<dyn Referee>> = if cfg.referee_connstring.is_empty() {
            None
        } else {
            Some(self.referee.clone())
        };
        let ctx = CoreContext::new(
            cfg,
            self.n,
            engine.clone(),
            self.bus.endpoint(id),
            referee,
        )?;
        if let Some(snapshot) = self.syncpoints.get(&id) {
            ctx.syncpoints.restore(snapshot);
        }
        let runtime = ClusterRuntime::start(ctx.clone());
        self.nodes.insert(
            id,
            EmbeddedNode {
                ctx,
                engine,
                runtime: Some(runtime),
            },
        );
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> &EmbeddedNode {
        &self.nodes[&id]
    }

    /// Engine ("disk") of a node, available even while the node is
    /// stopped. Tests use this to plant pre-crash state.
    pub fn node_engine(&self, id: NodeId) -> Arc<MemEngine> {
        self.registry.get(id).expect("engine never created")
    }

    /// Kill a node's process. The engine (the "disk") survives.
    pub fn stop_node(&mut self, id: NodeId) {
        tracing::info!(node = id, "stopping node");
        self.bus.stop_node(id);
        if let Some(mut node) = self.nodes.remove(&id) {
            node.engine.begin_shutdown();
            if let Some(runtime) = node.runtime.take() {
                runtime.shutdown();
            }
            self.syncpoints.insert(id, node.ctx.syncpoints.snapshot());
            node.engine.crash();
        }
    }

    /// Start a previously stopped node from its surviving disk state.
    pub fn restart_node(&mut self, id: NodeId) -> anyhow::Result<()> {
        tracing::info!(node = id, "restarting node");
        self.bus.start_node(id);
        self.boot_node(id)
    }

    /// Isolate one node from every peer and from the referee.
    pub fn partition_node(&mut self, id: NodeId) {
        tracing::info!(node = id, "cutting node off");
        for other in 1..=self.n as NodeId {
            if other != id {
                self.bus.set_link(id, other, false);
            }
        }
        self.referee.set_blocked(id, true);
    }

    pub fn heal_node(&mut self, id: NodeId) {
        tracing::info!(node = id, "healing node");
        for other in 1..=self.n as NodeId {
            if other != id {
                self.bus.set_link(id, other, true);
            }
        }
        self.referee.set_blocked(id, false);
    }

    pub fn wait_for_status(&self, id: NodeId, status: NodeStatus, timeout: Duration) -> bool {
        self.wait_until(timeout, || {
            self.nodes
                .get(&id)
                .map(|n| n.status() == status)
                .unwrap_or(false)
        })
    }

    pub fn wait_until(&self, timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        false
    }

    pub fn shutdown(mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.stop_node(id);
        }
    }
}
