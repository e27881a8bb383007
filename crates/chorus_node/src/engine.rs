//! In-memory host engine backing embedded cluster nodes.
//!
//! Implements the `HostEngine` seam with a small keyed store: buffered
//! writes per transaction, key locks taken at prepare time (in statement
//! order, which is what makes cross-node deadlocks possible), prepared
//! transaction bookkeeping and terminal outcomes for status polls. One
//! engine instance models one node's durable state; `crash` models a
//! process restart that keeps the disk.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use chorus_core::{Gid, HostEngine, NodeId, PreparedState, ResolveOutcome, WaitEdge};

/// One buffered mutation. `Add` exists so concurrent transfers stay
/// sum-preserving: deltas are applied under the commit lock, not computed
/// from a stale read.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Op {
    Put { key: String, value: i64 },
    Add { key: String, delta: i64 },
}

impl Op {
    fn key(&self) -> &str {
        match self {
            Op::Put { key, .. } | Op::Add { key, .. } => key,
        }
    }
}

#[derive(Default)]
struct TxBody {
    ops: Vec<Op>,
}

struct PreparedTx {
    state: PreparedState,
    ops: Vec<Op>,
    /// Keys locked by this transaction.
    keys: Vec<String>,
    /// Owned by a live local coordinator; not an orphan and not a valid
    /// victim target.
    inflight: bool,
}

#[derive(Default)]
struct EngineState {
    kv: BTreeMap<String, i64>,
    active: HashMap<u64, TxBody>,
    /// Key -> holder. Locks are acquired at prepare time and held until
    /// the prepared transaction finishes.
    locks: HashMap<String, Gid>,
    /// Waiter -> holder, for the deadlock detector's local snapshot.
    waiting: HashMap<Gid, Gid>,
    prepared: HashMap<Gid, PreparedTx>,
    /// Terminal outcomes, kept for status polls.
    outcomes: HashMap<Gid, bool>,
    /// Transactions told to abort; lock waiters check this on wake-up.
    doomed: HashSet<Gid>,
    /// The node is stopping; every new or blocked lock acquisition fails
    /// so apply executors can drain.
    closing: bool,
}

/// Shared map of engines, standing in for the replication connections a
/// recovering node would open to its donor.
#[derive(Default)]
pub struct EngineRegistry {
    engines: RwLock<HashMap<NodeId, Arc<MemEngine>>>,
}

impl EngineRegistry {
    pub fn new() -> Arc<EngineRegistry> {
        Arc::new(EngineRegistry::default())
    }

    pub fn register(&self, node: NodeId, engine: Arc<MemEngine>) {
        self.engines.write().unwrap().insert(node, engine);
    }

    pub fn get(&self, node: NodeId) -> Option<Arc<MemEngine>> {
        self.engines.read().unwrap().get(&node).cloned()
    }
}

pub struct MemEngine {
    node_id: NodeId,
    next_xid: AtomicU64,
    state: Mutex<EngineState>,
    lock_released: Condvar,
    registry: Arc<EngineRegistry>,
}

impl MemEngine {
    pub fn new(node_id: NodeId, registry: Arc<EngineRegistry>) -> Arc<MemEngine> {
        let engine = Arc::new(MemEngine {
            node_id,
            next_xid: AtomicU64::new(0),
            state: Mutex::new(EngineState::default()),
            lock_released: Condvar::new(),
            registry: registry.clone(),
        });
        registry.register(node_id, engine.clone());
        engine
    }

    /// Buffer a mutation into a running transaction.
    pub fn stage(&self, xid: u64, op: Op) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .active
            .get_mut(&xid)
            .with_context(|| format!("no active transaction {xid}"))?
            .ops
            .push(op);
        Ok(())
    }

    /// Committed value of `key`.
    pub fn read(&self, key: &str) -> Option<i64> {
        self.state.lock().unwrap().kv.get(key).copied()
    }

    /// Consistent sum over all keys with the given prefix.
    pub fn sum_prefix(&self, prefix: &str) -> i64 {
        let state = self.state.lock().unwrap();
        state
            .kv
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| *v)
            .sum()
    }

    /// Drop a transaction that never reached prepare.
    pub fn rollback_active(&self, xid: u64) {
        self.state.lock().unwrap().active.remove(&xid);
    }

    /// Fail every pending and future lock acquisition with an abort
    /// verdict; called when the node is being stopped so apply executors
    /// can drain.
    pub fn begin_shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.closing = true;
        self.lock_released.notify_all();
    }

    /// Model a process crash that keeps the disk: running transactions and
    /// their session state vanish, prepared transactions survive with
    /// their locks and lose their owners.
    pub fn crash(&self) {
        let mut state = self.state.lock().unwrap();
        state.active.clear();
        state.waiting.clear();
        state.doomed.clear();
        state.closing = false;
        for prepared in state.prepared.values_mut() {
            prepared.inflight = false;
        }
        self.lock_released.notify_all();
    }

    /// Take the keys for `gid` in statement order, blocking on conflicts.
    /// Returns an empty vector when the transaction was doomed (or the
    /// node started shutting down) while waiting.
    fn lock_keys(&self, gid: Gid, ops: &[Op]) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        let mut state = self.state.lock().unwrap();
        for op in ops {
            let key = op.key().to_string();
            if keys.contains(&key) {
                continue;
            }
            loop {
                if state.closing || state.doomed.contains(&gid) {
                    Self::release_locked(&mut state, gid, &keys);
                    state.doomed.remove(&gid);
                    return Vec::new();
                }
                match state.locks.get(&key).copied() {
                    None => {
                        state.locks.insert(key.clone(), gid);
                        break;
                    }
                    Some(holder) if holder == gid => break,
                    Some(holder) => {
                        state.waiting.insert(gid, holder);
                        state = self.lock_released.wait(state).unwrap();
                        state.waiting.remove(&gid);
                    }
                }
            }
            keys.push(key);
        }
        keys
    }

    fn release_locked(state: &mut EngineState, gid: Gid, keys: &[String]) {
        for key in keys {
            if state.locks.get(key) == Some(&gid) {
                state.locks.remove(key);
            }
        }
    }

    fn install_prepared(&self, gid: Gid, ops: Vec<Op>, inflight: bool) -> bool {
        let had_ops = !ops.is_empty();
        let keys = self.lock_keys(gid, &ops);
        if had_ops && keys.is_empty() {
            tracing::debug!(gid = %gid, "prepare refused: transaction doomed");
            return false;
        }
        let mut state = self.state.lock().unwrap();
        state.prepared.insert(
            gid,
            PreparedTx {
                state: PreparedState::Prepared,
                ops,
                keys,
                inflight,
            },
        );
        true
    }
}

impl HostEngine for MemEngine {
    fn begin(&self) -> u64 {
        let xid = self.next_xid.fetch_add(1, Ordering::AcqRel) + 1;
        self.state
            .lock()
            .unwrap()
            .active
            .insert(xid, TxBody::default());
        xid
    }

    fn changeset(&self, xid: u64) -> anyhow::Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let body = state
            .active
            .get(&xid)
            .with_context(|| format!("no active transaction {xid}"))?;
        serde_json::to_vec(&body.ops).context("encode change set")
    }

    fn prepare(&self, xid: u64, gid: Gid) -> anyhow::Result<bool> {
        let ops = {
            let mut state = self.state.lock().unwrap();
            match state.active.remove(&xid) {
                Some(body) => body.ops,
                None => anyhow::bail!("no active transaction {xid}"),
            }
        };
        Ok(self.install_prepared(gid, ops, true))
    }

    fn apply_prepare(&self, gid: Gid, changeset: &[u8]) -> anyhow::Result<bool> {
        let ops: Vec<Op> = serde_json::from_slice(changeset).context("decode change set")?;
        // Owned by the apply session until the outcome frame arrives or
        // the origin detaches.
        Ok(self.install_prepared(gid, ops, true))
    }

    fn set_prepared_state(&self, gid: Gid, new_state: PreparedState) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let prepared = state
            .prepared
            .get_mut(&gid)
            .with_context(|| format!("no prepared transaction {gid}"))?;
        prepared.state = new_state;
        Ok(())
    }

    fn finish_prepared(&self, gid: Gid, commit: bool) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(prepared) = state.prepared.remove(&gid) else {
            if state.outcomes.contains_key(&gid) {
                // Already finished; repeated resolution is a no-op.
                return Ok(());
            }
            anyhow::bail!("no prepared transaction {gid}");
        };
        if commit {
            for op in &prepared.ops {
                match op {
                    Op::Put { key, value } => {
                        state.kv.insert(key.clone(), *value);
                    }
                    Op::Add { key, delta } => {
                        *state.kv.entry(key.clone()).or_insert(0) += delta;
                    }
                }
            }
        }
        Self::release_locked(&mut state, gid, &prepared.keys);
        state.outcomes.insert(gid, commit);
        state.doomed.remove(&gid);
        self.lock_released.notify_all();
        Ok(())
    }

    fn prepared_state(&self, gid: Gid) -> Option<PreparedState> {
        self.state
            .lock()
            .unwrap()
            .prepared
            .get(&gid)
            .map(|p| p.state)
    }

    fn orphaned_prepared(&self) -> Vec<Gid> {
        let state = self.state.lock().unwrap();
        state
            .prepared
            .iter()
            .filter(|(_, p)| !p.inflight)
            .map(|(gid, _)| *gid)
            .collect()
    }

    fn disown(&self, gid: Gid) {
        let mut state = self.state.lock().unwrap();
        if let Some(prepared) = state.prepared.get_mut(&gid) {
            prepared.inflight = false;
        }
    }

    fn disown_origin(&self, origin: NodeId) {
        let mut state = self.state.lock().unwrap();
        for (gid, prepared) in state.prepared.iter_mut() {
            if gid.origin == origin {
                prepared.inflight = false;
            }
        }
    }

    fn gid_outcome(&self, gid: Gid) -> ResolveOutcome {
        match self.state.lock().unwrap().outcomes.get(&gid) {
            Some(true) => ResolveOutcome::Commit,
            Some(false) => ResolveOutcome::Abort,
            None => ResolveOutcome::Unknown,
        }
    }

    fn wait_graph(&self) -> Vec<WaitEdge> {
        let state = self.state.lock().unwrap();
        state
            .waiting
            .iter()
            .map(|(waiter, holder)| WaitEdge {
                waiter_xid: waiter.xid,
                holder_xid: holder.xid,
                waiter_gid: Some(*waiter),
                holder_gid: Some(*holder),
            })
            .collect()
    }

    fn abort(&self, gid: Gid) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(prepared) = state.prepared.get(&gid) {
            if prepared.inflight && gid.origin == self.node_id {
                // The local coordinator owns the outcome; the abort will
                // reach it as a vote from the participants.
                return Ok(());
            }
            // Applied copies roll back outright: the abort instruction is
            // authoritative for them.
            drop(state);
            return self.finish_prepared(gid, false);
        }
        if state.waiting.contains_key(&gid)
            || (gid.origin == self.node_id && state.active.contains_key(&gid.xid))
        {
            state.doomed.insert(gid);
            if gid.origin == self.node_id {
                state.active.remove(&gid.xid);
            }
            self.lock_released.notify_all();
        }
        Ok(())
    }

    fn catch_up(&self, donor: NodeId) -> anyhow::Result<()> {
        let donor_engine = self
            .registry
            .get(donor)
            .with_context(|| format!("donor node {donor} is not running"))?;
        let (kv, outcomes) = {
            let donor_state = donor_engine.state.lock().unwrap();
            (donor_state.kv.clone(), donor_state.outcomes.clone())
        };
        let mut state = self.state.lock().unwrap();
        state.kv = kv;
        state.outcomes.extend(outcomes);
        tracing::info!(donor, keys = state.kv.len(), "caught up from donor");
        Ok(())
    }
}
