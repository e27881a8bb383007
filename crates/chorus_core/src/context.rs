//! Process-wide coordination context and the hook surface the host calls.
//!
//! `CoreContext` is the explicit owner of everything the hooks and worker
//! threads share: configuration, membership, the commit barrier, clocks,
//! syncpoints and the trait handles to the host engine and the DMQ. The
//! host-integration glue holds the single `Arc` and registers the
//! [`HostHooks`] methods with its engine.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

use crate::clock::MonotonicClock;
use crate::commit;
use crate::config::CoreConfig;
use crate::ddl::{DdlCapture, ReplicatedDdl, SequenceDefaults, SetKind};
use crate::dmq::DmqEndpoint;
use crate::engine::HostEngine;
use crate::error::CommitError;
use crate::gid::Gid;
use crate::mask::{NodeId, NodeMask};
use crate::membership::{Membership, NodeStatus};
use crate::referee::Referee;
use crate::syncpoint::SyncpointTracker;

pub(crate) const HEARTBEAT_STREAM: &str = "hb";
pub(crate) const CONTROL_STREAM: &str = "ctl";
pub(crate) const DDD_STREAM: &str = "ddd";
pub(crate) const RESOLVER_STREAM: &str = "resolver";

/// Stream carrying transactions originated at `origin`.
pub(crate) fn apply_stream(origin: NodeId) -> String {
    format!("apply{origin}")
}

/// Reply stream a coordinator subscribes for its transaction.
pub(crate) fn xid_stream(xid: u64) -> String {
    format!("xid{xid}")
}

/// Who opened the session. Administrative and service sessions bypass the
/// online check so recovery can run against an offline cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
    User,
    Admin,
    Service,
}

#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub database: String,
    pub kind: SessionKind,
}

/// Per-transaction state on the coordinator side. Created at transaction
/// start, mutated by the hooks, consumed at commit; never outlives the
/// local transaction.
#[derive(Clone, Debug)]
pub struct CurrentTx {
    pub xid: u64,
    pub gid: Gid,
    pub is_distributed: bool,
    pub contains_dml: bool,
    /// User issued an explicit `PREPARE TRANSACTION`; the host finishes
    /// the prepared half through its own prepared-commit path.
    pub is_two_phase: bool,
    pub ddl_in_progress: bool,
    /// Captured under the membership lock at commit time.
    pub participants: NodeMask,
}

/// What the commit hook did with the transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Downgraded to a plain local commit (no DML or not distributed).
    Local,
    /// Replicated through the full three-phase protocol.
    Distributed { participants: NodeMask },
}

/// Statement classification surfaced by the host's utility hook. The core
/// never parses SQL; it only reacts to the shape.
#[derive(Clone, Copy, Debug)]
pub enum UtilityStatement<'a> {
    Set {
        kind: SetKind,
        name: &'a str,
        value: Option<&'a str>,
    },
    Ddl {
        query: &'a str,
        concurrent: bool,
    },
}

/// Engine hook surface. The core implements this; the host calls into it
/// from its transaction, executor, utility and sequence callbacks.
pub trait HostHooks {
    fn on_tx_start(&self, session: &SessionInfo) -> Result<CurrentTx, CommitError>;
    fn on_pre_prepare(&self, tx: &CurrentTx, database: &str) -> Result<(), CommitError>;
    fn on_commit(&self, tx: &mut CurrentTx) -> Result<CommitOutcome, CommitError>;
    /// Executor started; `writes_data` is true for INSERT/UPDATE/DELETE.
    fn on_exec_start(&self, tx: &mut CurrentTx, writes_data: bool);
    /// Executor finished one statement. Returns true when a captured DDL
    /// block just closed and the host should emit its end marker.
    fn on_exec_finish(&self, tx: &mut CurrentTx) -> bool;
    fn on_utility(&self, tx: &mut CurrentTx, stmt: UtilityStatement<'_>) -> Option<ReplicatedDdl>;
    /// `CREATE SEQUENCE` defaults for this node.
    fn sequence_defaults(&self, has_increment: bool, has_start: bool) -> SequenceDefaults;
    /// Position record to replicate on `nextval`, when configured.
    fn on_seq_nextval(&self, seq_id: u64, next: i64) -> Option<(u64, i64)>;
}

pub struct CoreContext {
    pub cfg: CoreConfig,
    pub membership: Membership,
    /// Shared for commits, exclusive for participant install; see the
    /// apply guard. Never nested inside the membership lock.
    pub commit_barrier: RwLock<()>,
    /// Gate refusing new commits while a barrier operation is pending.
    pub stop_new_commits: AtomicBool,
    pub shutdown: AtomicBool,
    pub clock: MonotonicClock,
    pub syncpoints: SyncpointTracker,
    pub ddl: DdlCapture,
    pub engine: Arc<dyn HostEngine>,
    pub dmq: Arc<dyn DmqEndpoint>,
}

impl CoreContext {
    pub fn new(
        cfg: CoreConfig,
        all_nodes: usize,
        engine: Arc<dyn HostEngine>,
        dmq: Arc<dyn DmqEndpoint>,
        referee: Option<Arc<dyn Referee>>,
    ) -> anyhow::Result<Arc<CoreContext>> {
        cfg.validate()?;
        if all_nodes > cfg.max_nodes {
            anyhow::bail!(
                "catalog lists {all_nodes} nodes but max_nodes is {}",
                cfg.max_nodes
            );
        }
        let clock = MonotonicClock::new();
        let membership = Membership::new(&cfg, all_nodes, referee);
        membership.configure(clock.now_us());
        let ctx = CoreContext {
            membership,
            commit_barrier: RwLock::new(()),
            stop_new_commits: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            syncpoints: SyncpointTracker::new(cfg.node_id),
            ddl: DdlCapture::new(&cfg),
            engine,
            dmq,
            clock,
            cfg,
        };
        Ok(Arc::new(ctx))
    }

    pub fn self_id(&self) -> NodeId {
        self.cfg.node_id
    }

    pub fn all_nodes(&self) -> usize {
        self.membership.all_nodes()
    }

    /// Every configured peer, dead or alive.
    pub fn peers(&self) -> NodeMask {
        NodeMask::full(self.all_nodes()).without(self.self_id())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl HostHooks for CoreContext {
    fn on_tx_start(&self, session: &SessionInfo) -> Result<CurrentTx, CommitError> {
        let is_distributed =
            session.kind == SessionKind::User && session.database == self.cfg.database;
        if is_distributed {
            let status = self.membership.status();
            if status != NodeStatus::Online {
                // Reject user transactions at an offline cluster; service
                // sessions stay allowed so recovery can make progress.
                return Err(CommitError::ClusterNotOnline(status));
            }
        }
        let xid = self.engine.begin();
        Ok(CurrentTx {
            xid,
            gid: Gid::new(self.self_id(), xid),
            is_distributed,
            contains_dml: false,
            is_two_phase: false,
            ddl_in_progress: false,
            participants: NodeMask::EMPTY,
        })
    }

    fn on_pre_prepare(&self, tx: &CurrentTx, database: &str) -> Result<(), CommitError> {
        if tx.is_distributed && database != self.cfg.database {
            return Err(CommitError::WrongDatabase {
                expected: self.cfg.database.clone(),
                got: database.to_string(),
            });
        }
        Ok(())
    }

    fn on_commit(&self, tx: &mut CurrentTx) -> Result<CommitOutcome, CommitError> {
        if !tx.is_distributed || !tx.contains_dml {
            return Ok(CommitOutcome::Local);
        }
        if tx.is_two_phase {
            // Explicit PREPARE: the commit command only closes the local
            // half; the host drives the prepared transaction itself.
            return Ok(CommitOutcome::Local);
        }
        commit::three_phase_commit(self, tx)
    }

    fn on_exec_start(&self, tx: &mut CurrentTx, writes_data: bool) {
        if writes_data {
            tx.contains_dml = true;
        }
    }

    fn on_exec_finish(&self, tx: &mut CurrentTx) -> bool {
        std::mem::take(&mut tx.ddl_in_progress)
    }

    fn on_utility(&self, tx: &mut CurrentTx, stmt: UtilityStatement<'_>) -> Option<ReplicatedDdl> {
        match stmt {
            UtilityStatement::Set { kind, name, value } => {
                self.ddl.process_set(kind, name, value);
                None
            }
            UtilityStatement::Ddl { query, concurrent } => {
                let kind = if concurrent {
                    crate::ddl::DdlKind::Concurrent
                } else {
                    // Transactional DDL rides the normal commit path.
                    tx.contains_dml = true;
                    tx.ddl_in_progress = true;
                    crate::ddl::DdlKind::Transactional
                };
                Some(self.ddl.replicated_ddl(query, kind))
            }
        }
    }

    fn sequence_defaults(&self, has_increment: bool, has_start: bool) -> SequenceDefaults {
        self.ddl.adjust_create_sequence(has_increment, has_start)
    }

    fn on_seq_nextval(&self, seq_id: u64, next: i64) -> Option<(u64, i64)> {
        self.ddl.seq_nextval_record(seq_id, next)
    }
}
