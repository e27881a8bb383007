//! Host engine seam: the local transaction machinery the core drives.
//!
//! The SQL engine, storage and local two-phase commit live outside the
//! core; everything the coordinator, applier, resolver and deadlock
//! detector need from them goes through this trait.

use serde::{Deserialize, Serialize};

use crate::gid::Gid;
use crate::mask::NodeId;
use crate::messages::ResolveOutcome;

/// Visible states of a locally prepared transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreparedState {
    Prepared,
    Precommitted,
}

/// One edge of the local wait-for graph: `waiter` blocks on a lock held by
/// `holder`. Gids are present for distributed transactions only; purely
/// local edges are the host's problem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitEdge {
    pub waiter_xid: u64,
    pub holder_xid: u64,
    pub waiter_gid: Option<Gid>,
    pub holder_gid: Option<Gid>,
}

/// Local two-phase commit and lock-manager surface consumed by the core.
///
/// All methods are callable from any worker thread. Implementations must
/// not call back into the core.
pub trait HostEngine: Send + Sync {
    /// Start a local transaction and return its xid. Xids are unique for
    /// the life of the process.
    fn begin(&self) -> u64;

    /// Serialized change set of the running transaction, forwarded to
    /// participants with the `PREPARE` frame. This is the logical-decoder
    /// seam.
    fn changeset(&self, xid: u64) -> anyhow::Result<Vec<u8>>;

    /// `PREPARE TRANSACTION` of the running local transaction under `gid`.
    /// `false` means the engine refused (constraint violation etc.); the
    /// transaction is already rolled back in that case.
    fn prepare(&self, xid: u64, gid: Gid) -> anyhow::Result<bool>;

    /// Receiver side: apply a replicated change set and prepare it under
    /// `gid`. Blocks while conflicting locks are held. `false` is an abort
    /// vote.
    fn apply_prepare(&self, gid: Gid, changeset: &[u8]) -> anyhow::Result<bool>;

    /// Move a prepared transaction to the given state (`PRECOMMITTED`).
    fn set_prepared_state(&self, gid: Gid, state: PreparedState) -> anyhow::Result<()>;

    /// `COMMIT PREPARED` / `ROLLBACK PREPARED`.
    fn finish_prepared(&self, gid: Gid, commit: bool) -> anyhow::Result<()>;

    /// Current state of a prepared transaction, if it is still prepared.
    fn prepared_state(&self, gid: Gid) -> Option<PreparedState>;

    /// Prepared transactions no session owns (crash leftovers); resolver
    /// input.
    fn orphaned_prepared(&self) -> Vec<Gid>;

    /// The session driving this prepared transaction abandoned it (went
    /// offline mid-gather); hand it to the resolver.
    fn disown(&self, gid: Gid);

    /// The apply session for `origin` broke; orphan every unfinished
    /// prepare it delivered so the resolver can settle them.
    fn disown_origin(&self, origin: NodeId);

    /// Terminal knowledge about a gid, for answering `POLL_STATUS`.
    fn gid_outcome(&self, gid: Gid) -> ResolveOutcome;

    /// Snapshot of the local wait-for graph.
    fn wait_graph(&self) -> Vec<WaitEdge>;

    /// Abort the local incarnation of `gid`, whether it is still executing
    /// or already prepared. Unknown gids and gids owned by a live local
    /// coordinator are left alone.
    fn abort(&self, gid: Gid) -> anyhow::Result<()>;

    /// Catch up with `donor` after downtime: replay everything committed
    /// there that this node is missing. The host's recovery slot machinery
    /// sits behind this call.
    fn catch_up(&self, donor: NodeId) -> anyhow::Result<()>;
}
