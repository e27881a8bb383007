//! Cluster membership and liveness state machine.
//!
//! Tracks per-node status, failure detection by heartbeat silence, the
//! clique of mutually reachable nodes, and referee arbitration for the
//! two-node split. All observers take the read side of the lock; every
//! mutation funnels through the event methods below, which take the write
//! side, so there is a single writer at a time and readers never see a
//! half-applied transition.

use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::clique::max_clique;
use crate::config::CoreConfig;
use crate::mask::{NodeId, NodeMask, MAX_NODES};
use crate::referee::Referee;

/// Per-node lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Initialization,
    Disabled,
    Recovery,
    Recovered,
    Online,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mnem = match self {
            NodeStatus::Initialization => "initialization",
            NodeStatus::Disabled => "disabled",
            NodeStatus::Recovery => "recovery",
            NodeStatus::Recovered => "recovered",
            NodeStatus::Online => "online",
        };
        f.write_str(mnem)
    }
}

/// Snapshot of the shared membership state.
#[derive(Clone, Debug)]
pub struct MembershipState {
    pub self_id: NodeId,
    pub all_nodes: usize,
    pub status: NodeStatus,
    /// Peers currently considered dead (may include self while not online).
    pub disabled: NodeMask,
    /// Largest fully-connected subset containing self.
    pub clique: NodeMask,
    /// Self view of reachable peers.
    pub connectivity: NodeMask,
    /// Incremented every time this node re-enters recovery.
    pub recovery_count: u64,
    pub referee_grant: bool,
    pub referee_winner: Option<NodeId>,
    /// Donor chosen for the current recovery, if any.
    pub donor: Option<NodeId>,
    /// Origin position peers must reach before we go online.
    pub resumption_lsn: u64,
}

struct Inner {
    state: MembershipState,
    configured_at_us: u64,
    last_seen_us: [u64; MAX_NODES],
    /// Last connectivity mask each node reported about itself.
    reported: [NodeMask; MAX_NODES],
    peer_recovery_count: [u64; MAX_NODES],
    /// Peer acknowledgements of our origin stream position.
    peer_applied_lsn: [u64; MAX_NODES],
    /// Peers heard from again after being disabled; re-enabled only under
    /// the commit barrier.
    pending_enable: NodeMask,
}

enum RefereeAction {
    None,
    Request { generation: u64 },
    Surrender,
}

pub struct Membership {
    self_id: NodeId,
    all_nodes: usize,
    recv_timeout_us: u64,
    inner: RwLock<Inner>,
    referee: Option<Arc<dyn Referee>>,
}

impl Membership {
    pub fn new(
        cfg: &CoreConfig,
        all_nodes: usize,
        referee: Option<Arc<dyn Referee>>,
    ) -> Membership {
        let state = MembershipState {
            self_id: cfg.node_id,
            all_nodes,
            status: NodeStatus::Initialization,
            disabled: NodeMask::full(all_nodes),
            clique: NodeMask::single(cfg.node_id),
            connectivity: NodeMask::EMPTY,
            recovery_count: 0,
            referee_grant: false,
            referee_winner: None,
            donor: None,
            resumption_lsn: 0,
        };
        Membership {
            self_id: cfg.node_id,
            all_nodes,
            recv_timeout_us: cfg.heartbeat_recv_timeout_ms * 1000,
            inner: RwLock::new(Inner {
                state,
                configured_at_us: 0,
                last_seen_us: [0; MAX_NODES],
                reported: [NodeMask::EMPTY; MAX_NODES],
                peer_recovery_count: [0; MAX_NODES],
                peer_applied_lsn: [0; MAX_NODES],
                pending_enable: NodeMask::EMPTY,
            }),
            referee,
        }
    }

    /// Configuration is loaded and the node knows who it is.
    pub fn configure(&self, now_us: u64) {
        let mut inner = self.inner.write().unwrap();
        if inner.state.status == NodeStatus::Initialization {
            inner.state.status = NodeStatus::Disabled;
            inner.configured_at_us = now_us;
            tracing::info!(
                node = self.self_id,
                nodes = self.all_nodes,
                "membership configured, node starts disabled"
            );
        }
    }

    pub fn read(&self) -> MembershipState {
        self.inner.read().unwrap().state.clone()
    }

    pub fn status(&self) -> NodeStatus {
        self.inner.read().unwrap().state.status
    }

    pub fn all_nodes(&self) -> usize {
        self.all_nodes
    }

    pub fn is_disabled(&self, peer: NodeId) -> bool {
        self.inner.read().unwrap().state.disabled.contains(peer)
    }

    /// Participant set a coordinator captures: every configured node that is
    /// neither disabled nor self.
    pub fn participants(&self) -> NodeMask {
        let inner = self.inner.read().unwrap();
        NodeMask::full(self.all_nodes)
            .difference(inner.state.disabled)
            .without(self.self_id)
    }

    pub fn connectivity_bits(&self) -> u64 {
        self.inner.read().unwrap().state.connectivity.bits()
    }

    pub fn recovery_count(&self) -> u64 {
        self.inner.read().unwrap().state.recovery_count
    }

    pub fn peer_recovery_count(&self, peer: NodeId) -> u64 {
        self.inner.read().unwrap().peer_recovery_count[peer as usize - 1]
    }

    /// Peers heard from again after being disabled, waiting for their
    /// barrier-protected re-enable.
    pub fn pending_enable(&self) -> NodeMask {
        self.inner.read().unwrap().pending_enable
    }

    /// A heartbeat (or any message) arrived from `peer`.
    pub fn note_peer(
        &self,
        peer: NodeId,
        their_connectivity: NodeMask,
        their_recovery_count: u64,
        now_us: u64,
    ) {
        let mut inner = self.inner.write().unwrap();
        let idx = peer as usize - 1;
        inner.last_seen_us[idx] = now_us;
        inner.reported[idx] = their_connectivity;
        inner.peer_recovery_count[idx] = their_recovery_count;
        if inner.state.disabled.contains(peer) && !inner.pending_enable.contains(peer) {
            tracing::info!(peer, "disabled peer is talking again, scheduling re-enable");
            inner.pending_enable.insert(peer);
        }
    }

    /// `peer` acknowledged applying our origin stream up to `lsn`.
    pub fn note_peer_progress(&self, peer: NodeId, lsn: u64) {
        let mut inner = self.inner.write().unwrap();
        let idx = peer as usize - 1;
        if lsn > inner.peer_applied_lsn[idx] {
            inner.peer_applied_lsn[idx] = lsn;
        }
        self.maybe_promote(&mut inner);
    }

    /// The DMQ reported `peer` definitively detached.
    pub fn note_disconnect(&self, peer: NodeId) {
        let mut inner = self.inner.write().unwrap();
        if !inner.state.disabled.contains(peer) {
            tracing::warn!(peer, "peer detached, disabling");
            self.disable_peer(&mut inner, peer);
        }
    }

    /// Re-enable a peer. Must only be called with the commit barrier held
    /// exclusively (see the apply guard): every coordinator that snapshots
    /// its participants after this call will include `peer`.
    pub fn enable_peer(&self, peer: NodeId) {
        let mut inner = self.inner.write().unwrap();
        inner.state.disabled.remove(peer);
        inner.pending_enable.remove(peer);
        self.recompute_clique(&mut inner);
        tracing::info!(peer, "peer re-enabled as commit participant");
    }

    /// Recovery receiver caught up with the donor's end of WAL.
    pub fn caught_up(&self, resumption_lsn: u64) {
        let mut inner = self.inner.write().unwrap();
        if inner.state.status == NodeStatus::Recovery {
            inner.state.status = NodeStatus::Recovered;
            inner.state.resumption_lsn = resumption_lsn;
            tracing::info!(resumption_lsn, "caught up with donor, node is recovered");
            self.maybe_promote(&mut inner);
        }
    }

    /// Periodic liveness sweep; drives every transition that does not need
    /// an explicit event. Called from the heartbeat sender loop.
    pub fn tick(&self, now_us: u64) {
        let action = self.tick_locked(now_us);
        let Some(referee) = self.referee.as_ref() else {
            return;
        };
        match action {
            RefereeAction::None => {}
            RefereeAction::Request { generation } => {
                match referee.request_grant(self.self_id, generation) {
                    Ok(granted) => self.apply_grant(granted),
                    Err(err) => {
                        tracing::warn!(error = ?err, "referee unreachable");
                        self.apply_grant(false);
                    }
                }
            }
            RefereeAction::Surrender => {
                if let Err(err) = referee.surrender(self.self_id) {
                    tracing::warn!(error = ?err, "referee surrender failed, will retry");
                } else {
                    let mut inner = self.inner.write().unwrap();
                    inner.state.referee_grant = false;
                    inner.state.referee_winner = None;
                }
            }
        }
    }

    fn tick_locked(&self, now_us: u64) -> RefereeAction {
        let mut inner = self.inner.write().unwrap();

        // Failure detection by silence.
        for peer in NodeMask::full(self.all_nodes).without(self.self_id).iter() {
            let idx = peer as usize - 1;
            let silent = now_us.saturating_sub(inner.last_seen_us[idx]) > self.recv_timeout_us;
            if silent && !inner.state.disabled.contains(peer) {
                tracing::warn!(peer, "no heartbeat within timeout, disabling");
                self.disable_peer(&mut inner, peer);
            }
            if silent {
                inner.pending_enable.remove(peer);
            }
        }

        self.recompute_clique(&mut inner);

        let majority = inner.state.clique.count() * 2 > self.all_nodes;
        let alone = inner.state.clique == NodeMask::single(self.self_id);
        let referee_eligible = self.referee.is_some()
            && self.all_nodes == 2
            && now_us.saturating_sub(inner.configured_at_us) > self.recv_timeout_us;

        match inner.state.status {
            NodeStatus::Initialization => {}
            NodeStatus::Disabled => {
                if majority {
                    self.enter_recovery(&mut inner);
                } else if alone && referee_eligible && !inner.state.referee_grant {
                    return RefereeAction::Request {
                        generation: inner.state.recovery_count + 1,
                    };
                } else if inner.state.referee_grant {
                    self.enter_recovery(&mut inner);
                }
            }
            NodeStatus::Recovery | NodeStatus::Recovered => {
                if !majority && !inner.state.referee_grant {
                    tracing::warn!("lost majority during recovery, back to disabled");
                    inner.state.status = NodeStatus::Disabled;
                    inner.state.donor = None;
                } else if inner.state.status == NodeStatus::Recovered {
                    self.maybe_promote(&mut inner);
                }
            }
            NodeStatus::Online => {
                if !majority {
                    if inner.state.referee_grant {
                        // Grant holder stays online alone.
                    } else if alone && referee_eligible {
                        return RefereeAction::Request {
                            generation: inner.state.recovery_count + 1,
                        };
                    } else {
                        self.demote(&mut inner);
                    }
                }
            }
        }

        // Surrender once the pair is whole again.
        if inner.state.referee_grant
            && self.all_nodes == 2
            && inner.state.clique.count() == self.all_nodes
            && inner.state.disabled.difference(NodeMask::single(self.self_id)).is_empty()
        {
            return RefereeAction::Surrender;
        }

        RefereeAction::None
    }

    fn apply_grant(&self, granted: bool) {
        let mut inner = self.inner.write().unwrap();
        if granted {
            inner.state.referee_grant = true;
            inner.state.referee_winner = Some(self.self_id);
            if inner.state.status == NodeStatus::Disabled {
                self.enter_recovery(&mut inner);
            }
        } else if inner.state.status == NodeStatus::Online && !inner.state.referee_grant {
            tracing::warn!("referee denied the grant, going offline");
            self.demote(&mut inner);
        }
    }

    fn disable_peer(&self, inner: &mut Inner, peer: NodeId) {
        inner.state.disabled.insert(peer);
        inner.pending_enable.remove(peer);
        self.recompute_clique(inner);
    }

    fn demote(&self, inner: &mut Inner) {
        tracing::warn!("node lost its clique majority, demoting to disabled");
        inner.state.status = NodeStatus::Disabled;
        inner.state.disabled.insert(self.self_id);
        inner.state.donor = None;
    }

    fn enter_recovery(&self, inner: &mut Inner) {
        inner.state.recovery_count += 1;
        inner.state.status = NodeStatus::Recovery;
        inner.state.donor = inner
            .state
            .clique
            .without(self.self_id)
            .lowest_set_bit();
        tracing::info!(
            donor = ?inner.state.donor,
            recovery_count = inner.state.recovery_count,
            "entering recovery"
        );
    }

    fn maybe_promote(&self, inner: &mut Inner) {
        if inner.state.status != NodeStatus::Recovered {
            return;
        }
        let live_peers = NodeMask::full(self.all_nodes)
            .difference(inner.state.disabled)
            .without(self.self_id);
        if live_peers.is_empty() && !inner.state.referee_grant && self.all_nodes > 1 {
            return;
        }
        let all_caught_up = live_peers
            .iter()
            .all(|peer| inner.peer_applied_lsn[peer as usize - 1] >= inner.state.resumption_lsn);
        if all_caught_up {
            inner.state.status = NodeStatus::Online;
            inner.state.disabled.remove(self.self_id);
            tracing::info!("all live peers caught up with us, node is online");
        }
    }

    /// Merge everyone's connectivity claims into a symmetric adjacency and
    /// recompute the clique. Our own row is derived from heartbeat
    /// recency, not from what we said last time.
    fn recompute_clique(&self, inner: &mut Inner) {
        let mut adjacency = [NodeMask::EMPTY; MAX_NODES];
        let self_idx = self.self_id as usize - 1;

        // Refresh our own row first.
        let mut connectivity = NodeMask::EMPTY;
        for peer in NodeMask::full(self.all_nodes).without(self.self_id).iter() {
            let idx = peer as usize - 1;
            let last = inner.last_seen_us[idx];
            if (last != 0 && !inner.state.disabled.contains(peer))
                || inner.pending_enable.contains(peer)
            {
                connectivity.insert(peer);
            }
        }
        inner.state.connectivity = connectivity;
        inner.reported[self_idx] = connectivity;

        for id in 1..=self.all_nodes as NodeId {
            let idx = id as usize - 1;
            for other in inner.reported[idx].iter() {
                if other as usize <= self.all_nodes
                    && inner.reported[other as usize - 1].contains(id)
                {
                    adjacency[idx].insert(other);
                }
            }
        }
        inner.state.clique = max_clique(&adjacency, self.self_id, self.all_nodes);
    }
}
