//! Distributed deadlock detection.
//!
//! Every node periodically snapshots its local wait-for graph and ships it
//! to the elected detector (the lowest live node id). The detector merges
//! the per-node graphs by gid, searches for cycles and broadcasts an abort
//! for the victim. Victim choice is the smallest gid in the cycle, so
//! every run of the detector picks the same transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::clock::sleep_unless;
use crate::context::{CoreContext, CONTROL_STREAM, DDD_STREAM};
use crate::dmq::{DmqHandle, DmqPop};
use crate::engine::WaitEdge;
use crate::gid::Gid;
use crate::mask::NodeId;
use crate::membership::NodeStatus;
use crate::messages::{ArbiterMessage, MessageCode};

/// Victims are not re-broadcast within this many detection intervals.
const VICTIM_SUPPRESS_INTERVALS: u32 = 10;

/// One node's snapshot of its wait-for graph, tagged with the recovery
/// generation it was taken under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphContribution {
    pub node: NodeId,
    pub recovery_count: u64,
    pub edges: Vec<WaitEdge>,
}

/// Deterministically pick the victims that break every cycle.
///
/// Repeatedly finds a cycle, selects its smallest gid, removes it and
/// searches again, so overlapping cycles produce the minimal stable set.
pub fn find_victims(edges: &[(Gid, Gid)]) -> Vec<Gid> {
    let mut adj: BTreeMap<Gid, BTreeSet<Gid>> = BTreeMap::new();
    for (waiter, holder) in edges {
        adj.entry(*waiter).or_default().insert(*holder);
        adj.entry(*holder).or_default();
    }

    let mut victims = Vec::new();
    while let Some(cycle) = find_cycle(&adj) {
        let victim = *cycle.iter().min().expect("cycle cannot be empty");
        victims.push(victim);
        adj.remove(&victim);
        for targets in adj.values_mut() {
            targets.remove(&victim);
        }
    }
    victims
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

fn find_cycle(adj: &BTreeMap<Gid, BTreeSet<Gid>>) -> Option<Vec<Gid>> {
    let mut color: BTreeMap<Gid, Color> =
        adj.keys().map(|gid| (*gid, Color::White)).collect();
    let mut stack = Vec::new();
    for start in adj.keys() {
        if color[start] == Color::White {
            if let Some(cycle) = visit(*start, adj, &mut color, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit(
    node: Gid,
    adj: &BTreeMap<Gid, BTreeSet<Gid>>,
    color: &mut BTreeMap<Gid, Color>,
    stack: &mut Vec<Gid>,
) -> Option<Vec<Gid>> {
    color.insert(node, Color::Gray);
    stack.push(node);
    if let Some(targets) = adj.get(&node) {
        for next in targets {
            match color.get(next).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    let pos = stack
                        .iter()
                        .position(|g| g == next)
                        .expect("gray node is on the stack");
                    return Some(stack[pos..].to_vec());
                }
                Color::White => {
                    if let Some(cycle) = visit(*next, adj, color, stack) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }
    }
    color.insert(node, Color::Black);
    stack.pop();
    None
}

/// Merge fresh contributions into distributed edges. Local-only edges and
/// snapshots from a stale recovery generation are dropped.
fn merge(ctx: &CoreContext, contributions: &HashMap<NodeId, GraphContribution>) -> Vec<(Gid, Gid)> {
    let mut edges = Vec::new();
    for (node, contribution) in contributions {
        let fresh = *node == ctx.self_id()
            || ctx.membership.peer_recovery_count(*node) == contribution.recovery_count;
        if !fresh {
            tracing::debug!(
                node,
                recovery_count = contribution.recovery_count,
                "discarding stale wait-graph contribution"
            );
            continue;
        }
        for edge in &contribution.edges {
            if let (Some(waiter), Some(holder)) = (edge.waiter_gid, edge.holder_gid) {
                edges.push((waiter, holder));
            }
        }
    }
    edges
}

/// Periodic detector worker.
pub fn run(ctx: Arc<CoreContext>) {
    let mut dmq = ctx.dmq.open();
    dmq.stream_subscribe(DDD_STREAM);
    let interval = Duration::from_millis(ctx.cfg.deadlock_detect_interval_ms);
    let mut contributions: HashMap<NodeId, GraphContribution> = HashMap::new();
    let mut suppressed: HashMap<Gid, Instant> = HashMap::new();

    while !ctx.is_shutdown() {
        collect_contributions(&ctx, dmq.as_mut(), &mut contributions, interval);
        if ctx.is_shutdown() {
            return;
        }
        if ctx.membership.status() != NodeStatus::Online {
            contributions.clear();
            continue;
        }

        let live = ctx.membership.participants().with(ctx.self_id());
        let detector = live.lowest_set_bit().unwrap_or(ctx.self_id());
        let snapshot = GraphContribution {
            node: ctx.self_id(),
            recovery_count: ctx.membership.recovery_count(),
            edges: ctx.engine.wait_graph(),
        };

        if detector != ctx.self_id() {
            match serde_json::to_vec(&snapshot) {
                Ok(payload) => {
                    if let Err(err) = dmq.push(detector, DDD_STREAM, &payload) {
                        tracing::warn!(detector, error = ?err, "failed to ship wait graph");
                    }
                }
                Err(err) => tracing::warn!(error = ?err, "wait graph serialization failed"),
            }
            contributions.clear();
            continue;
        }

        contributions.insert(ctx.self_id(), snapshot);
        contributions.retain(|node, _| live.contains(*node));
        let edges = merge(&ctx, &contributions);
        let suppress_for = interval * VICTIM_SUPPRESS_INTERVALS;
        suppressed.retain(|_, at| at.elapsed() < suppress_for);

        for victim in find_victims(&edges) {
            if suppressed.contains_key(&victim) {
                continue;
            }
            suppressed.insert(victim, Instant::now());
            tracing::info!(gid = %victim, "distributed deadlock, aborting victim");
            let mut abort = ArbiterMessage::new(MessageCode::Abort, ctx.self_id());
            abort.dxid = victim.xid;
            abort.gid = Some(victim);
            let payload = abort.encode();
            for peer in ctx.membership.participants().iter() {
                if let Err(err) = dmq.push(peer, CONTROL_STREAM, &payload) {
                    tracing::warn!(peer, error = ?err, "failed to broadcast victim abort");
                }
            }
            if let Err(err) = ctx.engine.abort(victim) {
                tracing::warn!(gid = %victim, error = ?err, "local victim abort failed");
            }
        }
    }
}

/// Drain incoming snapshots until the next scan is due.
fn collect_contributions(
    ctx: &CoreContext,
    dmq: &mut dyn DmqHandle,
    contributions: &mut HashMap<NodeId, GraphContribution>,
    interval: Duration,
) {
    let deadline = Instant::now() + interval;
    loop {
        if ctx.is_shutdown() {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let mask = ctx.membership.participants();
        if mask.is_empty() {
            sleep_unless(&ctx.shutdown, deadline - now);
            return;
        }
        match dmq.pop_timeout(mask, deadline - now) {
            DmqPop::Message { from, payload } => {
                match serde_json::from_slice::<GraphContribution>(&payload) {
                    Ok(contribution) if contribution.node == from => {
                        contributions.insert(from, contribution);
                    }
                    Ok(contribution) => {
                        tracing::warn!(
                            from,
                            claimed = contribution.node,
                            "wait graph sender mismatch, dropping"
                        );
                    }
                    Err(err) => {
                        tracing::error!(from, error = ?err, "undecodable wait graph, dropping peer");
                        ctx.membership.note_disconnect(from);
                    }
                }
            }
            DmqPop::Detached { from } => {
                ctx.membership.note_disconnect(from);
                if !sleep_unless(&ctx.shutdown, Duration::from_millis(100)) {
                    return;
                }
            }
            DmqPop::TimedOut => return,
            DmqPop::Shutdown => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gid(origin: NodeId, xid: u64) -> Gid {
        Gid::new(origin, xid)
    }

    #[test]
    fn no_cycle_no_victims() {
        let edges = vec![(gid(1, 1), gid(2, 1)), (gid(2, 1), gid(3, 1))];
        assert!(find_victims(&edges).is_empty());
    }

    #[test]
    fn two_cycle_aborts_lowest_gid() {
        // Classic opposite-order lock grab between two nodes.
        let edges = vec![(gid(2, 5), gid(1, 9)), (gid(1, 9), gid(2, 5))];
        assert_eq!(find_victims(&edges), vec![gid(1, 9)]);
    }

    #[test]
    fn longer_cycle_single_victim() {
        let edges = vec![
            (gid(1, 1), gid(2, 2)),
            (gid(2, 2), gid(3, 3)),
            (gid(3, 3), gid(1, 1)),
        ];
        assert_eq!(find_victims(&edges), vec![gid(1, 1)]);
    }

    #[test]
    fn disjoint_cycles_each_get_a_victim() {
        let edges = vec![
            (gid(1, 1), gid(2, 1)),
            (gid(2, 1), gid(1, 1)),
            (gid(3, 1), gid(4, 1)),
            (gid(4, 1), gid(3, 1)),
        ];
        let victims = find_victims(&edges);
        assert_eq!(victims, vec![gid(1, 1), gid(3, 1)]);
    }

    #[test]
    fn overlapping_cycles_may_share_a_victim() {
        // Two cycles through gid(1,1); removing it breaks both.
        let edges = vec![
            (gid(1, 1), gid(2, 1)),
            (gid(2, 1), gid(1, 1)),
            (gid(1, 1), gid(3, 1)),
            (gid(3, 1), gid(1, 1)),
        ];
        assert_eq!(find_victims(&edges), vec![gid(1, 1)]);
    }

    #[test]
    fn victim_choice_is_stable_under_edge_order() {
        let mut edges = vec![
            (gid(2, 7), gid(3, 1)),
            (gid(3, 1), gid(2, 7)),
        ];
        let forward = find_victims(&edges);
        edges.reverse();
        assert_eq!(find_victims(&edges), forward);
        assert_eq!(forward, vec![gid(2, 7)]);
    }

    #[test]
    fn contribution_roundtrips_as_json() {
        let contribution = GraphContribution {
            node: 2,
            recovery_count: 4,
            edges: vec![WaitEdge {
                waiter_xid: 10,
                holder_xid: 11,
                waiter_gid: Some(gid(1, 10)),
                holder_gid: Some(gid(3, 11)),
            }],
        };
        let bytes = serde_json::to_vec(&contribution).unwrap();
        let back: GraphContribution = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.node, 2);
        assert_eq!(back.edges[0].waiter_gid, Some(gid(1, 10)));
    }
}
