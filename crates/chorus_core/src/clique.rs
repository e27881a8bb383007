//! Largest fully-connected subset of the merged connectivity graph.
//!
//! Cluster sizes are bounded by `MAX_NODES`, so the search is exact: every
//! subset containing self is tested. Ties between equal-sized cliques are
//! broken by lexicographically smallest membership so that all nodes agree
//! on the winner without further coordination.

use crate::mask::{NodeId, NodeMask};

/// Largest clique containing `self_id` over nodes `[1..=n]`.
///
/// `adjacency[i - 1]` is the set of nodes node `i` can reach both ways;
/// the self-bit of each row is ignored. Returns at least `{self_id}`.
pub fn max_clique(adjacency: &[NodeMask], self_id: NodeId, n: usize) -> NodeMask {
    debug_assert!(self_id as usize <= n && n <= adjacency.len());

    // Closed rows: each node reaches itself.
    let mut rows = [NodeMask::EMPTY; crate::mask::MAX_NODES];
    for id in 1..=n as NodeId {
        rows[id as usize - 1] = adjacency[id as usize - 1].with(id);
    }

    let mut best = NodeMask::single(self_id);
    let all = NodeMask::full(n).bits();
    let mut candidate = 0u64;
    loop {
        candidate = (candidate + 1) & all;
        if candidate == 0 {
            break;
        }
        let mask = NodeMask::from_bits(candidate);
        if !mask.contains(self_id) {
            continue;
        }
        let is_clique = mask
            .iter()
            .all(|id| mask.difference(rows[id as usize - 1]).is_empty());
        if is_clique && better(mask, best) {
            best = mask;
        }
    }
    best
}

/// True when `a` beats `b`: larger, or equal-sized with lexicographically
/// smaller membership.
fn better(a: NodeMask, b: NodeMask) -> bool {
    if a.count() != b.count() {
        return a.count() > b.count();
    }
    let mut ai = a.iter();
    let mut bi = b.iter();
    loop {
        match (ai.next(), bi.next()) {
            (Some(x), Some(y)) if x == y => continue,
            (Some(x), Some(y)) => return x < y,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(n: usize, edges: &[(NodeId, NodeId)]) -> Vec<NodeMask> {
        let mut adj = vec![NodeMask::EMPTY; n];
        for (a, b) in edges {
            adj[*a as usize - 1].insert(*b);
            adj[*b as usize - 1].insert(*a);
        }
        adj
    }

    #[test]
    fn fully_connected_cluster() {
        let adj = graph(3, &[(1, 2), (1, 3), (2, 3)]);
        assert_eq!(max_clique(&adj, 1, 3), NodeMask::full(3));
        assert_eq!(max_clique(&adj, 3, 3), NodeMask::full(3));
    }

    #[test]
    fn isolated_node_gets_singleton() {
        let adj = graph(3, &[(1, 2)]);
        assert_eq!(max_clique(&adj, 3, 3), NodeMask::single(3));
    }

    #[test]
    fn partition_majority_side() {
        // 1-2-3 mutually connected, 4-5 mutually connected, no cross edges.
        let adj = graph(5, &[(1, 2), (1, 3), (2, 3), (4, 5)]);
        assert_eq!(
            max_clique(&adj, 2, 5),
            NodeMask::single(1).with(2).with(3)
        );
        assert_eq!(max_clique(&adj, 5, 5), NodeMask::single(4).with(5));
    }

    #[test]
    fn tie_broken_by_smallest_membership() {
        // Node 1 belongs to two triangles: {1,2,3} and {1,4,5}.
        let adj = graph(5, &[(1, 2), (1, 3), (2, 3), (1, 4), (1, 5), (4, 5)]);
        assert_eq!(
            max_clique(&adj, 1, 5),
            NodeMask::single(1).with(2).with(3)
        );
    }

    #[test]
    fn two_node_pair() {
        let adj = graph(2, &[(1, 2)]);
        assert_eq!(max_clique(&adj, 1, 2), NodeMask::full(2));
        let cut = graph(2, &[]);
        assert_eq!(max_clique(&cut, 1, 2), NodeMask::single(1));
    }

    #[test]
    fn full_width_graph() {
        let n = crate::mask::MAX_NODES;
        let mut edges = Vec::new();
        for a in 1..=n as NodeId {
            for b in (a + 1)..=n as NodeId {
                edges.push((a, b));
            }
        }
        let adj = graph(n, &edges);
        assert_eq!(max_clique(&adj, 16, n), NodeMask::full(n));
    }
}
