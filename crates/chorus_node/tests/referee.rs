//! Two-node cluster with referee arbitration.
//!
//! Test flow:
//! 1) Partition one node: exactly the grant holder keeps accepting
//!    writes, the isolated node refuses them (it cannot reach the referee
//!    either).
//! 2) Heal: the loser recovers, no winner write is lost, the loser shows
//!    no phantom commit.
//! 3) Partition the other node: the grant was surrendered after the heal,
//!    so the winner flips.

mod common;

use std::time::Duration;

use chorus_core::{CommitError, NodeStatus};
use chorus_node::EmbeddedCluster;
use common::{retry_put, TEST_TIMEOUT};

const RECOVERY_WAIT: Duration = Duration::from_secs(30);

fn assert_refuses_writes(cluster: &EmbeddedCluster, id: u8) {
    // The isolated node must demote itself shortly after losing its peer;
    // once demoted, new transactions are rejected up front.
    assert!(
        cluster.wait_for_status(id, NodeStatus::Disabled, Duration::from_secs(10)),
        "node {id} did not demote itself while isolated"
    );
    match cluster.node(id).put(&[("phantom", 666)]) {
        Err(CommitError::ClusterNotOnline(_)) => {}
        other => panic!("expected the isolated node to refuse writes, got {other:?}"),
    }
}

#[test]
fn partition_elects_exactly_one_writer() {
    let mut cluster = EmbeddedCluster::start(2).expect("cluster start");
    retry_put(cluster.node(1), &[("base", 1)], TEST_TIMEOUT);

    // --- first failure: node 2 cut off ------------------------------
    cluster.partition_node(2);

    // Node 1 wins the grant and keeps committing alone.
    retry_put(cluster.node(1), &[("during_split", 10)], TEST_TIMEOUT);
    assert_refuses_writes(&cluster, 2);
    assert_eq!(cluster.node(2).read("during_split"), None);
    assert_eq!(cluster.node(2).read("phantom"), None);

    // --- heal: loser re-enters recovery and rejoins -----------------
    cluster.heal_node(2);
    assert!(
        cluster.wait_for_status(2, NodeStatus::Online, RECOVERY_WAIT),
        "loser did not rejoin after heal"
    );
    assert!(cluster.wait_until(Duration::from_secs(10), || {
        cluster.node(2).read("during_split") == Some(10)
    }));
    assert_eq!(cluster.node(2).read("phantom"), None);

    // Both sides replicate again.
    assert!(cluster.wait_until(Duration::from_secs(10), || {
        !cluster.node(1).ctx.membership.is_disabled(2)
    }));
    retry_put(cluster.node(2), &[("after_heal", 20)], TEST_TIMEOUT);
    assert!(cluster.wait_until(Duration::from_secs(5), || {
        cluster.node(1).read("after_heal") == Some(20)
    }));

    // --- second failure, opposite side: the winner flips ------------
    assert!(
        cluster.wait_until(Duration::from_secs(15), || {
            !cluster.node(1).ctx.membership.read().referee_grant
                && cluster.node(2).ctx.membership.status() == NodeStatus::Online
        }),
        "grant was not surrendered after heal"
    );
    cluster.partition_node(1);

    retry_put(cluster.node(2), &[("second_split", 30)], TEST_TIMEOUT);
    assert_refuses_writes(&cluster, 1);
    assert_eq!(cluster.node(1).read("second_split"), None);

    cluster.heal_node(1);
    assert!(
        cluster.wait_for_status(1, NodeStatus::Online, RECOVERY_WAIT),
        "node 1 did not rejoin after heal"
    );
    assert!(cluster.wait_until(Duration::from_secs(10), || {
        cluster.node(1).read("second_split") == Some(30)
    }));

    cluster.shutdown();
}
