//! Basic replication and single-node failure scenarios.
//!
//! Test flow:
//! 1) Writes on one node are readable on every peer once the commit
//!    returns (the coordinator gathers COMMIT acks before returning).
//! 2) With one of three nodes stopped, the survivors keep committing.
//! 3) A restarted node recovers, catches up with the writes it missed and
//!    serves new ones.

mod common;

use std::time::Duration;

use chorus_core::NodeStatus;
use chorus_node::EmbeddedCluster;
use common::{retry_put, TEST_TIMEOUT};

#[test]
fn writes_replicate_to_all_nodes() {
    let cluster = EmbeddedCluster::start(3).expect("cluster start");

    retry_put(cluster.node(1), &[("t_1", 10)], TEST_TIMEOUT);
    assert_eq!(cluster.node(2).read("t_1"), Some(10));
    assert_eq!(cluster.node(3).read("t_1"), Some(10));

    // Any node can coordinate.
    retry_put(cluster.node(2), &[("t_2", 20)], TEST_TIMEOUT);
    retry_put(cluster.node(3), &[("t_3", 30)], TEST_TIMEOUT);
    for id in 1..=3 {
        assert_eq!(cluster.node(id).read("t_2"), Some(20));
        assert_eq!(cluster.node(id).read("t_3"), Some(30));
    }

    cluster.shutdown();
}

#[test]
fn survives_one_node_stopped() {
    let mut cluster = EmbeddedCluster::start(3).expect("cluster start");
    retry_put(cluster.node(1), &[("k1", 10)], TEST_TIMEOUT);

    cluster.stop_node(3);

    retry_put(cluster.node(1), &[("k2", 20)], TEST_TIMEOUT);
    assert_eq!(cluster.node(2).read("k2"), Some(20));
    assert_eq!(cluster.node(1).read("k2"), Some(20));

    cluster.shutdown();
}

#[test]
fn stopped_node_rejoins_and_catches_up() {
    let mut cluster = EmbeddedCluster::start(3).expect("cluster start");
    retry_put(cluster.node(1), &[("k1", 10)], TEST_TIMEOUT);

    cluster.stop_node(3);
    retry_put(cluster.node(1), &[("k2", 20)], TEST_TIMEOUT);

    cluster.restart_node(3).expect("restart");
    assert!(
        cluster.wait_for_status(3, NodeStatus::Online, Duration::from_secs(30)),
        "node 3 did not finish recovery"
    );

    // The write it missed arrived through catch-up.
    assert!(cluster.wait_until(Duration::from_secs(10), || {
        cluster.node(3).read("k2") == Some(20)
    }));

    // And it participates in new commits again, once the coordinator has
    // installed it behind the commit barrier.
    assert!(cluster.wait_until(Duration::from_secs(10), || {
        !cluster.node(1).ctx.membership.is_disabled(3)
    }));
    retry_put(cluster.node(1), &[("k3", 30)], TEST_TIMEOUT);
    assert_eq!(cluster.node(3).read("k3"), Some(30));

    cluster.shutdown();
}
