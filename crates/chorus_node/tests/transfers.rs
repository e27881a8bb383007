//! Concurrent transfer workload: the balance sum is invariant and the
//! cluster never freezes.
//!
//! Test flow:
//! 1) Seed a set of accounts with a known total.
//! 2) Run concurrent transfer clients on every node while verifiers keep
//!    summing the balances on every node.
//! 3) No verifier may ever observe a different total, and the commit
//!    counter must keep growing (deadlock victims are retried, so a
//!    frozen cluster would show up as a stalled counter).

mod common;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chorus_node::EmbeddedCluster;
use common::{retry_add, retry_put, TEST_TIMEOUT};

const ACCOUNTS: usize = 8;
const INITIAL_BALANCE: i64 = 100;
const CLIENTS_PER_NODE: usize = 3;
const RUN_FOR: Duration = Duration::from_secs(8);

fn account(i: usize) -> String {
    format!("acc_{i}")
}

#[test]
fn transfers_preserve_total_balance() {
    let cluster = Arc::new(EmbeddedCluster::start(3).expect("cluster start"));

    for i in 0..ACCOUNTS {
        let name = account(i);
        retry_put(cluster.node(1), &[(name.as_str(), INITIAL_BALANCE)], TEST_TIMEOUT);
    }
    let total = ACCOUNTS as i64 * INITIAL_BALANCE;
    for id in 1..=3 {
        assert_eq!(cluster.node(id).engine.sum_prefix("acc_"), total);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let commits = Arc::new(AtomicU64::new(0));
    let mut workers = Vec::new();

    for node_id in 1..=3u8 {
        for client in 0..CLIENTS_PER_NODE {
            let cluster = cluster.clone();
            let stop = stop.clone();
            let commits = commits.clone();
            workers.push(std::thread::spawn(move || {
                let mut step = client;
                while !stop.load(Ordering::Relaxed) {
                    let from = account((step + node_id as usize) % ACCOUNTS);
                    let to = account((step * 7 + 3) % ACCOUNTS);
                    if from != to {
                        retry_add(
                            cluster.node(node_id),
                            &[(from.as_str(), -1), (to.as_str(), 1)],
                            TEST_TIMEOUT,
                        );
                        commits.fetch_add(1, Ordering::Relaxed);
                    }
                    step += 1;
                }
            }));
        }
    }

    let verifier_failures = Arc::new(AtomicU64::new(0));
    let mut verifiers = Vec::new();
    for node_id in 1..=3u8 {
        let cluster = cluster.clone();
        let stop = stop.clone();
        let failures = verifier_failures.clone();
        verifiers.push(std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let sum = cluster.node(node_id).engine.sum_prefix("acc_");
                if sum != total {
                    failures.fetch_add(1, Ordering::Relaxed);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }));
    }

    std::thread::sleep(RUN_FOR / 2);
    let midway = commits.load(Ordering::Relaxed);
    std::thread::sleep(RUN_FOR / 2);
    let final_count = commits.load(Ordering::Relaxed);

    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        worker.join().unwrap();
    }
    for verifier in verifiers {
        verifier.join().unwrap();
    }

    assert_eq!(verifier_failures.load(Ordering::Relaxed), 0, "total drifted");
    assert!(midway > 0, "no transfers committed in the first half");
    assert!(
        final_count > midway,
        "commit counter froze: {midway} -> {final_count}"
    );

    // Quiesced cluster: every node converges on the same total.
    for id in 1..=3 {
        assert!(cluster.wait_until(Duration::from_secs(10), || {
            cluster.node(id).engine.sum_prefix("acc_") == total
        }));
    }

    match Arc::try_unwrap(cluster) {
        Ok(cluster) => cluster.shutdown(),
        Err(_) => panic!("cluster still referenced"),
    }
}
