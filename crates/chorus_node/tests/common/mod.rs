//! Shared helpers for integration tests.

use std::time::{Duration, Instant};

use chorus_core::{CommitError, CommitOutcome};
use chorus_node::EmbeddedNode;

/// Per-scenario guard rail.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Commit a write, retrying the retriable failures (a dying peer, a
/// deadlock victim, a node that is briefly offline) the way a client
/// would.
pub fn retry_put(node: &EmbeddedNode, pairs: &[(&str, i64)], timeout: Duration) -> CommitOutcome {
    let deadline = Instant::now() + timeout;
    loop {
        match node.put(pairs) {
            Ok(outcome) => return outcome,
            Err(
                err @ (CommitError::PrepareFailed(_)
                | CommitError::WentOffline
                | CommitError::ClusterNotOnline(_)),
            ) => {
                assert!(
                    Instant::now() < deadline,
                    "write did not commit before timeout, last error: {err}"
                );
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(err) => panic!("non-retriable commit failure: {err}"),
        }
    }
}

/// Retriable transfer variant.
pub fn retry_add(node: &EmbeddedNode, deltas: &[(&str, i64)], timeout: Duration) -> CommitOutcome {
    let deadline = Instant::now() + timeout;
    loop {
        match node.add(deltas) {
            Ok(outcome) => return outcome,
            Err(
                err @ (CommitError::PrepareFailed(_)
                | CommitError::WentOffline
                | CommitError::ClusterNotOnline(_)),
            ) => {
                assert!(
                    Instant::now() < deadline,
                    "transfer did not commit before timeout, last error: {err}"
                );
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => panic!("non-retriable commit failure: {err}"),
        }
    }
}
