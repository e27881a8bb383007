//! External referee for two-node split-brain arbitration.
//!
//! The referee is a small advisory service at a well-known address. It is
//! consulted only when a two-node cluster degenerates to a single-node
//! clique: the node holding the grant keeps accepting writes, the other
//! stays disabled until the link heals and the grant is surrendered.

use std::sync::Mutex;

use crate::mask::NodeId;

pub trait Referee: Send + Sync {
    /// Ask for the grant of the given generation. Returns true when this
    /// node holds the grant after the call (first asker wins and keeps it
    /// until surrender).
    fn request_grant(&self, node: NodeId, generation: u64) -> anyhow::Result<bool>;

    /// Give the grant back. No-op when `node` does not hold it.
    fn surrender(&self, node: NodeId) -> anyhow::Result<()>;

    /// Current holder, if any.
    fn winner(&self) -> anyhow::Result<Option<(NodeId, u64)>>;
}

/// In-process referee used by embedded clusters and tests.
#[derive(Default)]
pub struct MemoryReferee {
    grant: Mutex<Option<(NodeId, u64)>>,
}

impl MemoryReferee {
    pub fn new() -> MemoryReferee {
        MemoryReferee::default()
    }
}

impl Referee for MemoryReferee {
    fn request_grant(&self, node: NodeId, generation: u64) -> anyhow::Result<bool> {
        let mut grant = self.grant.lock().unwrap();
        match *grant {
            None => {
                *grant = Some((node, generation));
                tracing::info!(node, generation, "referee grant awarded");
                Ok(true)
            }
            Some((holder, _)) => Ok(holder == node),
        }
    }

    fn surrender(&self, node: NodeId) -> anyhow::Result<()> {
        let mut grant = self.grant.lock().unwrap();
        if let Some((holder, generation)) = *grant {
            if holder == node {
                tracing::info!(node, generation, "referee grant surrendered");
                *grant = None;
            }
        }
        Ok(())
    }

    fn winner(&self) -> anyhow::Result<Option<(NodeId, u64)>> {
        Ok(*self.grant.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_most_one_holder() {
        let referee = MemoryReferee::new();
        assert!(referee.request_grant(1, 1).unwrap());
        assert!(!referee.request_grant(2, 1).unwrap());
        // Holder can re-ask; the answer stays stable.
        assert!(referee.request_grant(1, 2).unwrap());
        assert_eq!(referee.winner().unwrap(), Some((1, 1)));
    }

    #[test]
    fn surrender_frees_the_grant() {
        let referee = MemoryReferee::new();
        assert!(referee.request_grant(1, 1).unwrap());
        referee.surrender(2).unwrap();
        assert_eq!(referee.winner().unwrap(), Some((1, 1)));
        referee.surrender(1).unwrap();
        assert_eq!(referee.winner().unwrap(), None);
        assert!(referee.request_grant(2, 2).unwrap());
    }
}
