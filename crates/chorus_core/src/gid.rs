//! Global transaction identifiers.
//!
//! A GID names one distributed transaction cluster-wide. It is rendered as
//! `MTM-<origin>-<xid>` and used as the two-phase-commit key on every
//! participant. Uniqueness follows from the origin node id being unique in
//! the cluster and the xid being unique on its origin.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::mask::NodeId;

/// Globally unique transaction identifier.
///
/// Ordering is the numeric `(origin, xid)` order; deadlock victim selection
/// relies on it being total and stable.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Gid {
    pub origin: NodeId,
    pub xid: u64,
}

impl Gid {
    pub fn new(origin: NodeId, xid: u64) -> Gid {
        Gid { origin, xid }
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MTM-{}-{}", self.origin, self.xid)
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed gid: {0:?}")]
pub struct GidParseError(pub String);

impl FromStr for Gid {
    type Err = GidParseError;

    fn from_str(s: &str) -> Result<Gid, GidParseError> {
        let rest = s
            .strip_prefix("MTM-")
            .ok_or_else(|| GidParseError(s.to_string()))?;
        let (origin, xid) = rest
            .split_once('-')
            .ok_or_else(|| GidParseError(s.to_string()))?;
        let origin: NodeId =
            origin.parse().map_err(|_| GidParseError(s.to_string()))?;
        let xid: u64 = xid.parse().map_err(|_| GidParseError(s.to_string()))?;
        if origin == 0 {
            return Err(GidParseError(s.to_string()));
        }
        Ok(Gid { origin, xid })
    }
}
