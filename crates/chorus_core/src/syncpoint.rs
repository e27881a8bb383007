//! Syncpoint and per-peer progress bookkeeping.
//!
//! Every node numbers its own committed stream with a logical origin
//! position and tracks how far it has applied every peer's stream. A
//! syncpoint record is emitted when enough time has passed since the last
//! one; after a restart the receiver resumes each peer's stream from the
//! recorded position.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::mask::{NodeId, MAX_NODES};

/// Durable part of the tracker, persisted by the host between restarts.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncpointSnapshot {
    pub origin_lsn: u64,
    pub applied: Vec<u64>,
    pub latest_syncpoint: Vec<u64>,
}

struct Progress {
    applied: [u64; MAX_NODES],
    latest_syncpoint: [u64; MAX_NODES],
    last_log_us: u64,
    last_log_lsn: u64,
}

pub struct SyncpointTracker {
    self_id: NodeId,
    origin_lsn: AtomicU64,
    progress: Mutex<Progress>,
}

impl SyncpointTracker {
    pub fn new(self_id: NodeId) -> SyncpointTracker {
        SyncpointTracker {
            self_id,
            origin_lsn: AtomicU64::new(0),
            progress: Mutex::new(Progress {
                applied: [0; MAX_NODES],
                latest_syncpoint: [0; MAX_NODES],
                last_log_us: 0,
                last_log_lsn: 0,
            }),
        }
    }

    /// Reserve the next position in our origin stream.
    pub fn next_origin_lsn(&self) -> u64 {
        self.origin_lsn.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn origin_lsn(&self) -> u64 {
        self.origin_lsn.load(Ordering::Acquire)
    }

    /// Record that `origin`'s stream has been applied up to `lsn`.
    pub fn note_applied(&self, origin: NodeId, lsn: u64) {
        let mut progress = self.progress.lock().unwrap();
        let slot = &mut progress.applied[origin as usize - 1];
        if lsn > *slot {
            *slot = lsn;
        }
    }

    pub fn applied(&self, origin: NodeId) -> u64 {
        self.progress.lock().unwrap().applied[origin as usize - 1]
    }

    /// Position to resume `origin`'s stream from after a restart.
    pub fn resume_from(&self, origin: NodeId) -> u64 {
        self.progress.lock().unwrap().latest_syncpoint[origin as usize - 1]
    }

    /// Emit a syncpoint record when enough time has elapsed since the
    /// previous one and the stream actually moved. Returns the recorded
    /// position, if one was written.
    pub fn maybe_log_syncpoint(&self, now_us: u64, interval_us: u64) -> Option<u64> {
        let lsn = self.origin_lsn();
        let mut progress = self.progress.lock().unwrap();
        if lsn == progress.last_log_lsn {
            return None;
        }
        if now_us.saturating_sub(progress.last_log_us) < interval_us {
            return None;
        }
        progress.last_log_us = now_us;
        progress.last_log_lsn = lsn;
        let applied = progress.applied;
        for (idx, slot) in progress.latest_syncpoint.iter_mut().enumerate() {
            if idx == self.self_id as usize - 1 {
                *slot = lsn;
            } else {
                *slot = applied[idx];
            }
        }
        tracing::info!(lsn, "syncpoint");
        Some(lsn)
    }

    pub fn snapshot(&self) -> SyncpointSnapshot {
        let progress = self.progress.lock().unwrap();
        SyncpointSnapshot {
            origin_lsn: self.origin_lsn(),
            applied: progress.applied.to_vec(),
            latest_syncpoint: progress.latest_syncpoint.to_vec(),
        }
    }

    pub fn restore(&self, snap: &SyncpointSnapshot) {
        self.origin_lsn.store(snap.origin_lsn, Ordering::Release);
        let mut progress = self.progress.lock().unwrap();
        for (idx, v) in snap.applied.iter().take(MAX_NODES).enumerate() {
            progress.applied[idx] = *v;
        }
        for (idx, v) in snap.latest_syncpoint.iter().take(MAX_NODES).enumerate() {
            progress.latest_syncpoint[idx] = *v;
        }
    }
}
