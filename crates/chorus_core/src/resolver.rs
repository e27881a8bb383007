//! Resolution of orphaned prepared transactions.
//!
//! After a crash or a healed partition a gid can be left `PREPARED` with
//! no session driving it. The resolver polls every live peer for what it
//! knows about the gid and finishes the local copy accordingly: any
//! terminal answer wins; unanimous ignorance falls back on the precommit
//! rule (past precommit means the coordinator had decided to commit).
//! Resolution is idempotent; polling again is always safe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::sleep_unless;
use crate::context::{CoreContext, CONTROL_STREAM, RESOLVER_STREAM};
use crate::dmq::{DmqHandle, DmqPop};
use crate::engine::PreparedState;
use crate::gid::Gid;
use crate::mask::NodeMask;
use crate::membership::NodeStatus;
use crate::messages::{ArbiterMessage, MessageCode, ResolveOutcome};

/// Scan cadence; also the per-gid reply budget.
const RESOLVE_INTERVAL: Duration = Duration::from_secs(2);

/// What one resolution round concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Committed,
    Aborted,
    /// Some peers did not answer in time; retry after the next heartbeat
    /// round.
    Unknown,
}

/// Periodic resolver worker.
pub fn run(ctx: Arc<CoreContext>) {
    let mut dmq = ctx.dmq.open();
    dmq.stream_subscribe(RESOLVER_STREAM);

    while sleep_unless(&ctx.shutdown, RESOLVE_INTERVAL) {
        if ctx.membership.status() != NodeStatus::Online {
            continue;
        }
        for gid in ctx.engine.orphaned_prepared() {
            match resolve_one(&ctx, dmq.as_mut(), gid) {
                Resolution::Committed => {
                    tracing::info!(gid = %gid, "orphan resolved: committed")
                }
                Resolution::Aborted => {
                    tracing::info!(gid = %gid, "orphan resolved: aborted")
                }
                Resolution::Unknown => {
                    tracing::debug!(gid = %gid, "orphan still unresolved, will retry")
                }
            }
            if ctx.is_shutdown() {
                return;
            }
        }
    }
}

/// Poll every live peer about `gid` and finish it if the answers allow.
pub fn resolve_one(ctx: &CoreContext, dmq: &mut dyn DmqHandle, gid: Gid) -> Resolution {
    if ctx.engine.prepared_state(gid).is_none() {
        // Already finished; nothing to do. Keeps repeated calls safe.
        return match ctx.engine.gid_outcome(gid) {
            crate::messages::ResolveOutcome::Abort => Resolution::Aborted,
            _ => Resolution::Committed,
        };
    }

    let peers = ctx.membership.participants();
    let poll = ArbiterMessage::poll_status(ctx.self_id(), gid);
    let payload = poll.encode();
    for peer in peers.iter() {
        if let Err(err) = dmq.push(peer, CONTROL_STREAM, &payload) {
            tracing::warn!(peer, error = ?err, "status poll push failed");
        }
    }

    let mut answers: HashMap<crate::mask::NodeId, ResolveOutcome> = HashMap::new();
    let mut waiting = peers;
    let deadline = std::time::Instant::now() + RESOLVE_INTERVAL;
    while !waiting.is_empty() {
        let now = std::time::Instant::now();
        if now >= deadline || ctx.is_shutdown() {
            break;
        }
        match dmq.pop_timeout(waiting, deadline - now) {
            DmqPop::Message { from, payload } => {
                let msg = match ArbiterMessage::decode(&payload) {
                    Ok(msg) => msg,
                    Err(err) => {
                        tracing::error!(from, error = %err, "undecodable status reply");
                        ctx.membership.note_disconnect(from);
                        continue;
                    }
                };
                if msg.code != MessageCode::Status || msg.gid != Some(gid) {
                    tracing::debug!(from, code = ?msg.code, "ignoring stray resolver reply");
                    continue;
                }
                answers.insert(from, ResolveOutcome::from_wire(msg.sxid));
                waiting.remove(from);
            }
            DmqPop::Detached { from } => {
                ctx.membership.note_disconnect(from);
                waiting.remove(from);
            }
            DmqPop::TimedOut => break,
            DmqPop::Shutdown => return Resolution::Unknown,
        }
    }

    if answers.values().any(|o| *o == ResolveOutcome::Commit) {
        return finish(ctx, gid, true);
    }
    if answers.values().any(|o| *o == ResolveOutcome::Abort) {
        return finish(ctx, gid, false);
    }
    if !waiting.is_empty() {
        // Poll timeout: not every peer answered, so unanimity is unknown.
        return Resolution::Unknown;
    }

    // Everyone answered UNKNOWN: decide by how far we got ourselves. Past
    // precommit the coordinator had decided to commit. A plain prepare is
    // presumed aborted, but only once its coordinator is provably gone;
    // a live origin may simply not have decided yet.
    match ctx.engine.prepared_state(gid) {
        Some(PreparedState::Precommitted) => finish(ctx, gid, true),
        Some(PreparedState::Prepared) => {
            let origin_gone =
                gid.origin == ctx.self_id() || ctx.membership.is_disabled(gid.origin);
            if origin_gone {
                finish(ctx, gid, false)
            } else {
                Resolution::Unknown
            }
        }
        None => Resolution::Unknown,
    }
}

fn finish(ctx: &CoreContext, gid: Gid, commit: bool) -> Resolution {
    if let Err(err) = ctx.engine.finish_prepared(gid, commit) {
        tracing::warn!(gid = %gid, commit, error = ?err, "failed to finish orphan");
        return Resolution::Unknown;
    }
    if commit {
        Resolution::Committed
    } else {
        Resolution::Aborted
    }
}
