//! Three-phase distributed commit, the coordinator side.
//!
//! A local read-write transaction becomes globally durable in three
//! sweeps: PREPARE everywhere, PRECOMMIT everywhere, COMMIT everywhere.
//! Failures before the precommit gather abort the transaction; anything
//! later is already decided and stragglers are cleaned up by the resolver.
//! Liveness during a gather comes from the membership tracker demoting an
//! unreachable peer, never from a wall-clock timeout.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::clock::sleep_unless;
use crate::context::{apply_stream, xid_stream, CommitOutcome, CoreContext, CurrentTx};
use crate::dmq::{DmqHandle, DmqPop};
use crate::error::CommitError;
use crate::mask::NodeMask;
use crate::membership::NodeStatus;
use crate::messages::{ArbiterMessage, MessageCode};

/// How long one blocked receive waits before re-checking for shutdown.
const GATHER_POLL: Duration = Duration::from_secs(1);
/// Back-off while waiting for the membership tracker to confirm a detach.
const DETACH_CONFIRM_WAIT: Duration = Duration::from_millis(100);

pub fn three_phase_commit(
    ctx: &CoreContext,
    tx: &mut CurrentTx,
) -> Result<CommitOutcome, CommitError> {
    let self_id = ctx.self_id();
    let mut dmq = ctx.dmq.open();
    for peer in ctx.peers().iter() {
        if let Err(err) = dmq.attach_receiver(&format!("node{peer}"), peer) {
            tracing::warn!(peer, error = ?err, "failed to attach reply receiver");
        }
    }
    let stream = xid_stream(tx.xid);
    dmq.stream_subscribe(&stream);
    tracing::debug!(gid = %tx.gid, stream, "subscribed for replies");

    // Barrier: a recovering receiver may be installing a participant bit.
    while ctx.stop_new_commits.load(Ordering::Acquire) {
        if !sleep_unless(&ctx.shutdown, Duration::from_secs(1)) {
            return Err(CommitError::Shutdown);
        }
    }
    let barrier = ctx.commit_barrier.read().unwrap();

    // Snapshot the participant set; the mask may only shrink from here.
    let membership = ctx.membership.read();
    if membership.status != NodeStatus::Online {
        return Err(CommitError::WentOffline);
    }
    let participants = NodeMask::full(ctx.all_nodes())
        .difference(membership.disabled)
        .without(self_id);
    tx.participants = participants;
    debug_assert!(!participants.contains(self_id));

    // A commit accepted by less than a strict majority would be lost by
    // the next clique vote; refuse up front. A referee winner commits
    // alone by design.
    let quorum = (participants.count() + 1) * 2 > ctx.all_nodes();
    if !quorum && !membership.referee_grant {
        return Err(CommitError::WentOffline);
    }

    let changeset = match ctx.engine.changeset(tx.xid) {
        Ok(changeset) => changeset,
        Err(err) => {
            tracing::warn!(gid = %tx.gid, error = ?err, "could not decode local change set");
            return Err(CommitError::PrepareFailed(self_id));
        }
    };

    match ctx.engine.prepare(tx.xid, tx.gid) {
        Ok(true) => {}
        Ok(false) => {
            if !ctx.cfg.volkswagen_mode {
                tracing::warn!(gid = %tx.gid, "failed to prepare transaction");
            }
            return Err(CommitError::PrepareFailed(self_id));
        }
        Err(err) => {
            tracing::warn!(gid = %tx.gid, error = ?err, "local prepare errored");
            return Err(CommitError::PrepareFailed(self_id));
        }
    }
    tracing::debug!(gid = %tx.gid, "prepared");

    let lsn = ctx.syncpoints.next_origin_lsn();
    let mut frame = ArbiterMessage::vote(MessageCode::Prepare, self_id, tx.xid, tx.gid);
    frame.connectivity_mask = ctx.membership.connectivity_bits();
    frame.lsn = lsn;
    let mut payload = frame.encode();
    payload.extend_from_slice(&changeset);
    broadcast(ctx, dmq.as_mut(), participants, &payload);

    match gather_or_disown(ctx, dmq.as_mut(), tx, participants, MessageCode::Prepared)? {
        Gather::AllGood { .. } => {}
        Gather::Failed { at } => {
            dmq.stream_unsubscribe(&stream);
            // Tell everyone who prepared to roll back, then abort locally.
            let abort = ArbiterMessage::vote(MessageCode::Abort, self_id, tx.xid, tx.gid);
            broadcast(ctx, dmq.as_mut(), participants, &abort.encode());
            if let Err(err) = ctx.engine.finish_prepared(tx.gid, false) {
                tracing::warn!(gid = %tx.gid, error = ?err, "local rollback of prepared tx failed");
            }
            tracing::debug!(gid = %tx.gid, "aborted");
            return Err(CommitError::PrepareFailed(at));
        }
    }

    // Every participant holds the prepare; make the outcome recoverable.
    if let Err(err) = ctx
        .engine
        .set_prepared_state(tx.gid, crate::engine::PreparedState::Precommitted)
    {
        tracing::warn!(gid = %tx.gid, error = ?err, "local precommit failed");
        let abort = ArbiterMessage::vote(MessageCode::Abort, self_id, tx.xid, tx.gid);
        broadcast(ctx, dmq.as_mut(), participants, &abort.encode());
        if let Err(err) = ctx.engine.finish_prepared(tx.gid, false) {
            tracing::warn!(gid = %tx.gid, error = ?err, "local rollback of prepared tx failed");
        }
        return Err(CommitError::PrepareFailed(self_id));
    }
    tracing::debug!(gid = %tx.gid, "precommitted");

    let mut precommit = ArbiterMessage::vote(MessageCode::Precommit, self_id, tx.xid, tx.gid);
    precommit.lsn = lsn;
    broadcast(ctx, dmq.as_mut(), participants, &precommit.encode());
    gather_or_disown(ctx, dmq.as_mut(), tx, participants, MessageCode::Precommitted)?;

    // The transaction is now committed globally no matter what fails
    // below; peers that miss the commit record are finished by the
    // resolver.
    if let Err(err) = ctx.engine.finish_prepared(tx.gid, true) {
        tracing::error!(gid = %tx.gid, error = ?err, "local commit of precommitted tx failed");
    }
    tracing::debug!(gid = %tx.gid, "committed");

    let mut commit = ArbiterMessage::vote(MessageCode::Committed, self_id, tx.xid, tx.gid);
    commit.lsn = lsn;
    broadcast(ctx, dmq.as_mut(), participants, &commit.encode());
    // No error may surface past this point: the transaction is committed
    // and reporting a failure would invite the client to resubmit it.
    // Peers that missed the ack round are finished by the resolver.
    if let Err(err) = gather(ctx, dmq.as_mut(), tx, participants, MessageCode::Committed) {
        tracing::warn!(
            gid = %tx.gid,
            error = %err,
            "commit ack gather interrupted, stragglers left to the resolver"
        );
    }

    drop(barrier);
    dmq.stream_unsubscribe(&stream);

    ctx.syncpoints
        .maybe_log_syncpoint(ctx.clock.now_us(), ctx.cfg.syncpoint_interval_ms * 1000);

    Ok(CommitOutcome::Distributed { participants })
}

fn broadcast(
    ctx: &CoreContext,
    dmq: &mut dyn DmqHandle,
    participants: NodeMask,
    payload: &[u8],
) {
    let stream = apply_stream(ctx.self_id());
    for peer in participants.iter() {
        if let Err(err) = dmq.push(peer, &stream, payload) {
            tracing::warn!(peer, error = ?err, "push failed, relying on membership to drop peer");
        }
    }
}

enum Gather {
    AllGood,
    Failed { at: crate::mask::NodeId },
}

/// Gather, but if the wait is abandoned (we went offline or the process
/// is shutting down), orphan the local prepared transaction so the
/// resolver decides its fate later.
fn gather_or_disown(
    ctx: &CoreContext,
    dmq: &mut dyn DmqHandle,
    tx: &CurrentTx,
    participants: NodeMask,
    expect: MessageCode,
) -> Result<Gather, CommitError> {
    match gather(ctx, dmq, tx, participants, expect) {
        Ok(gathered) => Ok(gathered),
        Err(err) => {
            tracing::warn!(gid = %tx.gid, error = %err, "gather abandoned, orphaning prepared tx");
            ctx.engine.disown(tx.gid);
            Err(err)
        }
    }
}

/// Wait for one reply per participant bit.
///
/// A bit clears when the reply arrives or when the peer is confirmed dead
/// by the membership tracker. During the prepare gather an `ABORTED` vote
/// or a dead peer fails the transaction; in later phases a dead peer is
/// simply dropped, because the outcome is already decided.
fn gather(
    ctx: &CoreContext,
    dmq: &mut dyn DmqHandle,
    tx: &CurrentTx,
    participants: NodeMask,
    expect: MessageCode,
) -> Result<Gather, CommitError> {
    let gathering_prepares = expect == MessageCode::Prepared;
    let mut remaining = participants;
    let mut ok = true;
    let mut failed_at = ctx.self_id();
    let mut accepted = 1usize; // self

    while !remaining.is_empty() {
        if ctx.is_shutdown() {
            return Err(CommitError::Shutdown);
        }
        match dmq.pop_timeout(remaining, GATHER_POLL) {
            DmqPop::Message { from, payload } => {
                let msg = match ArbiterMessage::decode(&payload) {
                    Ok(msg) => msg,
                    Err(err) => {
                        tracing::error!(from, error = %err, "undecodable reply, dropping peer");
                        ctx.membership.note_disconnect(from);
                        continue;
                    }
                };
                debug_assert_eq!(msg.node, from);
                debug_assert_eq!(msg.dxid, tx.xid);
                if msg.code == expect {
                    tracing::trace!(gid = %tx.gid, from, code = ?msg.code, "gather: vote");
                    remaining.remove(from);
                    accepted += 1;
                } else if gathering_prepares && msg.code == MessageCode::Aborted {
                    tracing::debug!(gid = %tx.gid, from, "gather: abort vote");
                    remaining.remove(from);
                    ok = false;
                    failed_at = msg.node;
                } else {
                    tracing::warn!(
                        gid = %tx.gid,
                        from,
                        code = ?msg.code,
                        "gather: unexpected message code, ignoring"
                    );
                }
            }
            DmqPop::Detached { from } => {
                // The queue detached; wait until the membership tracker
                // agrees before dropping the peer, since we ourselves may
                // be the one going offline.
                if ctx.membership.is_disabled(from) {
                    // Our own demotion only matters while the vote is
                    // still open; once the prepares are in, the outcome
                    // is decided and dead peers are merely dropped.
                    if gathering_prepares && ctx.membership.status() != NodeStatus::Online {
                        return Err(CommitError::WentOffline);
                    }
                    tracing::debug!(gid = %tx.gid, from, "gather: dropping dead participant");
                    remaining.remove(from);
                    if gathering_prepares {
                        ok = false;
                        failed_at = from;
                    }
                } else if !sleep_unless(&ctx.shutdown, DETACH_CONFIRM_WAIT) {
                    return Err(CommitError::Shutdown);
                }
            }
            DmqPop::TimedOut => {}
            DmqPop::Shutdown => return Err(CommitError::Shutdown),
        }
    }

    if gathering_prepares && ok {
        // The capture-time quorum check makes this unreachable unless
        // peers died mid-gather; those rounds come back failed, so a
        // violation here is worth shouting about.
        let majority = 2 * accepted > ctx.all_nodes();
        if !majority && !ctx.membership.read().referee_grant {
            tracing::warn!(
                gid = %tx.gid,
                accepted,
                all_nodes = ctx.all_nodes(),
                "prepares gathered without a strict majority"
            );
        }
    }

    if ok {
        Ok(Gather::AllGood)
    } else {
        Ok(Gather::Failed { at: failed_at })
    }
}
