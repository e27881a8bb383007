//! Receiver side: apply replicated transactions in origin order.
//!
//! One receiver loop per peer pops that peer's stream and feeds a bounded
//! per-peer pool; the pool's executor applies frames in order and sends
//! votes back to the coordinator. Re-enabling a peer as a commit
//! participant happens under the exclusive commit barrier, which is the
//! interlock that keeps a fresh receiver from seeing a PRECOMMIT for a
//! PREPARE it never received.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::clock::sleep_unless;
use crate::context::{apply_stream, xid_stream, CoreContext};
use crate::dmq::{DmqHandle, DmqPop};
use crate::engine::PreparedState;
use crate::mask::{NodeId, NodeMask};
use crate::messages::{ArbiterMessage, MessageCode};
use crate::pool::BgwPool;

/// Receive poll granularity; bounds shutdown latency.
const RECV_POLL: Duration = Duration::from_millis(200);
/// Back-off after observing a detached origin.
const DETACH_BACKOFF: Duration = Duration::from_millis(500);

/// Install `peer` into the coordinators' participant-eligibility set.
///
/// Taking the barrier exclusively drains every in-flight coordinator, so
/// after release every commit that captures its participant mask sees
/// `peer` and will send it the PREPARE for anything it later PRECOMMITs.
/// `stop_new_commits` keeps fresh commits from starving the exclusive
/// acquisition.
pub fn install_participant(ctx: &CoreContext, peer: NodeId) {
    ctx.stop_new_commits.store(true, Ordering::Release);
    {
        let _barrier = ctx.commit_barrier.write().unwrap();
        ctx.membership.enable_peer(peer);
    }
    ctx.stop_new_commits.store(false, Ordering::Release);
    tracing::info!(
        peer,
        resume_from = ctx.syncpoints.resume_from(peer),
        "participant installed under commit barrier"
    );
}

/// Receiver loop for one peer: pop, hand to the pool, track liveness.
pub fn run_receiver(ctx: Arc<CoreContext>, origin: NodeId) {
    let pool = BgwPool::new(ctx.cfg.queue_size);
    let executor = {
        let ctx = ctx.clone();
        let pool = pool.clone();
        std::thread::Builder::new()
            .name(format!("apply-exec-{origin}"))
            .spawn(move || run_executor(ctx, origin, pool))
            .expect("spawn apply executor")
    };

    let mut dmq = ctx.dmq.open();
    dmq.stream_subscribe(&apply_stream(origin));
    let spill_bytes = ctx.cfg.trans_spill_threshold_kb * 1024;

    loop {
        if ctx.is_shutdown() {
            break;
        }
        match dmq.pop_timeout(NodeMask::single(origin), RECV_POLL) {
            DmqPop::Message { payload, .. } => {
                if payload.len() > spill_bytes {
                    tracing::debug!(
                        origin,
                        bytes = payload.len(),
                        "transaction over spill threshold, applying unbuffered"
                    );
                }
                pool.submit(payload)
            }
            DmqPop::Detached { .. } => {
                ctx.membership.note_disconnect(origin);
                // Outcomes for anything this session prepared are not
                // coming any more; the resolver takes over.
                ctx.engine.disown_origin(origin);
                if !sleep_unless(&ctx.shutdown, DETACH_BACKOFF) {
                    break;
                }
            }
            DmqPop::TimedOut => {}
            DmqPop::Shutdown => break,
        }
    }
    pool.close();
    let _ = executor.join();
}

fn run_executor(ctx: Arc<CoreContext>, origin: NodeId, pool: Arc<BgwPool>) {
    let mut dmq = ctx.dmq.open();
    while let Some(payload) = pool.take() {
        if let Err(err) = execute_one(&ctx, origin, dmq.as_mut(), &payload) {
            tracing::warn!(origin, error = ?err, "apply failed");
        }
        pool.finish();
    }
}

/// Apply one frame from `origin` and vote back on its reply stream.
fn execute_one(
    ctx: &CoreContext,
    origin: NodeId,
    dmq: &mut dyn DmqHandle,
    payload: &[u8],
) -> anyhow::Result<()> {
    let (msg, changeset) = match ArbiterMessage::decode_prefix(payload) {
        Ok(decoded) => decoded,
        Err(err) => {
            // Fatal by contract: drop the connection and let membership
            // handle the rest.
            tracing::error!(origin, error = %err, "undecodable apply frame, dropping peer");
            ctx.membership.note_disconnect(origin);
            return Err(err.into());
        }
    };
    debug_assert_eq!(msg.node, origin);
    let gid = msg.gid.context("apply frame without gid")?;

    match msg.code {
        MessageCode::Prepare => {
            // An engine failure here is an abort vote, not a lost reply:
            // the coordinator must hear something for every participant.
            let ok = match ctx.engine.apply_prepare(gid, changeset) {
                Ok(ok) => ok,
                Err(err) => {
                    tracing::warn!(gid = %gid, origin, error = ?err, "apply prepare errored");
                    false
                }
            };
            tracing::debug!(gid = %gid, origin, ok, "applied prepare");
            let code = if ok {
                MessageCode::Prepared
            } else {
                MessageCode::Aborted
            };
            vote(ctx, dmq, origin, &msg, code)?;
        }
        MessageCode::Precommit => {
            ctx.engine
                .set_prepared_state(gid, PreparedState::Precommitted)?;
            vote(ctx, dmq, origin, &msg, MessageCode::Precommitted)?;
        }
        MessageCode::Committed => {
            ctx.engine.finish_prepared(gid, true)?;
            ctx.syncpoints.note_applied(origin, msg.lsn);
            tracing::debug!(gid = %gid, origin, lsn = msg.lsn, "applied commit");
            vote(ctx, dmq, origin, &msg, MessageCode::Committed)?;
        }
        MessageCode::Abort => {
            // Coordinator-side abort after a failed gather; idempotent.
            ctx.engine.abort(gid)?;
            tracing::debug!(gid = %gid, origin, "applied abort");
        }
        other => {
            tracing::warn!(origin, code = ?other, "unexpected code on apply stream");
        }
    }
    Ok(())
}

fn vote(
    ctx: &CoreContext,
    dmq: &mut dyn DmqHandle,
    origin: NodeId,
    request: &ArbiterMessage,
    code: MessageCode,
) -> anyhow::Result<()> {
    let gid = request.gid.context("vote without gid")?;
    let mut reply = ArbiterMessage::vote(code, ctx.self_id(), request.dxid, gid);
    reply.connectivity_mask = ctx.membership.connectivity_bits();
    reply.lsn = ctx.syncpoints.applied(origin);
    dmq.push(origin, &xid_stream(request.dxid), &reply.encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::RwLock;

    use crate::config::CoreConfig;
    use crate::context::CoreContext;
    use crate::dmq::{DmqEndpoint, MemoryDmqBus};
    use crate::engine::{HostEngine, WaitEdge};
    use crate::gid::Gid;
    use crate::messages::ResolveOutcome;

    /// Engine stub tracking prepared-state transitions for one gid.
    #[derive(Default)]
    struct TraceEngine {
        states: RwLock<Vec<String>>,
        refuse: AtomicBool,
    }

    impl TraceEngine {
        fn trail(&self) -> Vec<String> {
            self.states.read().unwrap().clone()
        }
        fn push(&self, s: String) {
            self.states.write().unwrap().push(s);
        }
    }

    impl HostEngine for TraceEngine {
        fn begin(&self) -> u64 {
            1
        }
        fn changeset(&self, _xid: u64) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn prepare(&self, _xid: u64, _gid: Gid) -> anyhow::Result<bool> {
            Ok(true)
        }
        fn apply_prepare(&self, gid: Gid, changeset: &[u8]) -> anyhow::Result<bool> {
            self.push(format!("prepare {gid} {}b", changeset.len()));
            Ok(!self.refuse.load(Ordering::Acquire))
        }
        fn set_prepared_state(&self, gid: Gid, _state: PreparedState) -> anyhow::Result<()> {
            self.push(format!("precommit {gid}"));
            Ok(())
        }
        fn finish_prepared(&self, gid: Gid, commit: bool) -> anyhow::Result<()> {
            self.push(format!(
                "finish {gid} {}",
                if commit { "commit" } else { "abort" }
            ));
            Ok(())
        }
        fn prepared_state(&self, _gid: Gid) -> Option<PreparedState> {
            None
        }
        fn orphaned_prepared(&self) -> Vec<Gid> {
            Vec::new()
        }
        fn disown(&self, _gid: Gid) {}
        fn disown_origin(&self, _origin: NodeId) {}
        fn gid_outcome(&self, _gid: Gid) -> ResolveOutcome {
            ResolveOutcome::Unknown
        }
        fn wait_graph(&self) -> Vec<WaitEdge> {
            Vec::new()
        }
        fn abort(&self, gid: Gid) -> anyhow::Result<()> {
            self.push(format!("abort {gid}"));
            Ok(())
        }
        fn catch_up(&self, _donor: NodeId) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn ctx_with(bus: &MemoryDmqBus, engine: Arc<TraceEngine>) -> Arc<CoreContext> {
        CoreContext::new(
            CoreConfig {
                node_id: 2,
                max_nodes: 3,
                ..CoreConfig::default()
            },
            3,
            engine,
            bus.endpoint(2),
            None,
        )
        .unwrap()
    }

    fn frame(code: MessageCode, origin: NodeId, xid: u64, extra: &[u8]) -> Vec<u8> {
        let mut msg = ArbiterMessage::vote(code, origin, xid, Gid::new(origin, xid));
        msg.lsn = 9;
        let mut buf = msg.encode();
        buf.extend_from_slice(extra);
        buf
    }

    #[test]
    fn frames_apply_in_order_and_vote_back() {
        let bus = MemoryDmqBus::new();
        let engine = Arc::new(TraceEngine::default());
        let ctx = ctx_with(&bus, engine.clone());

        let mut origin = bus.endpoint(1).open();
        origin.stream_subscribe(&xid_stream(7));

        let worker = {
            let ctx = ctx.clone();
            std::thread::spawn(move || run_receiver(ctx, 1))
        };

        // Let the receiver subscribe before pushing.
        std::thread::sleep(Duration::from_millis(50));
        origin
            .push(2, &apply_stream(1), &frame(MessageCode::Prepare, 1, 7, b"rows"))
            .unwrap();
        origin
            .push(2, &apply_stream(1), &frame(MessageCode::Precommit, 1, 7, b""))
            .unwrap();
        origin
            .push(2, &apply_stream(1), &frame(MessageCode::Committed, 1, 7, b""))
            .unwrap();

        let mut codes = Vec::new();
        for _ in 0..3 {
            match origin.pop_timeout(NodeMask::single(2), Duration::from_secs(5)) {
                DmqPop::Message { payload, .. } => {
                    codes.push(ArbiterMessage::decode(&payload).unwrap().code);
                }
                other => panic!("expected vote, got {other:?}"),
            }
        }
        assert_eq!(
            codes,
            vec![
                MessageCode::Prepared,
                MessageCode::Precommitted,
                MessageCode::Committed
            ]
        );
        let gid = Gid::new(1, 7);
        assert_eq!(
            engine.trail(),
            vec![
                format!("prepare {gid} 4b"),
                format!("precommit {gid}"),
                format!("finish {gid} commit"),
            ]
        );
        assert_eq!(ctx.syncpoints.applied(1), 9);

        ctx.shutdown.store(true, Ordering::Release);
        worker.join().unwrap();
    }

    #[test]
    fn refused_prepare_votes_aborted() {
        let bus = MemoryDmqBus::new();
        let engine = Arc::new(TraceEngine::default());
        engine.refuse.store(true, Ordering::Release);
        let ctx = ctx_with(&bus, engine);

        let mut origin = bus.endpoint(1).open();
        origin.stream_subscribe(&xid_stream(8));
        let worker = {
            let ctx = ctx.clone();
            std::thread::spawn(move || run_receiver(ctx, 1))
        };
        std::thread::sleep(Duration::from_millis(50));
        origin
            .push(2, &apply_stream(1), &frame(MessageCode::Prepare, 1, 8, b""))
            .unwrap();
        match origin.pop_timeout(NodeMask::single(2), Duration::from_secs(5)) {
            DmqPop::Message { payload, .. } => {
                assert_eq!(
                    ArbiterMessage::decode(&payload).unwrap().code,
                    MessageCode::Aborted
                );
            }
            other => panic!("expected abort vote, got {other:?}"),
        }
        ctx.shutdown.store(true, Ordering::Release);
        worker.join().unwrap();
    }

    #[test]
    fn undecodable_frame_disables_origin() {
        let bus = MemoryDmqBus::new();
        let engine = Arc::new(TraceEngine::default());
        let ctx = ctx_with(&bus, engine);
        // Origin starts enabled for the purpose of the test.
        ctx.membership.enable_peer(1);

        let worker = {
            let ctx = ctx.clone();
            std::thread::spawn(move || run_receiver(ctx, 1))
        };
        std::thread::sleep(Duration::from_millis(50));
        let mut origin = bus.endpoint(1).open();
        origin.push(2, &apply_stream(1), b"garbage").unwrap();
        // The bad frame must flip the origin back to disabled.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !ctx.membership.is_disabled(1) {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        ctx.shutdown.store(true, Ordering::Release);
        worker.join().unwrap();
    }

    #[test]
    fn install_participant_enables_under_barrier() {
        let bus = MemoryDmqBus::new();
        let engine = Arc::new(TraceEngine::default());
        let ctx = ctx_with(&bus, engine);
        assert!(ctx.membership.is_disabled(1));
        install_participant(&ctx, 1);
        assert!(!ctx.membership.is_disabled(1));
        assert!(!ctx.stop_new_commits.load(Ordering::Acquire));
    }
}
