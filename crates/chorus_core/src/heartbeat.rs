//! Heartbeat broadcast and the service listener.
//!
//! The sender thread broadcasts our connectivity view to every configured
//! peer and drives the membership ticker. The service thread answers
//! everything that is not tied to a particular transaction: heartbeats,
//! resolver status polls, and deadlock victim aborts.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::sleep_unless;
use crate::context::{CoreContext, CONTROL_STREAM, HEARTBEAT_STREAM, RESOLVER_STREAM};
use crate::dmq::DmqPop;
use crate::mask::NodeMask;
use crate::messages::{ArbiterMessage, MessageCode};

/// Back-off after a detach notification so a dead peer does not spin the
/// listener.
const DETACH_BACKOFF: Duration = Duration::from_millis(100);

/// Broadcast loop; also the membership ticker.
pub fn run_sender(ctx: Arc<CoreContext>) {
    let mut dmq = ctx.dmq.open();
    let interval = Duration::from_millis(ctx.cfg.heartbeat_send_timeout_ms);

    loop {
        let now = ctx.clock.now_us();
        ctx.membership.tick(now);

        let connectivity = ctx.membership.connectivity_bits();
        let recovery_count = ctx.membership.recovery_count();
        for peer in ctx.peers().iter() {
            // The lsn field acks how far we have applied this peer's own
            // stream; the peer uses it to decide when it may go online.
            let msg = ArbiterMessage::heartbeat(
                ctx.self_id(),
                connectivity,
                recovery_count,
                ctx.syncpoints.applied(peer),
            );
            if let Err(err) = dmq.push(peer, HEARTBEAT_STREAM, &msg.encode()) {
                tracing::debug!(peer, error = ?err, "heartbeat push failed");
            }
        }

        if !sleep_unless(&ctx.shutdown, interval) {
            return;
        }
    }
}

/// Listener for heartbeats and control traffic.
pub fn run_service(ctx: Arc<CoreContext>) {
    let mut dmq = ctx.dmq.open();
    dmq.stream_subscribe(HEARTBEAT_STREAM);
    dmq.stream_subscribe(CONTROL_STREAM);
    let poll = Duration::from_millis(ctx.cfg.heartbeat_send_timeout_ms);

    loop {
        if ctx.is_shutdown() {
            return;
        }
        match dmq.pop_timeout(ctx.peers(), poll) {
            DmqPop::Message { from, payload } => {
                let msg = match ArbiterMessage::decode(&payload) {
                    Ok(msg) => msg,
                    Err(err) => {
                        tracing::error!(from, error = %err, "undecodable control frame, dropping peer");
                        ctx.membership.note_disconnect(from);
                        continue;
                    }
                };
                handle(&ctx, &mut *dmq, from, msg);
            }
            DmqPop::Detached { from } => {
                ctx.membership.note_disconnect(from);
                if !sleep_unless(&ctx.shutdown, DETACH_BACKOFF) {
                    return;
                }
            }
            DmqPop::TimedOut => {}
            DmqPop::Shutdown => return,
        }
    }
}

fn handle(
    ctx: &CoreContext,
    dmq: &mut dyn crate::dmq::DmqHandle,
    from: crate::mask::NodeId,
    msg: ArbiterMessage,
) {
    match msg.code {
        MessageCode::Heartbeat => {
            ctx.membership.note_peer(
                from,
                NodeMask::from_bits(msg.connectivity_mask),
                msg.oxid,
                ctx.clock.now_us(),
            );
            ctx.membership.note_peer_progress(from, msg.lsn);
        }
        MessageCode::PollStatus => {
            let Some(gid) = msg.gid else {
                tracing::warn!(from, "status poll without gid");
                return;
            };
            let outcome = ctx.engine.gid_outcome(gid);
            let reply = ArbiterMessage::status(ctx.self_id(), gid, outcome);
            if let Err(err) = dmq.push(from, RESOLVER_STREAM, &reply.encode()) {
                tracing::warn!(from, error = ?err, "status reply push failed");
            }
        }
        MessageCode::Abort => {
            // Deadlock victim broadcast from the elected detector.
            let Some(gid) = msg.gid else {
                tracing::warn!(from, "abort broadcast without gid");
                return;
            };
            tracing::info!(gid = %gid, from, "aborting deadlock victim");
            if let Err(err) = ctx.engine.abort(gid) {
                tracing::warn!(gid = %gid, error = ?err, "victim abort failed");
            }
        }
        other => {
            tracing::warn!(from, code = ?other, "unexpected code on control stream");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use crate::config::CoreConfig;
    use crate::dmq::{DmqEndpoint, DmqHandle, MemoryDmqBus};
    use crate::engine::{HostEngine, PreparedState, WaitEdge};
    use crate::gid::Gid;
    use crate::mask::NodeId;
    use crate::messages::ResolveOutcome;

    struct StatusEngine {
        outcome: Mutex<ResolveOutcome>,
        aborted: Mutex<Vec<Gid>>,
    }

    impl Default for StatusEngine {
        fn default() -> StatusEngine {
            StatusEngine {
                outcome: Mutex::new(ResolveOutcome::Unknown),
                aborted: Mutex::new(Vec::new()),
            }
        }
    }

    impl HostEngine for StatusEngine {
        fn begin(&self) -> u64 {
            1
        }
        fn changeset(&self, _xid: u64) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn prepare(&self, _xid: u64, _gid: Gid) -> anyhow::Result<bool> {
            Ok(true)
        }
        fn apply_prepare(&self, _gid: Gid, _changeset: &[u8]) -> anyhow::Result<bool> {
            Ok(true)
        }
        fn set_prepared_state(&self, _gid: Gid, _state: PreparedState) -> anyhow::Result<()> {
            Ok(())
        }
        fn finish_prepared(&self, _gid: Gid, _commit: bool) -> anyhow::Result<()> {
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
            *self.outcome.lock().unwrap()
        }
        fn wait_graph(&self) -> Vec<WaitEdge> {
            Vec::new()
        }
        fn abort(&self, gid: Gid) -> anyhow::Result<()> {
            self.aborted.lock().unwrap().push(gid);
            Ok(())
        }
        fn catch_up(&self, _donor: NodeId) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn ctx_with(bus: &MemoryDmqBus, engine: Arc<StatusEngine>) -> Arc<CoreContext> {
        CoreContext::new(
            CoreConfig {
                node_id: 1,
                max_nodes: 2,
                ..CoreConfig::default()
            },
            2,
            engine,
            bus.endpoint(1),
            None,
        )
        .unwrap()
    }

    #[test]
    fn heartbeat_updates_membership_view() {
        let bus = MemoryDmqBus::new();
        let engine = Arc::new(StatusEngine::default());
        let ctx = ctx_with(&bus, engine);
        let service = {
            let ctx = ctx.clone();
            std::thread::spawn(move || run_service(ctx))
        };
        std::thread::sleep(Duration::from_millis(50));

        let mut peer = bus.endpoint(2).open();
        let hb = ArbiterMessage::heartbeat(2, 0b01, 3, 42);
        peer.push(1, HEARTBEAT_STREAM, &hb.encode()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ctx.membership.peer_recovery_count(2) != 3 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(ctx.membership.pending_enable().contains(2));

        ctx.shutdown.store(true, Ordering::Release);
        service.join().unwrap();
    }

    #[test]
    fn status_poll_answered_from_engine() {
        let bus = MemoryDmqBus::new();
        let engine = Arc::new(StatusEngine::default());
        *engine.outcome.lock().unwrap() = ResolveOutcome::Commit;
        let ctx = ctx_with(&bus, engine);
        let service = {
            let ctx = ctx.clone();
            std::thread::spawn(move || run_service(ctx))
        };
        std::thread::sleep(Duration::from_millis(50));

        let gid = Gid::new(2, 9);
        let mut peer = bus.endpoint(2).open();
        peer.stream_subscribe(RESOLVER_STREAM);
        peer.push(
            1,
            CONTROL_STREAM,
            &ArbiterMessage::poll_status(2, gid).encode(),
        )
        .unwrap();
        match peer.pop_timeout(NodeMask::single(1), Duration::from_secs(5)) {
            DmqPop::Message { payload, .. } => {
                let msg = ArbiterMessage::decode(&payload).unwrap();
                assert_eq!(msg.code, MessageCode::Status);
                assert_eq!(ResolveOutcome::from_wire(msg.sxid), ResolveOutcome::Commit);
                assert_eq!(msg.gid, Some(gid));
            }
            other => panic!("expected status reply, got {other:?}"),
        }
        ctx.shutdown.store(true, Ordering::Release);
        service.join().unwrap();
    }

    #[test]
    fn victim_abort_reaches_engine() {
        let bus = MemoryDmqBus::new();
        let engine = Arc::new(StatusEngine::default());
        let ctx = ctx_with(&bus, engine.clone());
        let service = {
            let ctx = ctx.clone();
            std::thread::spawn(move || run_service(ctx))
        };
        std::thread::sleep(Duration::from_millis(50));

        let gid = Gid::new(1, 33);
        let mut detector = bus.endpoint(2).open();
        let mut abort = ArbiterMessage::new(MessageCode::Abort, 2);
        abort.gid = Some(gid);
        detector.push(1, CONTROL_STREAM, &abort.encode()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while engine.aborted.lock().unwrap().is_empty() {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*engine.aborted.lock().unwrap(), vec![gid]);
        ctx.shutdown.store(true, Ordering::Release);
        service.join().unwrap();
    }

    #[test]
    fn sender_broadcasts_and_ticks() {
        let bus = MemoryDmqBus::new();
        let engine = Arc::new(StatusEngine::default());
        let ctx = ctx_with(&bus, engine);
        let mut peer = bus.endpoint(2).open();
        peer.stream_subscribe(HEARTBEAT_STREAM);

        let sender = {
            let ctx = ctx.clone();
            std::thread::spawn(move || run_sender(ctx))
        };
        match peer.pop_timeout(NodeMask::single(1), Duration::from_secs(5)) {
            DmqPop::Message { payload, .. } => {
                let msg = ArbiterMessage::decode(&payload).unwrap();
                assert_eq!(msg.code, MessageCode::Heartbeat);
                assert_eq!(msg.node, 1);
            }
            other => panic!("expected heartbeat, got {other:?}"),
        }
        ctx.shutdown.store(true, Ordering::Release);
        sender.join().unwrap();
    }
}
