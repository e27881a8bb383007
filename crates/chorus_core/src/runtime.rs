//! Background worker wiring for one node.
//!
//! Owns the thread set described in the concurrency model: heartbeat
//! sender, service listener, one apply receiver per peer, the deadlock
//! detector, the resolver, and the monitor that drives recovery and
//! installs returning participants under the commit barrier.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::apply;
use crate::clock::sleep_unless;
use crate::context::CoreContext;
use crate::ddd;
use crate::heartbeat;
use crate::membership::NodeStatus;
use crate::resolver;

/// Monitor poll cadence.
const MONITOR_POLL: Duration = Duration::from_millis(100);

pub struct ClusterRuntime {
    ctx: Arc<CoreContext>,
    threads: Vec<JoinHandle<()>>,
}

impl ClusterRuntime {
    pub fn start(ctx: Arc<CoreContext>) -> ClusterRuntime {
        let mut threads = Vec::new();
        let spawn = |name: &str, f: Box<dyn FnOnce() + Send>| {
            std::thread::Builder::new()
                .name(name.to_string())
                .spawn(f)
                .expect("spawn worker thread")
        };

        {
            let ctx = ctx.clone();
            threads.push(spawn("hb-sender", Box::new(move || heartbeat::run_sender(ctx))));
        }
        {
            let ctx = ctx.clone();
            threads.push(spawn("service", Box::new(move || heartbeat::run_service(ctx))));
        }
        {
            let ctx = ctx.clone();
            threads.push(spawn("ddd", Box::new(move || ddd::run(ctx))));
        }
        {
            let ctx = ctx.clone();
            threads.push(spawn("resolver", Box::new(move || resolver::run(ctx))));
        }
        for peer in ctx.peers().iter() {
            let ctx = ctx.clone();
            threads.push(spawn(
                &format!("apply-{peer}"),
                Box::new(move || apply::run_receiver(ctx, peer)),
            ));
        }
        {
            let ctx = ctx.clone();
            threads.push(spawn("monitor", Box::new(move || monitor_loop(ctx))));
        }

        ClusterRuntime { ctx, threads }
    }

    pub fn ctx(&self) -> &Arc<CoreContext> {
        &self.ctx
    }

    /// Raise the shutdown flag and join every worker.
    pub fn shutdown(mut self) {
        self.ctx.shutdown.store(true, Ordering::Release);
        for thread in self.threads.drain(..) {
            if let Err(err) = thread.join() {
                tracing::error!(?err, "worker thread panicked");
            }
        }
    }
}

/// Drives recovery and the apply-guard install of returning peers.
fn monitor_loop(ctx: Arc<CoreContext>) {
    while sleep_unless(&ctx.shutdown, MONITOR_POLL) {
        // Returning peers become commit participants only under the
        // exclusive barrier.
        for peer in ctx.membership.pending_enable().iter() {
            apply::install_participant(&ctx, peer);
        }

        if ctx.membership.status() == NodeStatus::Recovery {
            let donor = ctx.membership.read().donor;
            match donor {
                Some(donor) => match ctx.engine.catch_up(donor) {
                    Ok(()) => {
                        ctx.membership.caught_up(ctx.syncpoints.origin_lsn());
                    }
                    Err(err) => {
                        tracing::warn!(donor, error = ?err, "catch-up failed, will retry");
                    }
                },
                // Referee winner recovers alone; there is nothing to copy.
                None => ctx.membership.caught_up(ctx.syncpoints.origin_lsn()),
            }
        }
    }
}
