//! Directed message queue: the reliable inter-node channel the core
//! consumes.
//!
//! The real transport is an external collaborator; the core sees only
//! framed, in-order, at-most-once delivery per sender with disconnect
//! notification. [`MemoryDmqBus`] is an in-process implementation used by
//! embedded clusters and tests, including fault injection (node stop, link
//! cut) for partition scenarios.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::mask::{NodeId, NodeMask};

/// Result of one receive attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmqPop {
    /// A sender covered by the mask produced a message.
    Message { from: NodeId, payload: Vec<u8> },
    /// A sender covered by the mask is definitively disconnected.
    Detached { from: NodeId },
    /// `pop_timeout` deadline expired with nothing to deliver.
    TimedOut,
    /// The endpoint was shut down; the worker should exit.
    Shutdown,
}

/// Per-node factory for DMQ handles. Each worker thread opens its own
/// handle with an independent subscription set, the way each backend owns
/// its queue connection in the host.
pub trait DmqEndpoint: Send + Sync {
    fn open(&self) -> Box<dyn DmqHandle>;
}

/// One connection to the message queue. Sender identifiers surfaced by
/// `pop` are node ids.
pub trait DmqHandle: Send {
    /// Declare interest in a named peer channel. The conventional name for
    /// node `i` is `node<i>`.
    fn attach_receiver(&mut self, name: &str, peer: NodeId) -> anyhow::Result<()>;

    /// Route messages pushed to `stream` on this node to this handle.
    fn stream_subscribe(&mut self, stream: &str);

    fn stream_unsubscribe(&mut self, stream: &str);

    /// Block until a sender in `mask` produces a message or detaches.
    fn pop(&mut self, mask: NodeMask) -> DmqPop;

    /// Like `pop`, but give up after `timeout`.
    fn pop_timeout(&mut self, mask: NodeMask, timeout: Duration) -> DmqPop;

    /// Send `payload` to `stream` on node `dest`. Delivery is at most once;
    /// pushes towards unreachable nodes are dropped.
    fn push(&mut self, dest: NodeId, stream: &str, payload: &[u8]) -> anyhow::Result<()>;
}

/// How often blocked receivers re-check bus connectivity.
const POP_POLL: Duration = Duration::from_millis(25);

/// In-process message bus connecting embedded nodes.
#[derive(Clone, Default)]
pub struct MemoryDmqBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    state: Mutex<BusState>,
}

#[derive(Default)]
struct BusState {
    /// Nodes whose process is stopped.
    down: NodeMask,
    /// Severed links, stored as ordered pairs.
    cut: HashSet<(NodeId, NodeId)>,
    handles: Vec<Arc<HandleShared>>,
}

impl BusState {
    fn link_ok(&self, a: NodeId, b: NodeId) -> bool {
        !self.down.contains(a)
            && !self.down.contains(b)
            && !self.cut.contains(&pair(a, b))
    }

    /// Nodes `from` cannot currently talk to.
    fn unreachable_from(&self, from: NodeId) -> NodeMask {
        let mut mask = self.down;
        for (a, b) in &self.cut {
            if *a == from {
                mask.insert(*b);
            } else if *b == from {
                mask.insert(*a);
            }
        }
        mask.without(from)
    }

    fn wake_all(&self) {
        for handle in &self.handles {
            let _guard = handle.state.lock().unwrap();
            handle.cv.notify_all();
        }
    }
}

fn pair(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

struct HandleShared {
    node: NodeId,
    state: Mutex<HandleState>,
    cv: Condvar,
}

#[derive(Default)]
struct HandleState {
    streams: HashSet<String>,
    receivers: HashMap<String, NodeId>,
    queue: VecDeque<(NodeId, String, Vec<u8>)>,
    closed: bool,
}

impl MemoryDmqBus {
    pub fn new() -> MemoryDmqBus {
        MemoryDmqBus::default()
    }

    /// Endpoint for one embedded node.
    pub fn endpoint(&self, node: NodeId) -> Arc<MemoryDmqEndpoint> {
        Arc::new(MemoryDmqEndpoint {
            bus: self.clone(),
            node,
        })
    }

    /// Stop a node: close all of its handles and report it detached to
    /// everyone else.
    pub fn stop_node(&self, node: NodeId) {
        let mut state = self.inner.state.lock().unwrap();
        state.down.insert(node);
        for handle in &state.handles {
            if handle.node == node {
                handle.state.lock().unwrap().closed = true;
            }
        }
        state.wake_all();
    }

    /// Bring a stopped node back; its runtime opens fresh handles.
    pub fn start_node(&self, node: NodeId) {
        let mut state = self.inner.state.lock().unwrap();
        state.down.remove(node);
        state.handles.retain(|h| !h.state.lock().unwrap().closed);
        state.wake_all();
    }

    /// Sever or heal the link between two nodes.
    pub fn set_link(&self, a: NodeId, b: NodeId, up: bool) {
        let mut state = self.inner.state.lock().unwrap();
        if up {
            state.cut.remove(&pair(a, b));
        } else {
            state.cut.insert(pair(a, b));
        }
        state.wake_all();
    }
}

/// Per-node face of the bus.
pub struct MemoryDmqEndpoint {
    bus: MemoryDmqBus,
    node: NodeId,
}

impl DmqEndpoint for MemoryDmqEndpoint {
    fn open(&self) -> Box<dyn DmqHandle> {
        let shared = Arc::new(HandleShared {
            node: self.node,
            state: Mutex::new(HandleState::default()),
            cv: Condvar::new(),
        });
        self.bus
            .inner
            .state
            .lock()
            .unwrap()
            .handles
            .push(shared.clone());
        Box::new(MemoryDmqHandle {
            bus: self.bus.clone(),
            shared,
        })
    }
}

pub struct MemoryDmqHandle {
    bus: MemoryDmqBus,
    shared: Arc<HandleShared>,
}

impl MemoryDmqHandle {
    fn pop_inner(&mut self, mask: NodeMask, deadline: Option<Instant>) -> DmqPop {
        loop {
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.closed {
                    return DmqPop::Shutdown;
                }
                if let Some(pos) = state
                    .queue
                    .iter()
                    .position(|(from, _, _)| mask.contains(*from))
                {
                    let (from, _, payload) = state.queue.remove(pos).unwrap();
                    return DmqPop::Message { from, payload };
                }
            }

            let unreachable = {
                let bus = self.bus.inner.state.lock().unwrap();
                bus.unreachable_from(self.shared.node)
            };
            if let Some(from) = mask.intersect(unreachable).lowest_set_bit() {
                return DmqPop::Detached { from };
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return DmqPop::TimedOut;
                }
            }

            let state = self.shared.state.lock().unwrap();
            let _ = self
                .shared
                .cv
                .wait_timeout(state, POP_POLL)
                .unwrap();
        }
    }
}

impl DmqHandle for MemoryDmqHandle {
    fn attach_receiver(&mut self, name: &str, peer: NodeId) -> anyhow::Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(existing) = state.receivers.get(name) {
            if *existing != peer {
                anyhow::bail!(
                    "receiver {name:?} already attached to node {existing}, refusing node {peer}"
                );
            }
        }
        state.receivers.insert(name.to_string(), peer);
        Ok(())
    }

    fn stream_subscribe(&mut self, stream: &str) {
        self.shared
            .state
            .lock()
            .unwrap()
            .streams
            .insert(stream.to_string());
    }

    fn stream_unsubscribe(&mut self, stream: &str) {
        let mut state = self.shared.state.lock().unwrap();
        state.streams.remove(stream);
        // Replies that raced the unsubscribe are dropped with the stream.
        state.queue.retain(|(_, s, _)| s != stream);
    }

    fn pop(&mut self, mask: NodeMask) -> DmqPop {
        self.pop_inner(mask, None)
    }

    fn pop_timeout(&mut self, mask: NodeMask, timeout: Duration) -> DmqPop {
        self.pop_inner(mask, Some(Instant::now() + timeout))
    }

    fn push(&mut self, dest: NodeId, stream: &str, payload: &[u8]) -> anyhow::Result<()> {
        let from = self.shared.node;
        let bus = self.bus.inner.state.lock().unwrap();
        if !bus.link_ok(from, dest) {
            tracing::debug!(from, dest, stream, "dropping push towards unreachable node");
            return Ok(());
        }
        let target = bus.handles.iter().find(|h| {
            h.node == dest && {
                let state = h.state.lock().unwrap();
                !state.closed && state.streams.contains(stream)
            }
        });
        match target {
            Some(handle) => {
                let mut state = handle.state.lock().unwrap();
                state
                    .queue
                    .push_back((from, stream.to_string(), payload.to_vec()));
                handle.cv.notify_all();
            }
            None => {
                tracing::debug!(from, dest, stream, "no subscriber, message dropped");
            }
        }
        Ok(())
    }
}

impl Drop for MemoryDmqHandle {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().closed = true;
        let mut bus = self.bus.inner.state.lock().unwrap();
        bus.handles
            .retain(|h| !Arc::ptr_eq(h, &self.shared));
    }
}
