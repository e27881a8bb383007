//! Coordination core for a multi-master replicated SQL cluster.
//!
//! Every node accepts read-write transactions; this crate supplies the
//! machinery that keeps them globally ordered and atomically applied:
//! a three-phase commit coordinator interlocked with recovery through a
//! commit barrier, a membership state machine with clique-majority and
//! referee decisions, a distributed deadlock detector, and the resolver
//! for orphaned prepared transactions. The host engine, the logical
//! replication applier and the inter-node message queue are external
//! collaborators reached through the `HostEngine`, `HostHooks` and `Dmq*`
//! trait seams.

pub mod apply;
pub mod clique;
pub mod clock;
pub mod commit;
pub mod config;
pub mod context;
pub mod ddd;
pub mod ddl;
pub mod dmq;
pub mod engine;
pub mod error;
pub mod gid;
pub mod heartbeat;
pub mod mask;
pub mod membership;
pub mod messages;
pub mod pool;
pub mod referee;
pub mod resolver;
pub mod runtime;
pub mod syncpoint;

pub use config::CoreConfig;
pub use context::{
    CommitOutcome, CoreContext, CurrentTx, HostHooks, SessionInfo, SessionKind,
    UtilityStatement,
};
pub use ddl::{DdlKind, ReplicatedDdl, SequenceDefaults, SetKind};
pub use dmq::{DmqEndpoint, DmqHandle, DmqPop, MemoryDmqBus};
pub use engine::{HostEngine, PreparedState, WaitEdge};
pub use error::{CommitError, ConfigError, DecodeError};
pub use gid::Gid;
pub use mask::{NodeId, NodeMask, MAX_NODES};
pub use membership::{Membership, MembershipState, NodeStatus};
pub use messages::{ArbiterMessage, MessageCode, ResolveOutcome, ARBITER_MSG_LEN};
pub use referee::{MemoryReferee, Referee};
pub use runtime::ClusterRuntime;
