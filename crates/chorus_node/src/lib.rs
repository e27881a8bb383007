//! Embedded multi-master cluster node.
//!
//! Hosts the pieces that sit around the coordination core when it runs
//! in-process: the in-memory host engine, the node catalog, and the
//! embedded cluster harness used by the binary and the integration tests.

pub mod catalog;
pub mod engine;
pub mod harness;

pub use catalog::{NodeCatalog, NodeEntry};
pub use engine::{EngineRegistry, MemEngine, Op};
pub use harness::{EmbeddedCluster, EmbeddedNode};
