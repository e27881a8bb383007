//! Node catalog: the durable list of cluster members.
//!
//! `after_node_create` and `after_node_drop` are the only mutators, the
//! same contract the admin surface exposes. Creating the self entry flips
//! the `configured` flag (the publication that marks the cluster as set
//! up); creating a peer records its connection string and reserves its
//! replication and recovery slot names. State is persisted as pretty JSON
//! next to the data directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use chorus_core::{NodeId, MAX_NODES};

pub fn slot_name(node_id: NodeId) -> String {
    format!("mtm_slot_{node_id}")
}

pub fn recovery_slot_name(node_id: NodeId) -> String {
    format!("mtm_recovery_{node_id}")
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeEntry {
    pub id: NodeId,
    pub conninfo: String,
    pub is_self: bool,
    /// Slot names reserved for this peer, recorded for operators.
    pub slots: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct CatalogState {
    nodes: Vec<NodeEntry>,
    /// Set when the self entry exists; transactions are only hijacked on a
    /// configured node.
    configured: bool,
}

pub struct NodeCatalog {
    path: PathBuf,
    state: RwLock<CatalogState>,
}

impl NodeCatalog {
    pub fn load_or_init(path: impl AsRef<Path>) -> anyhow::Result<NodeCatalog> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)
                .with_context(|| format!("parse node catalog {}", path.display()))?,
            Err(_) => CatalogState::default(),
        };
        Ok(NodeCatalog {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn after_node_create(
        &self,
        id: NodeId,
        conninfo: &str,
        is_self: bool,
    ) -> anyhow::Result<()> {
        if id < 1 || id as usize > MAX_NODES {
            anyhow::bail!("node id should be in range from 1 to {MAX_NODES}, but {id} is given");
        }
        let mut state = self.state.write().unwrap();
        if state.nodes.iter().any(|n| n.id == id) {
            anyhow::bail!("node {id} already exists in the catalog");
        }
        if is_self && state.nodes.iter().any(|n| n.is_self) {
            anyhow::bail!("catalog already has a self entry");
        }
        let slots = if is_self {
            Vec::new()
        } else {
            vec![slot_name(id), recovery_slot_name(id)]
        };
        state.nodes.push(NodeEntry {
            id,
            conninfo: conninfo.to_string(),
            is_self,
            slots,
        });
        state.nodes.sort_by_key(|n| n.id);
        if is_self {
            state.configured = true;
        }
        tracing::info!(id, is_self, "node added to catalog");
        self.persist(&state)
    }

    pub fn after_node_drop(&self, id: NodeId) -> anyhow::Result<()> {
        let mut state = self.state.write().unwrap();
        let before = state.nodes.len();
        let dropped_self = state.nodes.iter().any(|n| n.id == id && n.is_self);
        state.nodes.retain(|n| n.id != id);
        if state.nodes.len() == before {
            anyhow::bail!("node {id} is not in the catalog");
        }
        if dropped_self {
            state.configured = false;
        }
        tracing::info!(id, "node dropped from catalog");
        self.persist(&state)
    }

    pub fn nodes(&self) -> Vec<NodeEntry> {
        self.state.read().unwrap().nodes.clone()
    }

    pub fn n_nodes(&self) -> usize {
        self.state.read().unwrap().nodes.len()
    }

    pub fn self_id(&self) -> Option<NodeId> {
        self.state
            .read()
            .unwrap()
            .nodes
            .iter()
            .find(|n| n.is_self)
            .map(|n| n.id)
    }

    pub fn is_configured(&self) -> bool {
        self.state.read().unwrap().configured
    }

    fn persist(&self, state: &CatalogState) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("create catalog dir")?;
        }
        let data = serde_json::to_vec_pretty(state).context("serialize node catalog")?;
        fs::write(&self.path, data).context("write node catalog")?;
        Ok(())
    }
}

/// Node ids added and removed between two catalog snapshots; drives the
/// start/stop callbacks on a config reload.
pub fn diff(old: &[NodeEntry], new: &[NodeEntry]) -> (Vec<NodeId>, Vec<NodeId>) {
    let added = new
        .iter()
        .filter(|n| !old.iter().any(|o| o.id == n.id))
        .map(|n| n.id)
        .collect();
    let dropped = old
        .iter()
        .filter(|o| !new.iter().any(|n| n.id == o.id))
        .map(|n| n.id)
        .collect();
    (added, dropped)
}
