//! DDL capture: session GUC tracking, statement forwarding, sequence
//! policy.
//!
//! DDL strings are forwarded verbatim; the only preparation is prefixing
//! them with the session GUC overrides that influenced parsing, so peers
//! replay them in an equivalent session. The override map preserves
//! insertion order because `SET` statements are order-sensitive.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::config::CoreConfig;
use crate::mask::NodeId;

/// Kinds of `SET` statements surfaced by the utility hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetKind {
    /// `SET name = value`
    Value,
    /// `SET name TO DEFAULT`
    Default,
    /// `RESET name`
    Reset,
    /// `RESET ALL`
    ResetAll,
    /// `SET name FROM CURRENT`; intentionally ignored.
    Current,
    /// Multi-assignment forms; intentionally ignored.
    Multi,
}

/// Insertion-ordered map of session overrides: a sequence of pairs plus a
/// hash index, so serialization replays them in the order they were set.
#[derive(Default)]
pub struct GucOverrides {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl GucOverrides {
    /// Upsert re-appends at the tail: the latest `SET` wins and is replayed
    /// last.
    pub fn update(&mut self, key: &str, value: &str) {
        self.remove(key);
        self.index.insert(key.to_string(), self.entries.len());
        self.entries.push((key.to_string(), value.to_string()));
    }

    pub fn remove(&mut self, key: &str) {
        if let Some(pos) = self.index.remove(key) {
            self.entries.remove(pos);
            for slot in self.index.values_mut() {
                if *slot > pos {
                    *slot -= 1;
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.index
            .get(key)
            .map(|pos| self.entries[*pos].1.as_str())
    }

    /// `SET k TO v; ` for every override in insertion order. `search_path`
    /// is skipped: the host sets it through its own channel and the stale
    /// copy here would override it.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            if key == "search_path" {
                continue;
            }
            out.push_str("SET ");
            out.push_str(key);
            out.push_str(" TO ");
            out.push_str(value);
            out.push_str("; ");
        }
        out
    }
}

/// Marker of a forwarded DDL record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DdlKind {
    /// Transactional: replayed inside the surrounding transaction.
    Transactional,
    /// Concurrent: replayed outside any transaction (e.g. CREATE INDEX
    /// CONCURRENTLY).
    Concurrent,
}

/// A captured statement ready to be shipped to peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicatedDdl {
    pub kind: DdlKind,
    pub query: String,
}

/// Sequence options injected into `CREATE SEQUENCE` so every node draws
/// from a disjoint residue class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SequenceDefaults {
    pub increment: Option<i64>,
    pub start: Option<i64>,
}

/// Per-session DDL capture state.
pub struct DdlCapture {
    gucs: Mutex<GucOverrides>,
    remote_functions: HashSet<String>,
    node_id: NodeId,
    max_nodes: usize,
    monotonic_sequences: bool,
    volkswagen_mode: bool,
}

impl DdlCapture {
    pub fn new(cfg: &CoreConfig) -> DdlCapture {
        DdlCapture {
            gucs: Mutex::new(GucOverrides::default()),
            remote_functions: cfg.remote_functions.iter().cloned().collect(),
            node_id: cfg.node_id,
            max_nodes: cfg.max_nodes,
            monotonic_sequences: cfg.monotonic_sequences,
            volkswagen_mode: cfg.volkswagen_mode,
        }
    }

    /// Functions executed on every node instead of replicating their
    /// effects from the caller.
    pub fn is_remote_function(&self, name: &str) -> bool {
        self.remote_functions.contains(name)
    }

    /// Track a `SET`-family statement.
    pub fn process_set(&self, kind: SetKind, name: &str, value: Option<&str>) {
        let mut gucs = self.gucs.lock().unwrap();
        match kind {
            SetKind::Value => {
                if let Some(value) = value {
                    gucs.update(name, value);
                }
            }
            SetKind::Default => gucs.remove(name),
            SetKind::Reset => {
                if name == "session_authorization" {
                    gucs.remove("role");
                }
                gucs.remove(name);
            }
            SetKind::ResetAll => gucs.clear(),
            // Preserved as no-ops, as in the reference behavior.
            SetKind::Current | SetKind::Multi => {}
        }
    }

    /// Wrap a DDL statement for replication: reset the remote session, then
    /// replay our overrides, then the statement itself, verbatim.
    pub fn replicated_ddl(&self, query: &str, kind: DdlKind) -> ReplicatedDdl {
        let query = match kind {
            DdlKind::Transactional => {
                let gucs = self.gucs.lock().unwrap().serialize();
                format!("RESET SESSION AUTHORIZATION; reset all; {gucs}{query}")
            }
            DdlKind::Concurrent => query.to_string(),
        };
        tracing::debug!(kind = ?kind, query, "captured ddl for replication");
        ReplicatedDdl {
            kind,
            query,
        }
    }

    /// Fill in `increment`/`start` for a `CREATE SEQUENCE` that did not
    /// specify them, so per-node values never collide.
    pub fn adjust_create_sequence(
        &self,
        has_increment: bool,
        has_start: bool,
    ) -> SequenceDefaults {
        if self.volkswagen_mode {
            return SequenceDefaults::default();
        }
        SequenceDefaults {
            increment: (!has_increment).then_some(self.max_nodes as i64),
            start: (!has_start).then_some(i64::from(self.node_id)),
        }
    }

    /// Position record forwarded on `nextval` when globally monotonic
    /// sequences are requested.
    pub fn seq_nextval_record(&self, seq_id: u64, next: i64) -> Option<(u64, i64)> {
        self.monotonic_sequences.then_some((seq_id, next))
    }
}
