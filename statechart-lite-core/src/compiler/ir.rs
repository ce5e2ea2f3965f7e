//! Typed state graph — the compiled form of a machine description.
//!
//! Nodes live in an arena indexed by [`NodeId`]; the arena is filled in
//! pre-order during lowering, so arena order *is* document order and
//! comparing ids compares document positions.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::NodeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryKind {
    Shallow,
    Deep,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateKind {
    Atomic,
    Compound,
    Parallel,
    Final,
    History(HistoryKind),
}

/// What fires a transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Trigger {
    /// Exact-name match against an external or raised event.
    Event(String),
    /// Eventless ("always"): re-evaluated after every microstep.
    Always,
    /// An `after` entry; matches only the fire event carrying `timer_id`.
    After { delay_ms: u64, timer_id: String },
    /// The owning compound/parallel completed (a final descendant entered).
    Done,
    /// The owning state's invoked service resolved.
    ServiceDone,
    /// The owning state's invoked service failed.
    ServiceError,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transition {
    pub source: NodeId,
    pub trigger: Trigger,
    /// Empty for internal transitions (actions only, no exit/entry).
    pub targets: Vec<NodeId>,
    pub internal: bool,
    pub guard: Option<String>,
    /// `in`-condition: the named node must be active at selection time.
    pub in_state: Option<NodeId>,
    pub actions: Vec<String>,
}

/// Invoked-service declaration; `onDone`/`onError` become transitions with
/// [`Trigger::ServiceDone`]/[`Trigger::ServiceError`] on the same node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvokeSpec {
    pub src: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateNode {
    /// Fully-qualified identifier, e.g. `#light.red.walk`.
    pub id: String,
    /// Local key within the parent's `states` map.
    pub key: String,
    pub parent: Option<NodeId>,
    pub kind: StateKind,
    /// Document order.
    pub children: Vec<NodeId>,
    /// Initial child, required for compound states.
    pub initial: Option<NodeId>,
    pub entry: Vec<String>,
    pub exit: Vec<String>,
    pub transitions: Vec<Transition>,
    pub invoke: Option<InvokeSpec>,
}

impl StateNode {
    pub fn is_leaf_kind(&self) -> bool {
        matches!(self.kind, StateKind::Atomic | StateKind::Final)
    }

    pub fn history_kind(&self) -> Option<HistoryKind> {
        match self.kind {
            StateKind::History(kind) => Some(kind),
            _ => None,
        }
    }
}

/// The compiled machine description.
#[derive(Clone, Debug)]
pub struct StateGraph {
    /// Root identifier as used in fq ids (isolation suffix included).
    pub machine_id: String,
    /// The id the description declared, before any isolation suffix.
    pub source_id: String,
    pub root: NodeId,
    pub nodes: Vec<StateNode>,
    /// Fully-qualified id → node.
    pub ids: HashMap<String, NodeId>,
    pub initial_context: Map<String, Value>,
    /// SHA-256 of the canonical re-serialization.
    pub definition_version: [u8; 32],
    pub(crate) canonical: String,
}

impl StateGraph {
    pub fn node(&self, id: NodeId) -> &StateNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn lookup(&self, fq_id: &str) -> Option<NodeId> {
        self.ids.get(fq_id).copied()
    }

    /// Canonical re-serialization of the description: strict JSON, double
    /// quotes, absolute targets, original (non-isolated) root id. Parsing
    /// it back yields a behaviorally identical machine.
    pub fn to_canonical_json(&self) -> &str {
        &self.canonical
    }

    /// Iterator over `node` and its ancestors up to the root, nearest first.
    pub fn self_and_ancestors(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(Some(node), move |&n| self.nodes[n].parent)
    }

    /// True when `anc` is a proper ancestor of `desc`.
    pub fn is_proper_ancestor(&self, anc: NodeId, desc: NodeId) -> bool {
        let mut cur = self.nodes[desc].parent;
        while let Some(n) = cur {
            if n == anc {
                return true;
            }
            cur = self.nodes[n].parent;
        }
        false
    }

    pub fn is_self_or_ancestor(&self, anc: NodeId, desc: NodeId) -> bool {
        anc == desc || self.is_proper_ancestor(anc, desc)
    }

    /// Least common compound ancestor of `source` and `targets`: the
    /// nearest proper ancestor of all of them whose kind is compound (or
    /// the root). Exit and entry sets are computed relative to it.
    pub fn lcca(&self, source: NodeId, targets: &[NodeId]) -> NodeId {
        let mut cur = self.nodes[source].parent;
        while let Some(candidate) = cur {
            let compound_like = candidate == self.root
                || matches!(self.nodes[candidate].kind, StateKind::Compound);
            if compound_like
                && targets
                    .iter()
                    .all(|&t| self.is_proper_ancestor(candidate, t))
            {
                return candidate;
            }
            cur = self.nodes[candidate].parent;
        }
        self.root
    }

    /// Active leaves of a configuration: entered nodes none of whose
    /// children are entered. Document order.
    pub fn active_leaves(&self, config: &BTreeSet<NodeId>) -> Vec<NodeId> {
        config
            .iter()
            .copied()
            .filter(|&n| !self.nodes[n].children.iter().any(|c| config.contains(c)))
            .collect()
    }

    /// True when `node` (compound or parallel) has reached completion in
    /// `config`: a compound's active child is final, a parallel's regions
    /// all are.
    pub fn in_final_state(&self, config: &BTreeSet<NodeId>, node: NodeId) -> bool {
        match self.nodes[node].kind {
            StateKind::Compound => self.nodes[node]
                .children
                .iter()
                .any(|&c| config.contains(&c) && self.nodes[c].kind == StateKind::Final),
            StateKind::Parallel => self.nodes[node]
                .children
                .iter()
                .all(|&c| config.contains(&c) && self.in_final_state(config, c)),
            _ => false,
        }
    }

    /// Names of every action the description references, deduplicated.
    pub fn action_names(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        for node in &self.nodes {
            out.extend(node.entry.iter().map(String::as_str));
            out.extend(node.exit.iter().map(String::as_str));
            for t in &node.transitions {
                out.extend(t.actions.iter().map(String::as_str));
            }
        }
        out
    }

    pub fn guard_names(&self) -> BTreeSet<&str> {
        self.nodes
            .iter()
            .flat_map(|n| n.transitions.iter())
            .filter_map(|t| t.guard.as_deref())
            .collect()
    }

    pub fn service_names(&self) -> BTreeSet<&str> {
        self.nodes
            .iter()
            .filter_map(|n| n.invoke.as_ref())
            .map(|i| i.src.as_str())
            .collect()
    }
}
