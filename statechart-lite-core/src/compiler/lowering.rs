//! Graph builder (C2): lowers the parsed document tree into a
//! [`StateGraph`].
//!
//! Responsibilities: fully-qualified id assignment, identifier isolation,
//! target resolution (absolute `#…`, relative `.…`, bare-name search),
//! `after`-map expansion with stable timer ids, invoke/onDone wiring, and
//! the canonical re-serialization whose SHA-256 becomes the definition
//! version. Structural validation lives in the verifier, which
//! [`build_graph`] runs before returning.

use std::collections::{HashMap, VecDeque};

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::ir::{HistoryKind, InvokeSpec, StateGraph, StateKind, StateNode, Transition, Trigger};
use super::verifier;
use crate::error::DefinitionError;
use crate::types::NodeId;

/// Construction-time options.
#[derive(Clone, Debug, Default)]
pub struct BuildOptions {
    /// Suffix the root identifier with a fresh token so multiple instances
    /// of one description coexist within an orchestrator.
    pub isolate: bool,
    /// Replace the description's root `id` (used when the registration id
    /// differs from the document's).
    pub id_override: Option<String>,
}

/// Lower a parsed description into a verified state graph.
pub fn build_graph(doc: &Value, opts: &BuildOptions) -> Result<StateGraph, DefinitionError> {
    let root_obj = doc
        .as_object()
        .ok_or_else(|| DefinitionError::Graph("description root must be an object".into()))?;

    let source_id = match &opts.id_override {
        Some(id) => id.clone(),
        None => root_obj
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| DefinitionError::Graph("missing root 'id'".into()))?,
    };
    if source_id.is_empty() {
        return Err(DefinitionError::Graph("root 'id' must be non-empty".into()));
    }

    let machine_id = if opts.isolate {
        let token = Uuid::now_v7().simple().to_string();
        format!("{source_id}_{}", &token[..8])
    } else {
        source_id.clone()
    };

    let mut builder = Builder {
        nodes: Vec::new(),
        pending: Vec::new(),
        raw_initials: Vec::new(),
        errors: Vec::new(),
        source_id,
        machine_id,
    };

    let root = builder.lower_state(builder.machine_id.clone(), Some(root_obj), None);
    builder.resolve_initials();
    builder.resolve_pending();

    if !builder.errors.is_empty() {
        return Err(DefinitionError::Graph(builder.errors.join("\n")));
    }

    let initial_context = match root_obj.get("context") {
        None => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(DefinitionError::Graph("'context' must be an object".into()));
        }
    };

    let mut ids = HashMap::with_capacity(builder.nodes.len());
    for (idx, node) in builder.nodes.iter().enumerate() {
        ids.insert(node.id.clone(), idx);
    }

    let mut graph = StateGraph {
        machine_id: builder.machine_id,
        source_id: builder.source_id,
        root,
        nodes: builder.nodes,
        ids,
        initial_context,
        definition_version: [0u8; 32],
        canonical: String::new(),
    };

    graph.canonical = serde_json::to_string(&canonicalize(&graph))
        .map_err(|e| DefinitionError::Graph(format!("canonical serialization failed: {e}")))?;
    graph.definition_version = Sha256::digest(graph.canonical.as_bytes()).into();

    let problems = verifier::verify(&graph);
    if !problems.is_empty() {
        let msgs: Vec<String> = problems.iter().map(|p| p.to_string()).collect();
        return Err(DefinitionError::Graph(msgs.join("\n")));
    }

    Ok(graph)
}

// ─── Builder internals ────────────────────────────────────────

/// Unresolved transition collected during the tree walk.
struct Pending {
    node: NodeId,
    trigger: Trigger,
    target: RawTarget,
    guard: Option<String>,
    in_state: Option<String>,
    actions: Vec<String>,
}

enum RawTarget {
    Internal,
    Paths(Vec<String>),
}

struct Builder {
    nodes: Vec<StateNode>,
    pending: Vec<Pending>,
    /// (node, raw `initial` key) pairs, resolved once the tree is built.
    raw_initials: Vec<(NodeId, String)>,
    errors: Vec<String>,
    source_id: String,
    machine_id: String,
}

impl Builder {
    /// Pre-order tree walk; arena order ends up being document order.
    fn lower_state(
        &mut self,
        key: String,
        body: Option<&Map<String, Value>>,
        parent: Option<NodeId>,
    ) -> NodeId {
        let id = match parent {
            None => format!("#{key}"),
            Some(p) => format!("{}.{key}", self.nodes[p].id),
        };

        let empty = Map::new();
        let body = body.unwrap_or(&empty);

        let states = body.get("states").and_then(Value::as_object);
        let kind = match body.get("type").and_then(Value::as_str) {
            Some("parallel") => StateKind::Parallel,
            Some("final") => StateKind::Final,
            Some("history") => {
                let history = match body.get("history").and_then(Value::as_str) {
                    Some("deep") => HistoryKind::Deep,
                    Some("shallow") | None => HistoryKind::Shallow,
                    Some(other) => {
                        self.errors
                            .push(format!("{id}: unknown history kind '{other}'"));
                        HistoryKind::Shallow
                    }
                };
                StateKind::History(history)
            }
            Some(other) => {
                self.errors.push(format!("{id}: unknown state type '{other}'"));
                StateKind::Atomic
            }
            None => {
                if states.map(|s| !s.is_empty()).unwrap_or(false) {
                    StateKind::Compound
                } else {
                    StateKind::Atomic
                }
            }
        };

        let entry = self.string_or_list(body.get("entry"), &id, "entry");
        let exit = self.string_or_list(body.get("exit"), &id, "exit");
        let node = self.nodes.len();
        self.nodes.push(StateNode {
            id: id.clone(),
            key,
            parent,
            kind,
            children: Vec::new(),
            initial: None,
            entry,
            exit,
            transitions: Vec::new(),
            invoke: None,
        });

        match body.get("initial") {
            None => {}
            Some(Value::String(s)) => self.raw_initials.push((node, s.clone())),
            Some(_) => self.errors.push(format!("{id}: 'initial' must be a string")),
        }

        self.collect_transitions(node, &id, body);

        if let Some(states) = states {
            for (child_key, child_body) in states {
                let child = self.lower_state(child_key.clone(), child_body.as_object(), Some(node));
                if child_body.as_object().is_none() && !child_body.is_null() {
                    self.errors
                        .push(format!("{id}: state '{child_key}' must be an object"));
                }
                self.nodes[node].children.push(child);
            }
        }

        node
    }

    fn collect_transitions(&mut self, node: NodeId, id: &str, body: &Map<String, Value>) {
        if let Some(on) = body.get("on") {
            match on.as_object() {
                Some(map) => {
                    for (event, descriptor) in map {
                        let trigger = if event.is_empty() {
                            Trigger::Always
                        } else {
                            Trigger::Event(event.clone())
                        };
                        self.collect_descriptors(node, id, trigger, descriptor);
                    }
                }
                None => self.errors.push(format!("{id}: 'on' must be an object")),
            }
        }

        if let Some(after) = body.get("after") {
            match after.as_object() {
                Some(map) => {
                    for (delay_key, descriptor) in map {
                        match delay_key.parse::<u64>() {
                            Ok(delay_ms) => {
                                let trigger = Trigger::After {
                                    delay_ms,
                                    timer_id: format!("{id}.after.{delay_ms}"),
                                };
                                self.collect_descriptors(node, id, trigger, descriptor);
                            }
                            Err(_) => self.errors.push(format!(
                                "{id}: 'after' key '{delay_key}' is not a duration in ms"
                            )),
                        }
                    }
                }
                None => self.errors.push(format!("{id}: 'after' must be an object")),
            }
        }

        if let Some(done) = body.get("onDone") {
            self.collect_descriptors(node, id, Trigger::Done, done);
        }

        if let Some(invoke) = body.get("invoke") {
            match invoke.as_object() {
                Some(map) => {
                    match map.get("src").and_then(Value::as_str) {
                        Some(src) => {
                            self.nodes[node].invoke = Some(InvokeSpec {
                                src: src.to_string(),
                            });
                        }
                        None => self
                            .errors
                            .push(format!("{id}: 'invoke' needs a string 'src'")),
                    }
                    if let Some(d) = map.get("onDone") {
                        self.collect_descriptors(node, id, Trigger::ServiceDone, d);
                    }
                    if let Some(d) = map.get("onError") {
                        self.collect_descriptors(node, id, Trigger::ServiceError, d);
                    }
                }
                None => self
                    .errors
                    .push(format!("{id}: 'invoke' must be an object")),
            }
        }
    }

    /// A transition value is a descriptor or an array of descriptors; a
    /// bare string is shorthand for `{target: <string>}`.
    fn collect_descriptors(&mut self, node: NodeId, id: &str, trigger: Trigger, value: &Value) {
        let list: Vec<&Value> = match value {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for descriptor in list {
            match self.parse_descriptor(id, descriptor) {
                Ok((target, guard, in_state, actions)) => self.pending.push(Pending {
                    node,
                    trigger: trigger.clone(),
                    target,
                    guard,
                    in_state,
                    actions,
                }),
                Err(msg) => self.errors.push(msg),
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn parse_descriptor(
        &mut self,
        id: &str,
        value: &Value,
    ) -> Result<(RawTarget, Option<String>, Option<String>, Vec<String>), String> {
        match value {
            Value::String(s) if s == "." => Ok((RawTarget::Internal, None, None, Vec::new())),
            Value::String(s) => Ok((RawTarget::Paths(vec![s.clone()]), None, None, Vec::new())),
            Value::Object(map) => {
                let guard = map.get("cond").and_then(Value::as_str).map(str::to_string);
                let in_state = map.get("in").and_then(Value::as_str).map(str::to_string);
                let actions = self.string_or_list(map.get("actions"), id, "actions");
                let target = match map.get("target") {
                    None | Some(Value::Null) => {
                        if actions.is_empty() {
                            return Err(format!(
                                "{id}: transition must declare a target or actions"
                            ));
                        }
                        RawTarget::Internal
                    }
                    Some(Value::String(s)) if s == "." => RawTarget::Internal,
                    Some(Value::String(s)) => RawTarget::Paths(vec![s.clone()]),
                    Some(Value::Array(items)) => {
                        let mut paths = Vec::with_capacity(items.len());
                        for item in items {
                            match item.as_str() {
                                Some(s) => paths.push(s.to_string()),
                                None => {
                                    return Err(format!(
                                        "{id}: transition targets must be strings"
                                    ))
                                }
                            }
                        }
                        if paths.is_empty() {
                            return Err(format!("{id}: empty target array"));
                        }
                        RawTarget::Paths(paths)
                    }
                    Some(_) => return Err(format!("{id}: 'target' must be a string or array")),
                };
                Ok((target, guard, in_state, actions))
            }
            _ => Err(format!(
                "{id}: transition descriptor must be a string or object"
            )),
        }
    }

    fn string_or_list(&mut self, value: Option<&Value>, id: &str, field: &str) -> Vec<String> {
        match value {
            None => Vec::new(),
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(s) => out.push(s.to_string()),
                        None => {
                            self.errors
                                .push(format!("{id}: '{field}' entries must be strings"));
                        }
                    }
                }
                out
            }
            Some(_) => {
                self.errors
                    .push(format!("{id}: '{field}' must be a string or array"));
                Vec::new()
            }
        }
    }

    /// Resolve every declared `initial` against the now-complete tree.
    fn resolve_initials(&mut self) {
        let initials = std::mem::take(&mut self.raw_initials);
        for (node, child_key) in initials {
            let hit = self.nodes[node]
                .children
                .iter()
                .copied()
                .find(|&c| self.nodes[c].key == child_key);
            match hit {
                Some(child) => self.nodes[node].initial = Some(child),
                None => self.errors.push(format!(
                    "{}: initial '{child_key}' does not name a child state",
                    self.nodes[node].id
                )),
            }
        }
    }

    fn resolve_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for p in pending {
            let in_state = match &p.in_state {
                None => None,
                Some(raw) => match self.resolve_absolute(raw) {
                    Some(n) => Some(n),
                    None => {
                        self.errors.push(format!(
                            "{}: unknown state '{raw}' in `in` condition",
                            self.nodes[p.node].id
                        ));
                        continue;
                    }
                },
            };

            let (targets, internal) = match &p.target {
                RawTarget::Internal => (Vec::new(), true),
                RawTarget::Paths(paths) => {
                    let mut out = Vec::with_capacity(paths.len());
                    let mut ok = true;
                    for raw in paths {
                        match self.resolve_target(p.node, raw) {
                            Some(n) => out.push(n),
                            None => {
                                self.errors.push(format!(
                                    "{}: unresolvable transition target '{raw}'",
                                    self.nodes[p.node].id
                                ));
                                ok = false;
                            }
                        }
                    }
                    if !ok {
                        continue;
                    }
                    (out, false)
                }
            };

            self.nodes[p.node].transitions.push(Transition {
                source: p.node,
                trigger: p.trigger,
                targets,
                internal,
                guard: p.guard,
                in_state,
                actions: p.actions,
            });
        }
    }

    /// Descend from `from` through child keys.
    fn descend(&self, from: NodeId, segments: &[&str]) -> Option<NodeId> {
        let mut cur = from;
        for seg in segments {
            cur = self.nodes[cur]
                .children
                .iter()
                .copied()
                .find(|&c| self.nodes[c].key == *seg)?;
        }
        Some(cur)
    }

    /// `#root.a.b` (or `root.a.b`): absolute from the machine root. The
    /// original id is accepted alongside the isolated one.
    fn resolve_absolute(&self, raw: &str) -> Option<NodeId> {
        let stripped = raw.strip_prefix('#').unwrap_or(raw);
        let mut segments: Vec<&str> = stripped.split('.').collect();
        if segments.is_empty() {
            return None;
        }
        let root_key = segments.remove(0);
        if root_key != self.source_id && root_key != self.machine_id {
            return None;
        }
        self.descend(0, &segments)
    }

    /// Target resolution order: absolute (`#…`), self-or-descendant
    /// relative (`.…`), then bare names searched among siblings, then
    /// ancestors, then descendants (breadth-first, so the shortest path
    /// wins and document order breaks ties).
    fn resolve_target(&self, source: NodeId, raw: &str) -> Option<NodeId> {
        if raw.starts_with('#') {
            return self.resolve_absolute(raw);
        }
        if let Some(stripped) = raw.strip_prefix('.') {
            let segments: Vec<&str> = stripped.split('.').filter(|s| !s.is_empty()).collect();
            if segments.is_empty() {
                return None;
            }
            return self.descend(source, &segments);
        }

        let segments: Vec<&str> = raw.split('.').collect();
        let (first, rest) = segments.split_first()?;

        if let Some(parent) = self.nodes[source].parent {
            for &sibling in &self.nodes[parent].children {
                if self.nodes[sibling].key == *first {
                    if let Some(hit) = self.descend(sibling, rest) {
                        return Some(hit);
                    }
                }
            }
        }

        let mut cur = self.nodes[source].parent;
        while let Some(ancestor) = cur {
            if self.nodes[ancestor].key == *first {
                if let Some(hit) = self.descend(ancestor, rest) {
                    return Some(hit);
                }
            }
            cur = self.nodes[ancestor].parent;
        }

        let mut queue: VecDeque<NodeId> = self.nodes[source].children.iter().copied().collect();
        while let Some(n) = queue.pop_front() {
            if self.nodes[n].key == *first {
                if let Some(hit) = self.descend(n, rest) {
                    return Some(hit);
                }
            }
            queue.extend(self.nodes[n].children.iter().copied());
        }
        None
    }
}

// ─── Canonical serialization ──────────────────────────────────

/// Rebuild a strict-JSON description from the graph. Targets render as
/// absolute paths under the original (non-isolated) root id, so the output
/// is construction-independent; parsing it back yields a behaviorally
/// identical machine (law of the definition version).
fn canonicalize(graph: &StateGraph) -> Value {
    let mut out = Map::new();
    out.insert("id".into(), json!(graph.source_id));
    if !graph.initial_context.is_empty() {
        out.insert("context".into(), Value::Object(graph.initial_context.clone()));
    }
    for (key, value) in state_body(graph, graph.root) {
        out.insert(key, value);
    }
    Value::Object(out)
}

fn source_fq(graph: &StateGraph, node: NodeId) -> String {
    let fq = &graph.nodes[node].id;
    let isolated_prefix = format!("#{}", graph.machine_id);
    match fq.strip_prefix(&isolated_prefix) {
        Some(rest) => format!("#{}{rest}", graph.source_id),
        None => fq.clone(),
    }
}

fn state_body(graph: &StateGraph, node: NodeId) -> Map<String, Value> {
    let state = &graph.nodes[node];
    let mut out = Map::new();

    match &state.kind {
        StateKind::Parallel => {
            out.insert("type".into(), json!("parallel"));
        }
        StateKind::Final => {
            out.insert("type".into(), json!("final"));
        }
        StateKind::History(kind) => {
            out.insert("type".into(), json!("history"));
            let name = match kind {
                HistoryKind::Shallow => "shallow",
                HistoryKind::Deep => "deep",
            };
            out.insert("history".into(), json!(name));
        }
        StateKind::Atomic | StateKind::Compound => {}
    }

    if let Some(initial) = state.initial {
        out.insert("initial".into(), json!(graph.nodes[initial].key));
    }
    if !state.entry.is_empty() {
        out.insert("entry".into(), json!(state.entry));
    }
    if !state.exit.is_empty() {
        out.insert("exit".into(), json!(state.exit));
    }

    // Regroup transitions by surface syntax: on / after / onDone / invoke.
    let mut on: Map<String, Value> = Map::new();
    let mut after: Map<String, Value> = Map::new();
    let mut on_done: Vec<Value> = Vec::new();
    let mut service_done: Vec<Value> = Vec::new();
    let mut service_error: Vec<Value> = Vec::new();

    for t in &state.transitions {
        let descriptor = descriptor_body(graph, t);
        match &t.trigger {
            Trigger::Event(name) => push_grouped(&mut on, name, descriptor),
            Trigger::Always => push_grouped(&mut on, "", descriptor),
            Trigger::After { delay_ms, .. } => {
                push_grouped(&mut after, &delay_ms.to_string(), descriptor)
            }
            Trigger::Done => on_done.push(descriptor),
            Trigger::ServiceDone => service_done.push(descriptor),
            Trigger::ServiceError => service_error.push(descriptor),
        }
    }

    if !on.is_empty() {
        out.insert("on".into(), Value::Object(on));
    }
    if !after.is_empty() {
        out.insert("after".into(), Value::Object(after));
    }
    if !on_done.is_empty() {
        out.insert("onDone".into(), unwrap_single(on_done));
    }
    if let Some(invoke) = &state.invoke {
        let mut body = Map::new();
        body.insert("src".into(), json!(invoke.src));
        if !service_done.is_empty() {
            body.insert("onDone".into(), unwrap_single(service_done));
        }
        if !service_error.is_empty() {
            body.insert("onError".into(), unwrap_single(service_error));
        }
        out.insert("invoke".into(), Value::Object(body));
    }

    if !state.children.is_empty() {
        let mut states = Map::new();
        for &child in &state.children {
            states.insert(
                graph.nodes[child].key.clone(),
                Value::Object(state_body(graph, child)),
            );
        }
        out.insert("states".into(), Value::Object(states));
    }

    out
}

fn push_grouped(map: &mut Map<String, Value>, key: &str, descriptor: Value) {
    match map.get_mut(key) {
        None => {
            map.insert(key.to_string(), descriptor);
        }
        Some(Value::Array(items)) => items.push(descriptor),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, descriptor]);
        }
    }
}

fn unwrap_single(mut items: Vec<Value>) -> Value {
    if items.len() == 1 {
        items.pop().expect("one item")
    } else {
        Value::Array(items)
    }
}

fn descriptor_body(graph: &StateGraph, t: &Transition) -> Value {
    let mut out = Map::new();
    if t.internal {
        if t.actions.is_empty() {
            out.insert("target".into(), json!("."));
        }
    } else {
        let paths: Vec<String> = t.targets.iter().map(|&n| source_fq(graph, n)).collect();
        if paths.len() == 1 {
            out.insert("target".into(), json!(paths[0]));
        } else {
            out.insert("target".into(), json!(paths));
        }
    }
    if let Some(guard) = &t.guard {
        out.insert("cond".into(), json!(guard));
    }
    if let Some(in_state) = t.in_state {
        out.insert("in".into(), json!(source_fq(graph, in_state)));
    }
    if !t.actions.is_empty() {
        out.insert("actions".into(), json!(t.actions));
    }
    Value::Object(out)
}
