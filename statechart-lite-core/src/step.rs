//! Step-engine internals (C5): transition selection, conflict resolution,
//! exit/entry set computation, and history capture.
//!
//! Everything here is pure over the graph and a configuration; the event
//! loop in `machine` drives these and owns the side effects (actions,
//! timers, services, records).

use std::collections::{BTreeSet, HashMap};

use crate::compiler::{HistoryKind, StateGraph, StateKind, Transition, Trigger};
use crate::types::{Event, EventKind, NodeId};

/// A transition identified by owning node and position within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TransitionRef {
    pub node: NodeId,
    pub index: usize,
}

impl TransitionRef {
    pub fn get<'g>(&self, graph: &'g StateGraph) -> &'g Transition {
        &graph.nodes[self.node].transitions[self.index]
    }
}

/// The stimulus a microstep selects against.
pub(crate) enum Stimulus<'a> {
    Named(&'a str),
    /// The eventless pseudo-event, evaluated during settling.
    Always,
    Timer { node: NodeId, timer_id: &'a str },
    Done { node: NodeId },
    ServiceDone { node: NodeId },
    ServiceError { node: NodeId },
}

impl<'a> Stimulus<'a> {
    pub fn from_event(event: &'a Event) -> Self {
        match &event.kind {
            EventKind::Named(name) => Stimulus::Named(name),
            EventKind::TimerFired { node, timer_id } => Stimulus::Timer {
                node: *node,
                timer_id,
            },
            EventKind::Done { node } => Stimulus::Done { node: *node },
            EventKind::ServiceDone { node, .. } => Stimulus::ServiceDone { node: *node },
            EventKind::ServiceFailed { node, .. } => Stimulus::ServiceError { node: *node },
        }
    }

    /// Trigger match against a transition owned by `owner`. Timer and
    /// completion events are addressed to a specific node and match
    /// nothing else.
    fn matches(&self, owner: NodeId, trigger: &Trigger) -> bool {
        match (self, trigger) {
            (Stimulus::Named(name), Trigger::Event(event)) => name == event,
            (Stimulus::Always, Trigger::Always) => true,
            (
                Stimulus::Timer { node, timer_id },
                Trigger::After {
                    timer_id: armed, ..
                },
            ) => *node == owner && *timer_id == armed,
            (Stimulus::Done { node }, Trigger::Done) => *node == owner,
            (Stimulus::ServiceDone { node }, Trigger::ServiceDone) => *node == owner,
            (Stimulus::ServiceError { node }, Trigger::ServiceError) => *node == owner,
            _ => false,
        }
    }
}

/// Two selections whose exit sets overlap across unrelated regions.
#[derive(Debug)]
pub(crate) struct ConflictPair {
    pub first: TransitionRef,
    pub second: TransitionRef,
}

/// Select the transition set for one microstep.
///
/// Walks each active leaf from innermost to outermost; within a node,
/// candidates are tried in document order and the first enabled one
/// commits (so guards are evaluated in document order and the first
/// truthy guard wins). Across leaves, a transition reached twice is kept
/// once; overlapping exit sets resolve to the descendant source, and an
/// overlap between unrelated sources is a conflict.
pub(crate) fn select(
    graph: &StateGraph,
    config: &BTreeSet<NodeId>,
    stimulus: &Stimulus<'_>,
    enabled: &mut dyn FnMut(NodeId, usize, &Transition) -> bool,
) -> Result<Vec<TransitionRef>, ConflictPair> {
    let mut selected: Vec<(TransitionRef, BTreeSet<NodeId>)> = Vec::new();

    for leaf in graph.active_leaves(config) {
        let mut chosen = None;
        'walk: for node in graph.self_and_ancestors(leaf) {
            for (index, t) in graph.nodes[node].transitions.iter().enumerate() {
                if !stimulus.matches(node, &t.trigger) {
                    continue;
                }
                if let Some(required) = t.in_state {
                    if !config.contains(&required) {
                        continue;
                    }
                }
                if !enabled(node, index, t) {
                    continue;
                }
                chosen = Some(TransitionRef { node, index });
                break 'walk;
            }
        }
        let Some(candidate) = chosen else { continue };
        if selected.iter().any(|(kept, _)| *kept == candidate) {
            continue;
        }

        let candidate_exit = exit_set(graph, config, candidate.get(graph));
        let mut displaced: Vec<usize> = Vec::new();
        let mut keep = true;
        for (i, (kept, kept_exit)) in selected.iter().enumerate() {
            if candidate_exit.is_empty() || kept_exit.is_empty() {
                continue;
            }
            if candidate_exit.intersection(kept_exit).next().is_none() {
                continue;
            }
            if graph.is_proper_ancestor(kept.node, candidate.node) {
                displaced.push(i);
            } else if graph.is_proper_ancestor(candidate.node, kept.node) {
                keep = false;
                break;
            } else {
                return Err(ConflictPair {
                    first: *kept,
                    second: candidate,
                });
            }
        }
        if !keep {
            continue;
        }
        for i in displaced.into_iter().rev() {
            selected.remove(i);
        }
        selected.push((candidate, candidate_exit));
    }

    Ok(selected.into_iter().map(|(t, _)| t).collect())
}

/// Entered nodes that leave when `t` is taken: every entered proper
/// descendant of the LCCA of source and targets. Internal transitions
/// exit nothing.
pub(crate) fn exit_set(
    graph: &StateGraph,
    config: &BTreeSet<NodeId>,
    t: &Transition,
) -> BTreeSet<NodeId> {
    if t.targets.is_empty() {
        return BTreeSet::new();
    }
    let domain = graph.lcca(t.source, &t.targets);
    config
        .iter()
        .copied()
        .filter(|&n| graph.is_proper_ancestor(domain, n))
        .collect()
}

/// Nodes entered when `t` is taken: the chains from each target up to the
/// LCCA, history restorations, and default expansion of compounds (via
/// `initial`) and parallels (all regions).
pub(crate) fn entry_set(
    graph: &StateGraph,
    t: &Transition,
    history: &HashMap<NodeId, Vec<NodeId>>,
) -> BTreeSet<NodeId> {
    let mut set = BTreeSet::new();
    if t.targets.is_empty() {
        return set;
    }
    let domain = graph.lcca(t.source, &t.targets);
    for &target in &t.targets {
        add_target(graph, &mut set, history, target, domain);
    }
    expand_defaults(graph, &mut set);
    set
}

/// The configuration entered at machine start: the root, defaults all the
/// way down.
pub(crate) fn initial_entry_set(graph: &StateGraph) -> BTreeSet<NodeId> {
    let mut set = BTreeSet::new();
    set.insert(graph.root);
    expand_defaults(graph, &mut set);
    set
}

/// Record history for every exited compound that carries a history child.
/// Must run against the pre-exit configuration.
pub(crate) fn capture_history(
    graph: &StateGraph,
    config: &BTreeSet<NodeId>,
    exited: &BTreeSet<NodeId>,
    history: &mut HashMap<NodeId, Vec<NodeId>>,
) {
    for &n in exited {
        for &child in &graph.nodes[n].children {
            let Some(kind) = graph.nodes[child].history_kind() else {
                continue;
            };
            let recorded: Vec<NodeId> = match kind {
                HistoryKind::Shallow => graph.nodes[n]
                    .children
                    .iter()
                    .copied()
                    .filter(|c| config.contains(c))
                    .collect(),
                HistoryKind::Deep => config
                    .iter()
                    .copied()
                    .filter(|&d| graph.is_proper_ancestor(n, d) && graph.nodes[d].is_leaf_kind())
                    .collect(),
            };
            history.insert(child, recorded);
        }
    }
}

/// Compounds and parallels completed by entering `entered_finals`,
/// innermost first. From each completed compound the full ancestor chain
/// is climbed, and every enclosing container that is now wholly final
/// completes too (depth unlimited); the climb stops at the first ancestor
/// that is not. The machine turns these into synthesized `onDone` events
/// (or a terminal stop when the root itself completes).
pub(crate) fn completions(
    graph: &StateGraph,
    config: &BTreeSet<NodeId>,
    entered: &BTreeSet<NodeId>,
) -> Vec<NodeId> {
    let mut done = Vec::new();
    for &f in entered {
        if graph.nodes[f].kind != StateKind::Final {
            continue;
        }
        let Some(parent) = graph.nodes[f].parent else {
            continue;
        };
        if graph.nodes[parent].kind != StateKind::Compound {
            continue;
        }
        if !done.contains(&parent) {
            done.push(parent);
        }
        let mut cur = graph.nodes[parent].parent;
        while let Some(ancestor) = cur {
            if !graph.in_final_state(config, ancestor) {
                break;
            }
            if !done.contains(&ancestor) {
                done.push(ancestor);
            }
            cur = graph.nodes[ancestor].parent;
        }
    }
    done
}

// ─── Entry helpers ────────────────────────────────────────────

/// Insert `node` and its ancestors up to (excluding) `stop`.
fn add_chain(graph: &StateGraph, set: &mut BTreeSet<NodeId>, node: NodeId, stop: NodeId) {
    let mut cur = Some(node);
    while let Some(n) = cur {
        if n == stop {
            break;
        }
        set.insert(n);
        cur = graph.nodes[n].parent;
    }
}

fn add_target(
    graph: &StateGraph,
    set: &mut BTreeSet<NodeId>,
    history: &HashMap<NodeId, Vec<NodeId>>,
    target: NodeId,
    domain: NodeId,
) {
    if graph.nodes[target].history_kind().is_some() {
        // Entering a history node means entering its parent and restoring
        // the recorded configuration; an empty slot falls back to the
        // parent's default entry.
        let Some(parent) = graph.nodes[target].parent else {
            return;
        };
        add_chain(graph, set, parent, domain);
        if let Some(recorded) = history.get(&target).filter(|r| !r.is_empty()) {
            for &r in recorded {
                add_chain(graph, set, r, parent);
            }
        }
    } else {
        add_chain(graph, set, target, domain);
    }
}

/// Descend defaults: a compound with no entered child gets its initial
/// child; a parallel gets every region.
fn expand_defaults(graph: &StateGraph, set: &mut BTreeSet<NodeId>) {
    let mut work: Vec<NodeId> = set.iter().copied().collect();
    while let Some(n) = work.pop() {
        match graph.nodes[n].kind {
            StateKind::Compound => {
                if !graph.nodes[n].children.iter().any(|c| set.contains(c)) {
                    // Verified at build time: every compound has an initial.
                    let Some(initial) = graph.nodes[n].initial else {
                        continue;
                    };
                    if set.insert(initial) {
                        work.push(initial);
                    }
                }
            }
            StateKind::Parallel => {
                for &c in &graph.nodes[n].children {
                    if set.insert(c) {
                        work.push(c);
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{build_graph, parse_document, BuildOptions};

    fn build(text: &str) -> StateGraph {
        let doc = parse_document(text).unwrap();
        build_graph(&doc, &BuildOptions::default()).unwrap()
    }

    fn select_all(
        graph: &StateGraph,
        config: &BTreeSet<NodeId>,
        stimulus: &Stimulus<'_>,
    ) -> Result<Vec<TransitionRef>, ConflictPair> {
        select(graph, config, stimulus, &mut |_, _, _| true)
    }

    const NESTED: &str = r#"{
        id: 'm', initial: 'a',
        states: {
            a: {
                initial: 'a1',
                on: { UP: 'b' },
                states: { a1: { on: { GO: 'a2' } }, a2: {} },
            },
            b: {},
        }
    }"#;

    #[test]
    fn initial_entry_descends_defaults() {
        let graph = build(NESTED);
        let set = initial_entry_set(&graph);
        let ids: Vec<&str> = set.iter().map(|&n| graph.node(n).id.as_str()).collect();
        assert_eq!(ids, vec!["#m", "#m.a", "#m.a.a1"]);
    }

    #[test]
    fn descendant_transition_wins_over_ancestor() {
        let graph = build(
            r#"{
                id: 'm', initial: 'a',
                states: {
                    a: { initial: 'a1', on: { GO: 'b' },
                         states: { a1: { on: { GO: 'a2' } }, a2: {} } },
                    b: {},
                }
            }"#,
        );
        let config = initial_entry_set(&graph);
        let selected = select_all(&graph, &config, &Stimulus::Named("GO")).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(graph.node(selected[0].node).id, "#m.a.a1");
    }

    #[test]
    fn ancestor_transition_fires_when_leaf_has_none() {
        let graph = build(NESTED);
        let config = initial_entry_set(&graph);
        let selected = select_all(&graph, &config, &Stimulus::Named("UP")).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(graph.node(selected[0].node).id, "#m.a");
    }

    #[test]
    fn exit_set_covers_the_source_subtree() {
        let graph = build(NESTED);
        let config = initial_entry_set(&graph);
        let a = graph.lookup("#m.a").unwrap();
        let up = &graph.node(a).transitions[0];
        let exited = exit_set(&graph, &config, up);
        let ids: Vec<&str> = exited.iter().map(|&n| graph.node(n).id.as_str()).collect();
        assert_eq!(ids, vec!["#m.a", "#m.a.a1"]);
    }

    #[test]
    fn internal_transitions_have_empty_exit_and_entry_sets() {
        let graph = build(
            "{ id: 'm', initial: 'a', states: { a: { on: { INC: { actions: 'inc' } } } } }",
        );
        let config = initial_entry_set(&graph);
        let a = graph.lookup("#m.a").unwrap();
        let t = &graph.node(a).transitions[0];
        assert!(exit_set(&graph, &config, t).is_empty());
        assert!(entry_set(&graph, t, &HashMap::new()).is_empty());
    }

    #[test]
    fn external_self_transition_exits_and_reenters_the_source() {
        let graph = build(
            "{ id: 'm', initial: 'a', states: { a: { on: { RETRY: 'a' } }, b: {} } }",
        );
        let config = initial_entry_set(&graph);
        let a = graph.lookup("#m.a").unwrap();
        let t = &graph.node(a).transitions[0];
        assert!(exit_set(&graph, &config, t).contains(&a));
        assert!(entry_set(&graph, t, &HashMap::new()).contains(&a));
    }

    #[test]
    fn parallel_regions_select_independently() {
        let graph = build(
            r#"{
                id: 'm', type: 'parallel',
                states: {
                    a: { initial: 'a1', states: { a1: { on: { TICK: 'a2' } }, a2: {} } },
                    b: { initial: 'b1', states: { b1: { on: { TICK: 'b2' } }, b2: {} } },
                }
            }"#,
        );
        let config = initial_entry_set(&graph);
        let selected = select_all(&graph, &config, &Stimulus::Named("TICK")).unwrap();
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn cross_region_overlap_is_a_conflict() {
        // Both regions try to exit the whole parallel toward different
        // targets: overlapping exit sets from unrelated sources.
        let graph = build(
            r#"{
                id: 'm', initial: 'p',
                states: {
                    p: {
                        type: 'parallel',
                        states: {
                            a: { initial: 'a1', states: { a1: { on: { X: '#m.out1' } } } },
                            b: { initial: 'b1', states: { b1: { on: { X: '#m.out2' } } } },
                        },
                    },
                    out1: {},
                    out2: {},
                }
            }"#,
        );
        let config = initial_entry_set(&graph);
        let err = select_all(&graph, &config, &Stimulus::Named("X"));
        assert!(err.is_err());
    }

    #[test]
    fn entering_a_parallel_enters_every_region() {
        let graph = build(
            r#"{
                id: 'm', initial: 'idle',
                states: {
                    idle: { on: { GO: 'p' } },
                    p: {
                        type: 'parallel',
                        states: {
                            a: { initial: 'a1', states: { a1: {} } },
                            b: { initial: 'b1', states: { b1: {} } },
                        },
                    },
                }
            }"#,
        );
        let idle = graph.lookup("#m.idle").unwrap();
        let t = &graph.node(idle).transitions[0];
        let entered = entry_set(&graph, t, &HashMap::new());
        for id in ["#m.p", "#m.p.a", "#m.p.a.a1", "#m.p.b", "#m.p.b.b1"] {
            assert!(
                entered.contains(&graph.lookup(id).unwrap()),
                "missing {id}"
            );
        }
    }

    #[test]
    fn history_restores_the_recorded_child() {
        let graph = build(
            r#"{
                id: 'm', initial: 'work',
                states: {
                    work: {
                        initial: 'one',
                        states: { one: { on: { NEXT: 'two' } }, two: {}, h: { type: 'history' } },
                        on: { PAUSE: 'paused' },
                    },
                    paused: { on: { RESUME: '#m.work.h' } },
                }
            }"#,
        );
        let work = graph.lookup("#m.work").unwrap();
        let two = graph.lookup("#m.work.two").unwrap();
        let h = graph.lookup("#m.work.h").unwrap();
        let paused = graph.lookup("#m.paused").unwrap();

        // Simulate: active in `two`, exit `work`, record history.
        let mut config: BTreeSet<NodeId> = [graph.root, work, two].into_iter().collect();
        let pause = &graph.node(work).transitions[0];
        let exited = exit_set(&graph, &config, pause);
        let mut history = HashMap::new();
        capture_history(&graph, &config, &exited, &mut history);
        assert_eq!(history.get(&h), Some(&vec![two]));

        for &n in &exited {
            config.remove(&n);
        }
        config.insert(paused);

        // RESUME targets the history node: restoration re-enters `two`.
        let resume = &graph.node(paused).transitions[0];
        let entered = entry_set(&graph, resume, &history);
        assert!(entered.contains(&work));
        assert!(entered.contains(&two));
        assert!(!entered.contains(&h));
    }

    #[test]
    fn empty_history_slot_falls_back_to_initial() {
        let graph = build(
            r#"{
                id: 'm', initial: 'paused',
                states: {
                    paused: { on: { RESUME: '#m.work.h' } },
                    work: {
                        initial: 'one',
                        states: { one: {}, two: {}, h: { type: 'history' } },
                    },
                }
            }"#,
        );
        let paused = graph.lookup("#m.paused").unwrap();
        let resume = &graph.node(paused).transitions[0];
        let entered = entry_set(&graph, resume, &HashMap::new());
        assert!(entered.contains(&graph.lookup("#m.work").unwrap()));
        assert!(entered.contains(&graph.lookup("#m.work.one").unwrap()));
    }

    #[test]
    fn completions_report_compound_and_enclosing_parallel() {
        let graph = build(
            r#"{
                id: 'm', type: 'parallel',
                states: {
                    a: { initial: 'go', states: { go: { on: { FIN: 'end' } }, end: { type: 'final' } } },
                    b: { initial: 'done', states: { done: { type: 'final' } } },
                }
            }"#,
        );
        let a = graph.lookup("#m.a").unwrap();
        let a_end = graph.lookup("#m.a.end").unwrap();
        let b = graph.lookup("#m.b").unwrap();
        let b_done = graph.lookup("#m.b.done").unwrap();

        let config: BTreeSet<NodeId> = [graph.root, a, a_end, b, b_done].into_iter().collect();
        let entered: BTreeSet<NodeId> = [a_end].into_iter().collect();
        let done = completions(&graph, &config, &entered);
        assert_eq!(done, vec![a, graph.root]);
    }

    #[test]
    fn completion_climbs_the_full_ancestor_chain() {
        // Three levels: root compound -> parallel -> region compounds with
        // finals. Entering both finals in one microstep completes each
        // region and the parallel above them; the climb stops at the root,
        // whose active child is the parallel, not a final state.
        let graph = build(
            r#"{
                id: 'm', initial: 'p',
                states: {
                    p: {
                        type: 'parallel',
                        states: {
                            a: { initial: 'af', states: { af: { type: 'final' } } },
                            b: { initial: 'bf', states: { bf: { type: 'final' } } },
                        },
                    },
                    wrapup: {},
                }
            }"#,
        );
        let p = graph.lookup("#m.p").unwrap();
        let a = graph.lookup("#m.p.a").unwrap();
        let af = graph.lookup("#m.p.a.af").unwrap();
        let b = graph.lookup("#m.p.b").unwrap();
        let bf = graph.lookup("#m.p.b.bf").unwrap();

        let config: BTreeSet<NodeId> = [graph.root, p, a, af, b, bf].into_iter().collect();
        let entered: BTreeSet<NodeId> = [p, a, af, b, bf].into_iter().collect();
        let done = completions(&graph, &config, &entered);
        assert_eq!(done, vec![a, p, b]);
        assert!(
            !done.contains(&graph.root),
            "the climb must stop at the non-final root"
        );
    }
}
