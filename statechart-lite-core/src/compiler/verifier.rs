//! Structural verification of the state graph.
//!
//! Runs after lowering, before a machine is constructed. Returns a list of
//! problems; an empty list means the graph is valid.

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;

use super::ir::{StateGraph, StateKind, Trigger};

/// One structural problem.
#[derive(Debug, Clone)]
pub struct VerifyError {
    pub message: String,
    pub state_id: Option<String>,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(id) = &self.state_id {
            write!(f, "[{}] {}", id, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

fn problem(errors: &mut Vec<VerifyError>, state_id: &str, message: impl Into<String>) {
    errors.push(VerifyError {
        message: message.into(),
        state_id: Some(state_id.to_string()),
    });
}

/// Verify structural invariants of the lowered graph.
pub fn verify(graph: &StateGraph) -> Vec<VerifyError> {
    let mut errors = Vec::new();

    for (idx, node) in graph.nodes.iter().enumerate() {
        match &node.kind {
            StateKind::Compound => {
                match node.initial {
                    None => problem(
                        &mut errors,
                        &node.id,
                        "compound state needs a resolvable 'initial' child",
                    ),
                    Some(initial) => {
                        if graph.nodes[initial].parent != Some(idx) {
                            problem(&mut errors, &node.id, "initial must name a direct child");
                        }
                        if matches!(graph.nodes[initial].kind, StateKind::History(_)) {
                            problem(
                                &mut errors,
                                &node.id,
                                "initial must not name a history node",
                            );
                        }
                    }
                }
                if node.children.is_empty() {
                    problem(&mut errors, &node.id, "compound state has no children");
                }
            }
            StateKind::Parallel => {
                if node.children.is_empty() {
                    problem(&mut errors, &node.id, "parallel state has no regions");
                }
                for &child in &node.children {
                    if !matches!(
                        graph.nodes[child].kind,
                        StateKind::Compound | StateKind::Atomic
                    ) {
                        problem(
                            &mut errors,
                            &graph.nodes[child].id,
                            "parallel regions must be compound or atomic",
                        );
                    }
                }
            }
            StateKind::Final => {
                if !node.children.is_empty() {
                    problem(&mut errors, &node.id, "final state must not have children");
                }
                if !node.transitions.is_empty() {
                    problem(
                        &mut errors,
                        &node.id,
                        "final state must not declare transitions",
                    );
                }
                if node.invoke.is_some() {
                    problem(&mut errors, &node.id, "final state must not invoke services");
                }
            }
            StateKind::History(_) => {
                match node.parent {
                    Some(parent) if matches!(graph.nodes[parent].kind, StateKind::Compound) => {}
                    _ => problem(
                        &mut errors,
                        &node.id,
                        "history node needs a compound parent",
                    ),
                }
                if !node.children.is_empty() || !node.transitions.is_empty() {
                    problem(
                        &mut errors,
                        &node.id,
                        "history node must be a bare pseudo-state",
                    );
                }
            }
            StateKind::Atomic => {}
        }

        for t in &node.transitions {
            match &t.trigger {
                Trigger::Done => {
                    if !matches!(node.kind, StateKind::Compound | StateKind::Parallel) {
                        problem(
                            &mut errors,
                            &node.id,
                            "'onDone' is only meaningful on compound or parallel states",
                        );
                    }
                }
                Trigger::ServiceDone | Trigger::ServiceError => {
                    if node.invoke.is_none() {
                        problem(
                            &mut errors,
                            &node.id,
                            "service completion handler without an 'invoke'",
                        );
                    }
                }
                _ => {}
            }
            if !t.internal && t.targets.is_empty() {
                problem(&mut errors, &node.id, "external transition without targets");
            }
            for &target in &t.targets {
                if matches!(graph.nodes[target].kind, StateKind::History(_))
                    && graph.nodes[target].parent == Some(t.source)
                {
                    // Targeting one's own direct history child re-enters
                    // nothing; almost certainly a modelling slip.
                    problem(
                        &mut errors,
                        &node.id,
                        "transition targets its own history child",
                    );
                }
            }
        }
    }

    if has_constant_eventless_cycle(graph) {
        errors.push(VerifyError {
            message: "cycle of eventless transitions with constant guards".to_string(),
            state_id: None,
        });
    }

    errors
}

/// Conservative eventless-cycle check: only guardless, `in`-free eventless
/// transitions contribute edges (an internal one is a self-loop, since it
/// re-fires on every settle pass). Guarded ones may legally terminate, so
/// they are left out.
fn has_constant_eventless_cycle(graph: &StateGraph) -> bool {
    let mut edges: Vec<(u32, u32)> = Vec::new();
    for node in &graph.nodes {
        for t in &node.transitions {
            if t.trigger != Trigger::Always || t.guard.is_some() || t.in_state.is_some() {
                continue;
            }
            if t.internal {
                edges.push((t.source as u32, t.source as u32));
            } else {
                for &target in &t.targets {
                    edges.push((t.source as u32, target as u32));
                }
            }
        }
    }
    if edges.is_empty() {
        return false;
    }
    let digraph: DiGraph<(), ()> = DiGraph::from_edges(edges);
    is_cyclic_directed(&digraph)
}

#[cfg(test)]
mod tests {
    use crate::compiler::lowering::{build_graph, BuildOptions};
    use crate::compiler::parser::parse_document;
    use crate::error::DefinitionError;

    fn build(text: &str) -> Result<crate::compiler::ir::StateGraph, DefinitionError> {
        let doc = parse_document(text).unwrap();
        build_graph(&doc, &BuildOptions::default())
    }

    fn graph_error(text: &str) -> String {
        match build(text) {
            Err(DefinitionError::Graph(msg)) => msg,
            other => panic!("expected graph error, got {other:?}"),
        }
    }

    #[test]
    fn missing_initial_is_rejected() {
        let msg = graph_error("{ id: 'm', states: { a: { states: { b: {} } } } }");
        assert!(msg.contains("initial"), "{msg}");
    }

    #[test]
    fn parallel_region_kinds_are_checked() {
        let msg = graph_error(
            "{ id: 'm', type: 'parallel', states: { r1: { type: 'final' }, r2: {} } }",
        );
        assert!(msg.contains("parallel regions"), "{msg}");
    }

    #[test]
    fn final_states_cannot_declare_transitions() {
        let msg = graph_error(
            "{ id: 'm', initial: 'a', states: { a: { type: 'final', on: { X: 'a' } } } }",
        );
        assert!(msg.contains("final state"), "{msg}");
    }

    #[test]
    fn history_needs_a_compound_parent() {
        let msg = graph_error("{ id: 'm', initial: 'h', states: { h: { type: 'history' } } }");
        assert!(msg.contains("history"), "{msg}");
    }

    #[test]
    fn guardless_eventless_cycle_is_rejected() {
        let msg = graph_error(
            "{ id: 'm', initial: 'a', states: { a: { on: { '': 'b' } }, b: { on: { '': 'a' } } } }",
        );
        assert!(msg.contains("eventless"), "{msg}");
    }

    #[test]
    fn guarded_eventless_loop_is_allowed_at_build_time() {
        let graph = build(
            "{ id: 'm', initial: 'a', states: { a: { on: { '': { target: 'b', cond: 'go' } } }, b: { on: { '': { target: 'a', cond: 'back' } } } } }",
        )
        .unwrap();
        assert_eq!(graph.guard_names().len(), 2);
    }

    #[test]
    fn internal_eventless_without_guard_is_a_cycle() {
        let msg = graph_error(
            "{ id: 'm', initial: 'a', states: { a: { on: { '': { actions: 'tick' } } } } }",
        );
        assert!(msg.contains("eventless"), "{msg}");
    }

    #[test]
    fn service_handlers_require_an_invoke() {
        // Hand-crafting through the builder: onDone under 'invoke' without
        // src fails earlier, so drive the check via a valid parse with a
        // missing invoke by using the state-level field on an atomic node.
        let msg = graph_error("{ id: 'm', initial: 'a', states: { a: { onDone: 'b' }, b: {} } }");
        assert!(msg.contains("onDone"), "{msg}");
    }
}
