//! Invariants, laws, boundary behaviors, and runtime fault handling.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use statechart_lite_core::{
    action_fn, guard_fn, guard_try_fn, Action, ActionScope, DefinitionError, Machine,
    MachineStatus, MonitorRecord, RecordKind, Registry, RuntimeError, StateKind,
};
use tokio::sync::broadcast;

fn counter(machine: &Machine, key: &str) -> i64 {
    machine
        .context_snapshot()
        .get(key)
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0)
}

/// P4 bookkeeping: per-state entry/exit occurrence counts tallied from
/// the monitor stream. Subscribe before `start` so initial entries are
/// seen.
struct OccupancyLedger {
    records: broadcast::Receiver<MonitorRecord>,
    entries: HashMap<String, i64>,
    exits: HashMap<String, i64>,
}

impl OccupancyLedger {
    fn new(machine: &Machine) -> Self {
        Self {
            records: machine.monitor().subscribe(),
            entries: HashMap::new(),
            exits: HashMap::new(),
        }
    }

    fn drain(&mut self) {
        loop {
            match self.records.try_recv() {
                Ok(record) => match record.kind {
                    RecordKind::StateEntered { state } => {
                        *self.entries.entry(state).or_default() += 1;
                    }
                    RecordKind::StateExited { state } => {
                        *self.exits.entry(state).or_default() += 1;
                    }
                    _ => {}
                },
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    panic!("monitor lagged by {n} records, occupancy counts are unreliable");
                }
                Err(_) => break,
            }
        }
    }

    /// P4: every node in the current configuration has been entered
    /// strictly more times than it has been exited.
    fn assert_p4(&mut self, machine: &Machine) {
        self.drain();
        for id in &machine.snapshot().configuration {
            let entries = self.entries.get(id).copied().unwrap_or(0);
            let exits = self.exits.get(id).copied().unwrap_or(0);
            assert!(
                entries > exits,
                "{id}: entered {entries} times but exited {exits}"
            );
        }
    }
}

/// P1–P3 over the published snapshot: one active child per entered
/// compound, all regions of an entered parallel, parents of everything.
fn assert_config_invariants(machine: &Machine) {
    let graph = machine.graph();
    let snapshot = machine.snapshot();
    let active: Vec<usize> = snapshot
        .configuration
        .iter()
        .map(|id| graph.lookup(id).expect("snapshot ids resolve"))
        .collect();
    let entered = |n: usize| active.contains(&n);

    assert!(entered(graph.root), "root must be entered");
    for &n in &active {
        let node = graph.node(n);
        match &node.kind {
            StateKind::Compound => {
                let entered_children = node.children.iter().filter(|&&c| entered(c)).count();
                assert_eq!(entered_children, 1, "{}: exactly one active child", node.id);
            }
            StateKind::Parallel => {
                for &c in &node.children {
                    assert!(entered(c), "{}: region {} active", node.id, graph.node(c).id);
                }
            }
            _ => {}
        }
        if let Some(parent) = node.parent {
            assert!(entered(parent), "{}: parent entered", node.id);
        }
    }
}

const NESTED_PARALLEL: &str = r#"{
    id: 'rig',
    initial: 'prep',
    states: {
        prep: { on: { GO: 'run' } },
        run: {
            type: 'parallel',
            states: {
                pumps: { initial: 'off', states: { off: { on: { PUMP: 'on' } }, on: {} } },
                valves: { initial: 'closed', states: { closed: { on: { OPEN: 'open' } }, open: {} } },
            },
        },
    },
}"#;

#[tokio::test]
async fn p1_p4_hold_across_a_parallel_run() {
    let machine = Machine::from_description(NESTED_PARALLEL, Registry::new()).unwrap();
    let mut ledger = OccupancyLedger::new(&machine);
    machine.start().await.unwrap();
    assert_config_invariants(&machine);
    ledger.assert_p4(&machine);
    for event in ["GO", "PUMP", "OPEN"] {
        machine.send(event).await.unwrap();
        assert_config_invariants(&machine);
        ledger.assert_p4(&machine);
    }
    assert_eq!(
        machine.active_state_names(true),
        "#rig.run.pumps.on;#rig.run.valves.open"
    );
    assert_eq!(
        machine.active_state_names(false),
        "#rig;#rig.run;#rig.run.pumps;#rig.run.pumps.on;#rig.run.valves;#rig.run.valves.open"
    );
}

// ── L1: internal transitions leave the configuration identical ──

#[tokio::test]
async fn l1_internal_transition_preserves_the_configuration() {
    let mut registry = Registry::new();
    registry.add_action("tick", action_fn(|s| {
        s.bump("ticks", 1);
        Ok(())
    }));
    let machine = Machine::from_description(
        "{ id: 'm', initial: 'a', states: { a: { initial: 'inner', on: { TICK: { actions: 'tick' } }, states: { inner: {} } } } }",
        registry,
    )
    .unwrap();
    machine.start().await.unwrap();
    let before = machine.snapshot().configuration;
    machine.send("TICK").await.unwrap();
    let after = machine.snapshot().configuration;
    assert_eq!(before, after);
    assert_eq!(counter(&machine, "ticks"), 1);
}

// ── L2: entry/exit counters net to zero over a returning cycle ──

#[tokio::test]
async fn l2_returning_cycle_nets_zero_on_occupancy_counters() {
    let mut registry = Registry::new();
    registry.add_action("enterB", action_fn(|s| {
        s.bump("b_entries", 1);
        Ok(())
    }));
    registry.add_action("exitB", action_fn(|s| {
        s.bump("b_entries", -1);
        Ok(())
    }));
    let machine = Machine::from_description(
        "{ id: 'm', initial: 'a', states: { a: { on: { GO: 'b' } }, b: { entry: 'enterB', exit: 'exitB', on: { BACK: 'a' } } } }",
        registry,
    )
    .unwrap();
    machine.start().await.unwrap();
    for _ in 0..3 {
        machine.send("GO").await.unwrap();
        machine.send("BACK").await.unwrap();
    }
    assert_eq!(machine.active_state_names(true), "#m.a");
    assert_eq!(counter(&machine, "b_entries"), 0);
}

// ── L3: the canonical re-serialization behaves identically ──

#[tokio::test]
async fn l3_canonical_round_trip_preserves_behavior() {
    let text = r#"{
        id: 'm', initial: 'a',
        states: {
            a: { on: { GO: 'b', SKIP: { target: 'c', cond: 'never' } } },
            b: { after: { 30000: 'c' }, on: { GO: 'c' } },
            c: { on: { RESET: 'a' } },
        },
    }"#;
    let mut registry = Registry::new();
    registry.add_guard("never", guard_fn(|_| false));

    let original = Machine::from_description(text, registry.clone()).unwrap();
    let canonical = original.graph().to_canonical_json().to_string();
    let reparsed = Machine::from_description(&canonical, registry).unwrap();
    assert_eq!(
        original.definition_version(),
        reparsed.definition_version()
    );

    for machine in [&original, &reparsed] {
        machine.start().await.unwrap();
        machine.send("SKIP").await.unwrap();
        machine.send("GO").await.unwrap();
        machine.send("GO").await.unwrap();
    }
    assert_eq!(
        original.active_state_names(true),
        reparsed.active_state_names(true)
    );
    assert_eq!(original.active_state_names(true), "#m.c");
}

// ── Boundary: after-timers ──

#[tokio::test]
async fn after_zero_fires_after_quiescence_not_during_the_step() {
    let machine = Machine::from_description(
        "{ id: 'm', initial: 'a', states: { a: { after: { 0: 'b' } }, b: {} } }",
        Registry::new(),
    )
    .unwrap();
    // The start step completes in `a`; the zero timer lands on the queue
    // behind it.
    let initial = machine.start().await.unwrap();
    assert_eq!(initial, "#m.a");
    let state = machine.wait_for_state("b", 1_000).await.unwrap();
    assert_eq!(state, "#m.b");
}

#[tokio::test]
async fn timer_armed_and_exited_in_the_same_step_is_never_observed() {
    let machine = Machine::from_description(
        "{ id: 'm', initial: 'a', states: { a: { after: { 10: 'c' }, on: { '': 'b' } }, b: {}, c: {} } }",
        Registry::new(),
    )
    .unwrap();
    let mut records = machine.monitor().subscribe();
    machine.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(machine.active_state_names(true), "#m.b");

    let mut armed = false;
    let mut cancelled = false;
    while let Ok(record) = records.try_recv() {
        match record.kind {
            RecordKind::TimerArmed { .. } => armed = true,
            RecordKind::TimerCancelled { .. } => cancelled = true,
            RecordKind::EventReceived { event } => {
                assert!(!event.starts_with("after:"), "cancelled timer fired");
            }
            _ => {}
        }
    }
    assert!(armed && cancelled);
}

#[tokio::test]
async fn after_timer_fires_once_the_delay_elapses() {
    let machine = Machine::from_description(
        "{ id: 'm', initial: 'a', states: { a: { after: { 20: 'b' } }, b: {} } }",
        Registry::new(),
    )
    .unwrap();
    machine.start().await.unwrap();
    let state = machine.wait_for_state("b", 1_000).await.unwrap();
    assert_eq!(state, "#m.b");
}

// ── Boundary: stopped machines drop events ──

#[tokio::test]
async fn events_after_stop_are_dropped() {
    let machine = Machine::from_description(
        "{ id: 'm', initial: 'a', states: { a: { on: { GO: 'b' } }, b: {} } }",
        Registry::new(),
    )
    .unwrap();
    machine.start().await.unwrap();
    let last = machine.stop().await;
    assert_eq!(last, "#m.a");
    assert!(machine.status().is_stopped());

    let state = machine.send("GO").await.unwrap();
    assert_eq!(state, "#m.a", "dropped event leaves the machine untouched");
}

#[tokio::test]
async fn reaching_a_top_level_final_stops_with_the_terminal_flag() {
    let machine = Machine::from_description(
        "{ id: 'm', initial: 'work', states: { work: { on: { FINISH: 'done' } }, done: { type: 'final' } } }",
        Registry::new(),
    )
    .unwrap();
    machine.start().await.unwrap();
    machine.send("FINISH").await.unwrap();
    assert_eq!(machine.status(), MachineStatus::Stopped { terminal: true });

    // Subsequent events are dropped.
    let state = machine.send("FINISH").await.unwrap();
    assert_eq!(state, "#m.done");
}

// ── Boundary: document order decides among same-event transitions ──

#[tokio::test]
async fn first_transition_in_document_order_with_a_passing_guard_wins() {
    let mut registry = Registry::new();
    registry.add_guard("yes", guard_fn(|_| true));
    let machine = Machine::from_description(
        "{ id: 'm', initial: 'a', states: { a: { on: { GO: [ { target: 'b', cond: 'yes' }, { target: 'c', cond: 'yes' } ] } }, b: {}, c: {} } }",
        registry,
    )
    .unwrap();
    machine.start().await.unwrap();
    assert_eq!(machine.send("GO").await.unwrap(), "#m.b");
}

// ── onDone of a compound ──

#[tokio::test]
async fn compound_on_done_fires_when_its_child_reaches_final() {
    let machine = Machine::from_description(
        r#"{
            id: 'm', initial: 'job',
            states: {
                job: {
                    initial: 'running',
                    onDone: 'cleanup',
                    states: { running: { on: { OK: 'ok' } }, ok: { type: 'final' } },
                },
                cleanup: {},
            },
        }"#,
        Registry::new(),
    )
    .unwrap();
    machine.start().await.unwrap();
    let state = machine.send("OK").await.unwrap();
    assert_eq!(state, "#m.cleanup");
}

// ── History ──

const HISTORY: &str = r#"{
    id: 'player',
    initial: 'playing',
    states: {
        playing: {
            initial: 'track',
            on: { PAUSE: 'paused' },
            states: {
                track: {
                    initial: 'intro',
                    states: { intro: { on: { DROP: 'chorus' } }, chorus: {} },
                },
                h: { type: 'history', history: 'deep' },
            },
        },
        paused: { on: { RESUME: '#player.playing.h' } },
    },
}"#;

#[tokio::test]
async fn deep_history_restores_the_nested_configuration() {
    let machine = Machine::from_description(HISTORY, Registry::new()).unwrap();
    machine.start().await.unwrap();
    machine.send("DROP").await.unwrap();
    machine.send("PAUSE").await.unwrap();
    assert_eq!(machine.active_state_names(true), "#player.paused");

    let state = machine.send("RESUME").await.unwrap();
    assert_eq!(state, "#player.playing.track.chorus");
}

#[tokio::test]
async fn unvisited_history_falls_back_to_initial() {
    let machine = Machine::from_description(
        r#"{
            id: 'm', initial: 'idle',
            states: {
                idle: { on: { GO: '#m.work.h' } },
                work: {
                    initial: 'one',
                    states: { one: {}, two: {}, h: { type: 'history' } },
                },
            },
        }"#,
        Registry::new(),
    )
    .unwrap();
    machine.start().await.unwrap();
    assert_eq!(machine.send("GO").await.unwrap(), "#m.work.one");
}

// ── Runtime faults ──

#[tokio::test]
async fn conflicting_region_selections_abort_the_step() {
    let machine = Machine::from_description(
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
            },
        }"#,
        Registry::new(),
    )
    .unwrap();
    let mut records = machine.monitor().subscribe();
    machine.start().await.unwrap();
    let before = machine.snapshot().configuration;

    let state = machine.send("X").await.unwrap();
    assert_eq!(machine.snapshot().configuration, before);
    assert_eq!(state, "#m.p.a.a1;#m.p.b.b1");
    assert_eq!(machine.status(), MachineStatus::Running);

    let mut faulted = false;
    while let Ok(record) = records.try_recv() {
        if let RecordKind::StepFaulted { fault } = record.kind {
            assert!(fault.contains("conflict"), "{fault}");
            faulted = true;
        }
    }
    assert!(faulted);
}

#[tokio::test]
async fn failing_guard_counts_as_false_and_is_reported() {
    let mut registry = Registry::new();
    registry.add_guard(
        "flaky",
        guard_try_fn(|_| Err("guard exploded".to_string())),
    );
    let machine = Machine::from_description(
        "{ id: 'm', initial: 'a', states: { a: { on: { GO: { target: 'b', cond: 'flaky' } } }, b: {} } }",
        registry,
    )
    .unwrap();
    let mut records = machine.monitor().subscribe();
    machine.start().await.unwrap();

    let state = machine.send("GO").await.unwrap();
    assert_eq!(state, "#m.a", "failed guard means the transition is off");
    assert_eq!(machine.status(), MachineStatus::Running);

    let mut reported = false;
    while let Ok(record) = records.try_recv() {
        if let RecordKind::StepFaulted { fault } = record.kind {
            assert!(fault.contains("guard 'flaky'"), "{fault}");
            reported = true;
        }
    }
    assert!(reported);
}

#[tokio::test]
async fn failing_action_sets_error_status_but_the_machine_keeps_going() {
    let mut registry = Registry::new();
    registry.add_action("explode", action_fn(|_| Err("boom".to_string())));
    registry.add_action("after", action_fn(|s| {
        s.bump("ran_after", 1);
        Ok(())
    }));
    let machine = Machine::from_description(
        "{ id: 'm', initial: 'a', states: { a: { on: { GO: { target: 'b', actions: ['explode', 'after'] } } }, b: { on: { BACK: 'a' } } } }",
        registry,
    )
    .unwrap();
    machine.start().await.unwrap();

    let state = machine.send("GO").await.unwrap();
    assert_eq!(state, "#m.b", "the step still completes");
    assert_eq!(counter(&machine, "ran_after"), 1, "remaining actions run");
    assert_eq!(machine.status(), MachineStatus::Error);

    // Still responsive.
    assert_eq!(machine.send("BACK").await.unwrap(), "#m.a");
}

#[tokio::test]
async fn runaway_eventless_settling_is_bounded() {
    let mut registry = Registry::new();
    registry.add_guard("always", guard_fn(|_| true));
    registry.add_action("spin", action_fn(|_| Ok(())));
    // Build-time cycle detection only rejects guardless loops; this one is
    // guarded and spins at runtime until the microstep budget trips.
    let machine = Machine::from_description(
        "{ id: 'm', initial: 'a', states: { a: { on: { '': { cond: 'always', actions: 'spin' } } } } }",
        registry,
    )
    .unwrap();
    let mut records = machine.monitor().subscribe();
    machine.start().await.unwrap();
    assert_eq!(machine.status(), MachineStatus::Error);

    let mut overran = false;
    loop {
        match records.try_recv() {
            Ok(record) => {
                if let RecordKind::StepFaulted { fault } = record.kind {
                    if fault.contains("did not settle") {
                        overran = true;
                    }
                }
            }
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    assert!(overran);
}

// ── wait_for_state and send timeouts ──

struct SlowAction;

#[async_trait]
impl Action for SlowAction {
    async fn execute(&self, scope: &mut ActionScope<'_>) -> Result<(), String> {
        let _ = scope;
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }
}

#[tokio::test]
async fn wait_for_state_times_out_cleanly() {
    let machine = Machine::from_description(
        "{ id: 'm', initial: 'a', states: { a: { on: { GO: 'b' } }, b: {} } }",
        Registry::new(),
    )
    .unwrap();
    machine.start().await.unwrap();
    match machine.wait_for_state("b", 50).await {
        Err(RuntimeError::WaitTimeout { what, .. }) => assert_eq!(what, "b"),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn send_timeout_bounds_the_wait_but_not_the_event() {
    let mut registry = Registry::new();
    registry.add_action("slow", std::sync::Arc::new(SlowAction));
    let machine = Machine::from_description(
        "{ id: 'm', initial: 'a', states: { a: { on: { GO: { target: 'b', actions: 'slow' } } }, b: {} } }",
        registry,
    )
    .unwrap();
    machine.start().await.unwrap();

    let result = machine
        .send_timeout("GO", None, Duration::from_millis(20))
        .await;
    assert!(matches!(result, Err(RuntimeError::WaitTimeout { .. })));

    // The event stayed enqueued and still lands.
    let state = machine.wait_for_state("b", 2_000).await.unwrap();
    assert_eq!(state, "#m.b");
}

// ── Construction-time errors ──

#[tokio::test]
async fn unbound_names_fail_construction_with_bind_errors() {
    let err = Machine::from_description(
        "{ id: 'm', initial: 'a', states: { a: { entry: 'missing' } } }",
        Registry::new(),
    )
    .unwrap_err();
    assert!(matches!(err, DefinitionError::Bind { .. }));
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn events_before_start_are_dropped() {
    let machine = Machine::from_description(
        "{ id: 'm', initial: 'a', states: { a: { on: { GO: 'b' } }, b: {} } }",
        Registry::new(),
    )
    .unwrap();
    machine.send("GO").await.unwrap();
    assert_eq!(machine.start().await.unwrap(), "#m.a");
}

// ── Isolation ──

#[tokio::test]
async fn isolated_instances_coexist_in_one_orchestrator() {
    let orchestrator = statechart_lite_core::Orchestrator::new();
    let text = "{ id: 'w', initial: 'a', states: { a: { on: { GO: 'b' } }, b: {} } }";
    let first = orchestrator
        .create_machine_isolated("w", text, Registry::new())
        .await
        .unwrap();
    let second = orchestrator
        .create_machine_isolated("w", text, Registry::new())
        .await
        .unwrap();
    assert_ne!(first.id(), second.id());

    first.start().await.unwrap();
    second.start().await.unwrap();
    first.send("GO").await.unwrap();

    assert!(first.active_state_names(true).ends_with(".b"));
    assert!(second.active_state_names(true).ends_with(".a"));
}
