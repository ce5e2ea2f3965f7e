//! Machine handle and event loop (C6).
//!
//! Each machine owns a single-consumer queue drained by one spawned task.
//! Producers are the orchestrator, `Machine::send`, timer fires, service
//! completions, and action-raised self events. One macrostep runs to
//! completion before the next event is dequeued; events posted during a
//! step are appended, never processed re-entrantly. A snapshot of the
//! externally visible state is published on a watch channel after every
//! macrostep.
//!
//! ## Lifecycle
//!
//! ```text
//! Constructed --start()--> Running --(top-level final)--> Stopped{terminal}
//!                              |----stop()-------------> Stopped
//!                              |----action failure-----> Error (still running)
//! ```
//!
//! Events delivered while `Constructed` or `Stopped` are dropped.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::compiler::{build_graph, parse_document, BuildOptions, StateGraph};
use crate::context::Context;
use crate::error::{DefinitionError, RuntimeError, StepFault};
use crate::monitor::{Monitor, RecordKind, DEFAULT_MONITOR_CAPACITY};
use crate::orchestrator::Orchestrator;
use crate::registry::{ActionScope, OutboundSend, Registry};
use crate::services::{ServiceBoard, ServiceJob};
use crate::step::{self, Stimulus};
use crate::timers::TimerBoard;
use crate::types::{
    Event, EventKind, MachineSnapshot, MachineStatus, NodeId, KEY_ERROR, KEY_EVENT, KEY_RESULT,
};

/// Per-macrostep bound on microsteps (eventless settling plus synthesized
/// completion events). Exceeding it is reported as an infinite-loop fault.
pub const MAX_MICROSTEPS: usize = 128;

/// Event name actions observe during initial entry.
const INIT_EVENT: &str = "$init";

pub(crate) enum Mailbox {
    Start {
        reply: oneshot::Sender<String>,
    },
    Deliver {
        event: Event,
        reply: Option<oneshot::Sender<String>>,
    },
    Stop {
        reply: oneshot::Sender<String>,
    },
}

/// Cheap-to-clone handle to a running machine.
#[derive(Clone, Debug)]
pub struct Machine {
    id: String,
    graph: Arc<StateGraph>,
    tx: mpsc::UnboundedSender<Mailbox>,
    snapshot_rx: watch::Receiver<MachineSnapshot>,
    monitor: Monitor,
}

impl Machine {
    /// Parse, build, bind, and spawn a standalone machine (no
    /// orchestrator; actions that try to send cross-machine will log and
    /// drop). Must be called within a tokio runtime.
    pub fn from_description(text: &str, registry: Registry) -> Result<Self, DefinitionError> {
        Self::build(text, registry, &BuildOptions::default(), None)
    }

    pub(crate) fn build(
        text: &str,
        registry: Registry,
        opts: &BuildOptions,
        orchestrator: Option<Orchestrator>,
    ) -> Result<Self, DefinitionError> {
        let doc = parse_document(text)?;
        let graph = build_graph(&doc, opts)?;
        registry.bind_check(&graph)?;
        Ok(Self::from_graph(Arc::new(graph), registry, orchestrator))
    }

    pub(crate) fn from_graph(
        graph: Arc<StateGraph>,
        registry: Registry,
        orchestrator: Option<Orchestrator>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(MachineSnapshot::empty());
        let monitor = Monitor::new(graph.machine_id.clone(), DEFAULT_MONITOR_CAPACITY);

        let runtime = Runtime {
            graph: Arc::clone(&graph),
            registry,
            orchestrator,
            monitor: monitor.clone(),
            self_tx: tx.clone(),
            snapshot_tx,
            config: BTreeSet::new(),
            history: HashMap::new(),
            context: Context::new(graph.initial_context.clone()),
            status: MachineStatus::Constructed,
            terminal_pending: false,
            timers: TimerBoard::new(),
            services: ServiceBoard::new(),
            raised: Vec::new(),
            outbound: Vec::new(),
        };
        tokio::spawn(runtime.run(rx));

        Self {
            id: graph.machine_id.clone(),
            graph,
            tx,
            snapshot_rx,
            monitor,
        }
    }

    /// Machine identifier (isolation suffix included).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn graph(&self) -> &StateGraph {
        &self.graph
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn status(&self) -> MachineStatus {
        self.snapshot_rx.borrow().status.clone()
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Snapshot copy of the context map (the live map is loop-confined).
    pub fn context_snapshot(&self) -> serde_json::Map<String, Value> {
        self.snapshot_rx.borrow().context.clone()
    }

    /// Semicolon-joined fq ids of the active configuration.
    pub fn active_state_names(&self, leaf_only: bool) -> String {
        self.snapshot_rx.borrow().state_string(leaf_only)
    }

    pub fn definition_version(&self) -> [u8; 32] {
        self.graph.definition_version
    }

    /// Enter the initial configuration; resolves to the initial state
    /// string once entry actions and eventless settling are done.
    pub async fn start(&self) -> Result<String, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Mailbox::Start { reply })
            .map_err(|_| RuntimeError::Closed(self.id.clone()))?;
        rx.await.map_err(|_| RuntimeError::Closed(self.id.clone()))
    }

    /// Direct send; resolves to the post-step state string. An event sent
    /// to a stopped machine is dropped and the last state string returns.
    pub async fn send(&self, event: &str) -> Result<String, RuntimeError> {
        self.deliver(Event::named(event), None).await
    }

    pub async fn send_with_payload(
        &self,
        event: &str,
        payload: Value,
    ) -> Result<String, RuntimeError> {
        self.deliver(Event::with_payload(event, payload), None).await
    }

    /// Send with a bound on how long the caller waits for the reply. The
    /// timeout never cancels the event itself — it stays enqueued.
    pub async fn send_timeout(
        &self,
        event: &str,
        payload: Option<Value>,
        timeout: Duration,
    ) -> Result<String, RuntimeError> {
        let event = match payload {
            Some(p) => Event::with_payload(event, p),
            None => Event::named(event),
        };
        self.deliver(event, Some(timeout)).await
    }

    /// Enqueue without waiting for processing (the orchestrator path).
    pub(crate) fn post(&self, event: Event) -> bool {
        self.tx.send(Mailbox::Deliver { event, reply: None }).is_ok()
    }

    /// Run exit actions bottom-up, cancel timers and services, park the
    /// loop. Resolves to the final state string.
    pub async fn stop(&self) -> String {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Mailbox::Stop { reply }).is_err() {
            return self.snapshot_rx.borrow().state_string(true);
        }
        match rx.await {
            Ok(state) => state,
            Err(_) => self.snapshot_rx.borrow().state_string(true),
        }
    }

    /// Wait until a state whose fq id matches `partial` (equal, or aligned
    /// on dot boundaries) is active. Resolves to the matching fq id.
    pub async fn wait_for_state(
        &self,
        partial: &str,
        timeout_ms: u64,
    ) -> Result<String, RuntimeError> {
        let mut rx = self.snapshot_rx.clone();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if let Some(hit) = match_partial(&rx.borrow_and_update().configuration, partial) {
                return Ok(hit);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    // Loop is gone; one last look at the final snapshot.
                    let hit = match_partial(&rx.borrow().configuration, partial);
                    return hit.ok_or_else(|| RuntimeError::Closed(self.id.clone()));
                }
                Err(_) => {
                    return Err(RuntimeError::WaitTimeout {
                        what: partial.to_string(),
                        timeout_ms,
                    })
                }
            }
        }
    }

    async fn deliver(
        &self,
        event: Event,
        timeout: Option<Duration>,
    ) -> Result<String, RuntimeError> {
        let event_name = event.display_name();
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Mailbox::Deliver {
                event,
                reply: Some(reply),
            })
            .is_err()
        {
            // Stopped machine: the event is silently dropped.
            return Ok(self.snapshot_rx.borrow().state_string(true));
        }
        match timeout {
            None => match rx.await {
                Ok(state) => Ok(state),
                Err(_) => Ok(self.snapshot_rx.borrow().state_string(true)),
            },
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(Ok(state)) => Ok(state),
                Ok(Err(_)) => Ok(self.snapshot_rx.borrow().state_string(true)),
                Err(_) => Err(RuntimeError::WaitTimeout {
                    what: event_name,
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
        }
    }
}

/// A partial id matches an active fq id when it equals it or lines up with
/// whole dot-separated segments of it.
fn match_partial(configuration: &[String], partial: &str) -> Option<String> {
    let suffix = format!(".{partial}");
    let prefix = format!("{partial}.");
    let interior = format!(".{partial}.");
    configuration
        .iter()
        .find(|id| {
            id.as_str() == partial
                || id.ends_with(&suffix)
                || id.starts_with(&prefix)
                || id.contains(&interior)
        })
        .cloned()
}

// ─── The event loop ───────────────────────────────────────────

enum Micro {
    /// Nothing fired.
    Quiet,
    /// At least one transition ran.
    Fired,
    /// Conflict: the step was abandoned in the pre-step configuration.
    Aborted,
}

struct Runtime {
    graph: Arc<StateGraph>,
    registry: Registry,
    orchestrator: Option<Orchestrator>,
    monitor: Monitor,
    self_tx: mpsc::UnboundedSender<Mailbox>,
    snapshot_tx: watch::Sender<MachineSnapshot>,
    config: BTreeSet<NodeId>,
    history: HashMap<NodeId, Vec<NodeId>>,
    context: Context,
    status: MachineStatus,
    terminal_pending: bool,
    timers: TimerBoard,
    services: ServiceBoard,
    raised: Vec<Event>,
    outbound: Vec<OutboundSend>,
}

impl Runtime {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Mailbox>) {
        self.publish();
        while let Some(msg) = rx.recv().await {
            match msg {
                Mailbox::Start { reply } => {
                    if self.status == MachineStatus::Constructed {
                        self.enter_initial().await;
                        if self.terminal_pending {
                            self.shutdown(true).await;
                        } else {
                            self.publish();
                        }
                    }
                    let _ = reply.send(self.state_string());
                }
                Mailbox::Deliver { event, reply } => {
                    if !self.status.accepts_events() {
                        tracing::debug!(
                            machine = %self.graph.machine_id,
                            event = %event.display_name(),
                            "event dropped (machine not running)"
                        );
                        if let Some(reply) = reply {
                            let _ = reply.send(self.state_string());
                        }
                        continue;
                    }
                    if self.is_stale(&event) {
                        if let Some(reply) = reply {
                            let _ = reply.send(self.state_string());
                        }
                        continue;
                    }
                    self.macrostep(event).await;
                    if self.terminal_pending && !self.status.is_stopped() {
                        self.shutdown(true).await;
                    } else {
                        self.publish();
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(self.state_string());
                    }
                }
                Mailbox::Stop { reply } => {
                    if !self.status.is_stopped() {
                        self.shutdown(false).await;
                    }
                    let _ = reply.send(self.state_string());
                    break;
                }
            }
            if self.status.is_stopped() {
                break;
            }
        }
    }

    /// Filter timer fires and service completions that outlived their
    /// state occupancy; they must never become observable.
    fn is_stale(&mut self, event: &Event) -> bool {
        match &event.kind {
            EventKind::TimerFired { node, timer_id } => {
                if !self.config.contains(node) {
                    tracing::debug!(
                        machine = %self.graph.machine_id,
                        timer = %timer_id,
                        "timer fire dropped (state no longer entered)"
                    );
                    return true;
                }
                false
            }
            EventKind::ServiceDone { node, invocation } => {
                match self.services.complete(*node, *invocation) {
                    Some(service) => {
                        self.monitor.emit(RecordKind::ServiceCompleted {
                            state: self.graph.nodes[*node].id.clone(),
                            service,
                        });
                        false
                    }
                    None => true,
                }
            }
            EventKind::ServiceFailed { node, invocation } => {
                match self.services.complete(*node, *invocation) {
                    Some(service) => {
                        let message = event
                            .payload
                            .as_ref()
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string();
                        self.monitor.emit(RecordKind::ServiceErrored {
                            state: self.graph.nodes[*node].id.clone(),
                            service,
                            message,
                        });
                        false
                    }
                    None => true,
                }
            }
            _ => false,
        }
    }

    // ── Macrostep ──

    async fn macrostep(&mut self, event: Event) {
        self.monitor.emit(RecordKind::EventReceived {
            event: event.display_name(),
        });

        match (&event.kind, &event.payload) {
            (EventKind::ServiceDone { .. }, Some(value)) => {
                self.context.set(KEY_RESULT, value.clone());
            }
            (EventKind::ServiceFailed { .. }, Some(value)) => {
                self.context.set(KEY_ERROR, value.clone());
            }
            _ => {}
        }
        self.context
            .set(KEY_EVENT, event.payload.clone().unwrap_or(Value::Null));

        let mut internal = VecDeque::new();
        if matches!(
            self.microstep(&event, false, &mut internal).await,
            Micro::Aborted
        ) {
            return;
        }
        self.settle(&event, &mut internal).await;
    }

    /// Drain eventless transitions and synthesized completion events to
    /// quiescence, bounded by [`MAX_MICROSTEPS`].
    async fn settle(&mut self, last_event: &Event, internal: &mut VecDeque<Event>) {
        let mut steps = 0usize;
        loop {
            steps += 1;
            if steps > MAX_MICROSTEPS {
                self.fault(StepFault::InfiniteLoop(MAX_MICROSTEPS));
                self.status = MachineStatus::Error;
                return;
            }
            match self.microstep(last_event, true, internal).await {
                Micro::Fired => continue,
                Micro::Aborted => return,
                Micro::Quiet => {
                    let Some(event) = internal.pop_front() else {
                        return;
                    };
                    self.monitor.emit(RecordKind::EventReceived {
                        event: event.display_name(),
                    });
                    if matches!(
                        self.microstep(&event, false, internal).await,
                        Micro::Aborted
                    ) {
                        return;
                    }
                }
            }
        }
    }

    /// One microstep: select, exit, act, enter.
    async fn microstep(
        &mut self,
        event: &Event,
        eventless: bool,
        internal: &mut VecDeque<Event>,
    ) -> Micro {
        let graph = Arc::clone(&self.graph);
        let stimulus = if eventless {
            Stimulus::Always
        } else {
            Stimulus::from_event(event)
        };

        // Guards: evaluated in document order, memoized so a guard runs at
        // most once per selection pass even when several leaves walk the
        // same ancestor.
        let selection = {
            let ctx = &self.context;
            let registry = &self.registry;
            let monitor = &self.monitor;
            let mut memo: HashMap<(NodeId, usize), bool> = HashMap::new();
            step::select(&graph, &self.config, &stimulus, &mut |node, index, t| {
                *memo.entry((node, index)).or_insert_with(|| match &t.guard {
                    None => true,
                    Some(name) => match registry.guard(name).map(|g| g.evaluate(&ctx.view())) {
                        Some(Ok(result)) => {
                            monitor.emit(RecordKind::GuardEvaluated {
                                guard: name.clone(),
                                result,
                            });
                            result
                        }
                        Some(Err(message)) => {
                            monitor.emit(RecordKind::StepFaulted {
                                fault: StepFault::Guard {
                                    name: name.clone(),
                                    message,
                                }
                                .to_string(),
                            });
                            monitor.emit(RecordKind::GuardEvaluated {
                                guard: name.clone(),
                                result: false,
                            });
                            false
                        }
                        None => false,
                    },
                })
            })
        };

        let selected = match selection {
            Ok(selected) if selected.is_empty() => return Micro::Quiet,
            Ok(selected) => selected,
            Err(conflict) => {
                self.fault(StepFault::Conflict {
                    first: graph.nodes[conflict.first.node].id.clone(),
                    second: graph.nodes[conflict.second.node].id.clone(),
                });
                return Micro::Aborted;
            }
        };

        let mut exit_all: BTreeSet<NodeId> = BTreeSet::new();
        let mut entry_all: BTreeSet<NodeId> = BTreeSet::new();
        for tref in &selected {
            let t = tref.get(&graph);
            exit_all.extend(step::exit_set(&graph, &self.config, t));
            entry_all.extend(step::entry_set(&graph, t, &self.history));
        }

        // History is recorded against the pre-exit configuration, and
        // timers/services die before any exit action can observe them.
        step::capture_history(&graph, &self.config, &exit_all, &mut self.history);
        for &node in &exit_all {
            self.timers.cancel_state(&graph, node, &self.monitor);
            self.services
                .cancel_state(node, &graph.nodes[node].id, &self.monitor);
        }

        // Exit actions, innermost first (reverse document order).
        for &node in exit_all.iter().rev() {
            self.run_actions(&graph.nodes[node].exit, &graph.nodes[node].id, event)
                .await;
            self.config.remove(&node);
            self.monitor.emit(RecordKind::StateExited {
                state: graph.nodes[node].id.clone(),
            });
        }

        // Transition actions in selection order.
        for tref in &selected {
            let t = tref.get(&graph);
            let from = graph.nodes[t.source].id.clone();
            let to = if t.targets.is_empty() {
                from.clone()
            } else {
                t.targets
                    .iter()
                    .map(|&n| graph.nodes[n].id.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            };
            self.monitor.emit(RecordKind::TransitionTaken {
                from,
                to,
                event: event.display_name(),
            });
            self.run_actions(&t.actions, &graph.nodes[t.source].id, event)
                .await;
        }

        self.enter_nodes(&graph, &entry_all, event, internal).await;
        self.flush_buffers().await;
        Micro::Fired
    }

    /// Entry phase: configuration insertions, entry actions outermost
    /// first, timers and services for newly entered states, completion
    /// synthesis.
    async fn enter_nodes(
        &mut self,
        graph: &Arc<StateGraph>,
        entry: &BTreeSet<NodeId>,
        event: &Event,
        internal: &mut VecDeque<Event>,
    ) {
        for &node in entry {
            self.config.insert(node);
        }
        for &node in entry {
            self.monitor.emit(RecordKind::StateEntered {
                state: graph.nodes[node].id.clone(),
            });
            self.run_actions(&graph.nodes[node].entry, &graph.nodes[node].id, event)
                .await;
        }
        for &node in entry {
            self.timers
                .arm_state(graph, node, &self.self_tx, &self.monitor);
            if let Some(invoke) = &graph.nodes[node].invoke {
                let Some(service) = self.registry.service(&invoke.src).cloned() else {
                    // Unreachable after bind_check; never fatal at runtime.
                    tracing::error!(
                        machine = %graph.machine_id,
                        service = %invoke.src,
                        "invoked service vanished from the registry"
                    );
                    continue;
                };
                let job = ServiceJob {
                    machine: graph.machine_id.clone(),
                    state: graph.nodes[node].id.clone(),
                    context: self.context.snapshot(),
                    cancel: CancellationToken::new(),
                };
                self.services.launch(
                    node,
                    &graph.nodes[node].id,
                    &invoke.src,
                    service,
                    job,
                    &self.self_tx,
                    &self.monitor,
                );
            }
        }
        for completed in step::completions(graph, &self.config, entry) {
            if completed == graph.root {
                self.terminal_pending = true;
            } else {
                internal.push_back(Event {
                    kind: EventKind::Done { node: completed },
                    payload: None,
                });
            }
        }
    }

    async fn run_actions(&mut self, names: &[String], state_id: &str, event: &Event) {
        for name in names {
            let actions: Vec<_> = self
                .registry
                .actions_for(name)
                .map(<[_]>::to_vec)
                .unwrap_or_default();
            for action in actions {
                let mut scope = ActionScope {
                    machine: &self.graph.machine_id,
                    state: state_id,
                    event,
                    ctx: &mut self.context,
                    raised: &mut self.raised,
                    outbound: &mut self.outbound,
                };
                match action.execute(&mut scope).await {
                    Ok(()) => {
                        self.monitor.emit(RecordKind::ActionExecuted {
                            action: name.clone(),
                            state: state_id.to_string(),
                        });
                    }
                    Err(message) => {
                        // Best effort: remaining actions still run; the
                        // machine surfaces Error status but keeps going.
                        self.fault(StepFault::Action {
                            name: name.clone(),
                            message,
                        });
                        self.status = MachineStatus::Error;
                    }
                }
            }
        }
    }

    /// Self-raises go to the back of the machine's own queue; cross-machine
    /// sends are routed through the orchestrator.
    async fn flush_buffers(&mut self) {
        for event in std::mem::take(&mut self.raised) {
            let _ = self.self_tx.send(Mailbox::Deliver { event, reply: None });
        }
        let outbound = std::mem::take(&mut self.outbound);
        if outbound.is_empty() {
            return;
        }
        match &self.orchestrator {
            Some(orchestrator) => {
                for OutboundSend { to, event, payload } in outbound {
                    orchestrator
                        .send(&self.graph.machine_id, &to, &event, payload)
                        .await;
                }
            }
            None => {
                tracing::warn!(
                    machine = %self.graph.machine_id,
                    count = outbound.len(),
                    "cross-machine sends dropped: machine has no orchestrator"
                );
            }
        }
    }

    // ── Lifecycle ──

    async fn enter_initial(&mut self) {
        let init_event = Event::named(INIT_EVENT);
        let entry = step::initial_entry_set(&self.graph);
        let graph = Arc::clone(&self.graph);
        let mut internal = VecDeque::new();

        self.status = MachineStatus::Running;
        self.enter_nodes(&graph, &entry, &init_event, &mut internal)
            .await;
        self.flush_buffers().await;
        self.settle(&init_event, &mut internal).await;

        self.monitor.emit(RecordKind::MachineStarted {
            initial: self.state_string(),
        });
    }

    /// Cancel timers and services atomically, then exit actions bottom-up.
    /// The last configuration stays visible in the final snapshot.
    async fn shutdown(&mut self, terminal: bool) {
        self.timers.cancel_all();
        self.services.cancel_all();

        let graph = Arc::clone(&self.graph);
        let stop_event = Event::named("$stop");
        let active: Vec<NodeId> = self.config.iter().rev().copied().collect();
        for node in active {
            self.run_actions(&graph.nodes[node].exit, &graph.nodes[node].id, &stop_event)
                .await;
            self.monitor.emit(RecordKind::StateExited {
                state: graph.nodes[node].id.clone(),
            });
        }

        self.status = MachineStatus::Stopped { terminal };
        self.monitor.emit(RecordKind::MachineStopped { terminal });
        self.publish();
    }

    // ── Plumbing ──

    fn fault(&self, fault: StepFault) {
        tracing::warn!(machine = %self.graph.machine_id, %fault, "step fault");
        self.monitor.emit(RecordKind::StepFaulted {
            fault: fault.to_string(),
        });
    }

    fn state_string(&self) -> String {
        self.graph
            .active_leaves(&self.config)
            .iter()
            .map(|&n| self.graph.nodes[n].id.as_str())
            .collect::<Vec<_>>()
            .join(";")
    }

    fn publish(&self) {
        let configuration: Vec<String> = self
            .config
            .iter()
            .map(|&n| self.graph.nodes[n].id.clone())
            .collect();
        let leaves: Vec<String> = self
            .graph
            .active_leaves(&self.config)
            .iter()
            .map(|&n| self.graph.nodes[n].id.clone())
            .collect();
        let _ = self.snapshot_tx.send(MachineSnapshot {
            status: self.status.clone(),
            configuration,
            leaves,
            context: self.context.snapshot(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_ids_match_on_segment_boundaries() {
        let config = vec![
            "#m".to_string(),
            "#m.work".to_string(),
            "#m.work.one".to_string(),
        ];
        assert_eq!(
            match_partial(&config, "work"),
            Some("#m.work".to_string())
        );
        assert_eq!(
            match_partial(&config, "one"),
            Some("#m.work.one".to_string())
        );
        assert_eq!(
            match_partial(&config, "#m.work.one"),
            Some("#m.work.one".to_string())
        );
        assert_eq!(match_partial(&config, "wor"), None);
        assert_eq!(match_partial(&config, "two"), None);
    }
}
