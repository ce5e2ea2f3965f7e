//! Shared runtime types: events, machine status, and snapshots.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Index into the state graph arena. Arena order is document order, so
/// comparing `NodeId`s compares document positions.
pub type NodeId = usize;

/// Context key the engine writes the current event payload under.
pub const KEY_EVENT: &str = "_event";
/// Context key a service's success value lands under.
pub const KEY_RESULT: &str = "_result";
/// Context key a service's error message lands under.
pub const KEY_ERROR: &str = "_error";

/// An event as it travels through a machine's queue.
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Option<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    /// External or self-raised event, matched by exact name.
    Named(String),
    /// Synthetic fire of an `after` timer. Matches only the transition
    /// carrying the same timer id on the owning node.
    TimerFired { node: NodeId, timer_id: String },
    /// A compound or parallel state completed (reached final).
    Done { node: NodeId },
    /// An invoked service resolved; payload carries the returned value.
    ServiceDone { node: NodeId, invocation: u64 },
    /// An invoked service failed; payload carries the error message.
    ServiceFailed { node: NodeId, invocation: u64 },
}

impl Event {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Named(name.into()),
            payload: None,
        }
    }

    pub fn with_payload(name: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: EventKind::Named(name.into()),
            payload: Some(payload),
        }
    }

    /// Display form used for monitor records and logs.
    pub fn display_name(&self) -> String {
        match &self.kind {
            EventKind::Named(name) => name.clone(),
            EventKind::TimerFired { timer_id, .. } => format!("after:{timer_id}"),
            EventKind::Done { .. } => "onDone".to_string(),
            EventKind::ServiceDone { .. } => "onDone(service)".to_string(),
            EventKind::ServiceFailed { .. } => "onError(service)".to_string(),
        }
    }
}

/// Machine lifecycle status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineStatus {
    /// Built and bound, event loop parked until `start`.
    Constructed,
    /// Handling events.
    Running,
    /// An action callback failed. The machine still accepts events.
    Error,
    /// Exit actions have run, timers and services are cancelled.
    /// `terminal` is set when a top-level final state was reached.
    Stopped { terminal: bool },
}

impl MachineStatus {
    pub fn is_stopped(&self) -> bool {
        matches!(self, MachineStatus::Stopped { .. })
    }

    /// Events are processed in `Running` and `Error`; everything else
    /// drops them.
    pub fn accepts_events(&self) -> bool {
        matches!(self, MachineStatus::Running | MachineStatus::Error)
    }
}

/// Point-in-time copy of a machine's externally visible state, published
/// on a watch channel after every macrostep. External context reads go
/// through this snapshot; the live map stays confined to the event loop.
#[derive(Clone, Debug)]
pub struct MachineSnapshot {
    pub status: MachineStatus,
    /// All entered fully-qualified ids, document order.
    pub configuration: Vec<String>,
    /// Atomic/final leaves only, document order.
    pub leaves: Vec<String>,
    pub context: serde_json::Map<String, Value>,
}

impl MachineSnapshot {
    pub(crate) fn empty() -> Self {
        Self {
            status: MachineStatus::Constructed,
            configuration: Vec::new(),
            leaves: Vec::new(),
            context: serde_json::Map::new(),
        }
    }

    /// Semicolon-joined state string: one fq id per leaf, or every entered
    /// ancestor when `leaf_only` is false.
    pub fn state_string(&self, leaf_only: bool) -> String {
        if leaf_only {
            self.leaves.join(";")
        } else {
            self.configuration.join(";")
        }
    }
}
