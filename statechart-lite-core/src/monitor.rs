//! Observation hooks (C10).
//!
//! The step engine emits [`MonitorRecord`]s at well-defined points onto a
//! bounded `tokio::sync::broadcast` channel. Subscribers attach and detach
//! dynamically; emission never blocks the event loop, and a slow subscriber
//! loses the oldest records (the broadcast lagging semantics).

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default per-machine record buffer. Slow subscribers past this depth
/// start losing the oldest records.
pub const DEFAULT_MONITOR_CAPACITY: usize = 256;

/// One observation record.
#[derive(Clone, Debug, Serialize)]
pub struct MonitorRecord {
    /// Machine identifier (isolated id when isolation is on).
    pub machine: String,
    pub at: DateTime<Utc>,
    pub kind: RecordKind,
}

#[derive(Clone, Debug, Serialize)]
pub enum RecordKind {
    MachineStarted { initial: String },
    MachineStopped { terminal: bool },
    EventReceived { event: String },
    GuardEvaluated { guard: String, result: bool },
    TransitionTaken { from: String, to: String, event: String },
    ActionExecuted { action: String, state: String },
    StateEntered { state: String },
    StateExited { state: String },
    TimerArmed { state: String, timer: String, delay_ms: u64 },
    TimerCancelled { state: String, timer: String },
    ServiceStarted { state: String, service: String },
    ServiceCompleted { state: String, service: String },
    ServiceErrored { state: String, service: String, message: String },
    ServiceCancelled { state: String, service: String },
    /// A runtime fault (conflict, guard/action failure, settle overrun).
    StepFaulted { fault: String },
}

/// Handle to a machine's record stream. Cheap to clone; cloning shares the
/// underlying channel.
#[derive(Clone, Debug)]
pub struct Monitor {
    machine: String,
    tx: broadcast::Sender<MonitorRecord>,
}

impl Monitor {
    pub(crate) fn new(machine: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            machine: machine.into(),
            tx,
        }
    }

    /// Attach a subscriber. Dropping the receiver detaches it.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorRecord> {
        self.tx.subscribe()
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    pub(crate) fn emit(&self, kind: RecordKind) {
        tracing::trace!(machine = %self.machine, record = ?kind, "monitor");
        // No subscribers is fine; records are best-effort.
        let _ = self.tx.send(MonitorRecord {
            machine: self.machine.clone(),
            at: Utc::now(),
            kind,
        });
    }
}
