//! Error taxonomy.
//!
//! Construction-time errors ([`DefinitionError`]) are fatal and surface to
//! the caller of `create_machine`. Runtime faults ([`StepFault`]) are
//! captured by the event loop, reported to the monitor, and never crash the
//! machine. The wait helpers are the only API surface that returns
//! [`RuntimeError::WaitTimeout`].

use std::fmt;
use thiserror::Error;

/// Which registry table an unbound reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindKind {
    Action,
    Guard,
    Service,
}

impl fmt::Display for BindKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindKind::Action => write!(f, "action"),
            BindKind::Guard => write!(f, "guard"),
            BindKind::Service => write!(f, "service"),
        }
    }
}

/// A machine description could not be turned into a runnable machine.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// Malformed description text.
    #[error("parse error at line {line}, column {column}: {reason}")]
    Parse {
        line: usize,
        column: usize,
        reason: String,
    },

    /// A referenced action, guard, or service name is not registered.
    #[error("unbound {kind} '{name}' referenced by state '{state}'")]
    Bind {
        kind: BindKind,
        name: String,
        state: String,
    },

    /// Structural violation in the state graph.
    #[error("invalid state graph:\n{0}")]
    Graph(String),
}

impl DefinitionError {
    /// Process exit code for CLI wrappers: 2 parse, 3 bind, 4 graph.
    pub fn exit_code(&self) -> i32 {
        match self {
            DefinitionError::Parse { .. } => 2,
            DefinitionError::Bind { .. } => 3,
            DefinitionError::Graph(_) => 4,
        }
    }
}

/// Runtime faults. These are reported on the monitor channel; the machine
/// stays responsive afterwards (in the pre-step configuration for
/// `Conflict`, with status `Error` for `Action` and `InfiniteLoop`).
#[derive(Debug, Clone, Error)]
pub enum StepFault {
    /// Transitions selected in different parallel regions have overlapping
    /// exit sets. The step is aborted.
    #[error("conflicting transitions from '{first}' and '{second}' have overlapping exit sets")]
    Conflict { first: String, second: String },

    /// Eventless settling did not reach quiescence within the step budget.
    #[error("eventless transitions did not settle after {0} microsteps")]
    InfiniteLoop(usize),

    /// A guard callback failed; treated as guard-false.
    #[error("guard '{name}' failed: {message}")]
    Guard { name: String, message: String },

    /// An action callback failed; remaining actions still run best-effort.
    #[error("action '{name}' failed: {message}")]
    Action { name: String, message: String },
}

/// Errors surfaced by the runtime API helpers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// `wait_for_state` (or a send with a delivery timeout) ran out of
    /// time. The event, if any, stays enqueued.
    #[error("timed out after {timeout_ms}ms waiting on '{what}'")]
    WaitTimeout { what: String, timeout_ms: u64 },

    /// The machine's event loop is gone (stopped and dropped).
    #[error("machine '{0}' is no longer running")]
    Closed(String),
}
