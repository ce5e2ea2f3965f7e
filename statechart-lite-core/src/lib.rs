//! statechart-lite-core — an interpreter for hierarchical finite state
//! machines in the SCXML/Harel lineage: compound and parallel states,
//! history, guards, actions, delayed (`after`) transitions, invoked
//! services, and an actor-style orchestrator that routes events between
//! machines.
//!
//! A machine is created from a declarative, JSON-shaped description (with
//! a permissive lexer), compiled into a verified state graph, and driven
//! by a per-machine event loop: one macrostep at a time, eventless
//! transitions settled to quiescence, timers and services scoped to state
//! occupancy.
//!
//! ```no_run
//! use statechart_lite_core::{Orchestrator, Registry, action_fn};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let mut registry = Registry::new();
//! registry.add_action("hello", action_fn(|scope| {
//!     scope.set("greeted", serde_json::json!(true));
//!     Ok(())
//! }));
//!
//! let orchestrator = Orchestrator::new();
//! let machine = orchestrator.create_machine(
//!     "demo",
//!     "{ id: 'demo', initial: 'idle', states: {
//!          idle: { entry: 'hello', on: { GO: 'busy' } },
//!          busy: {},
//!      } }",
//!     registry,
//! ).await?;
//!
//! machine.start().await?;
//! let state = machine.send("GO").await?;
//! assert_eq!(state, "#demo.busy");
//! # Ok(())
//! # }
//! ```

pub mod compiler;
pub mod context;
pub mod error;
pub mod machine;
pub mod monitor;
pub mod orchestrator;
pub mod registry;
pub mod services;
mod step;
mod timers;
pub mod types;

pub use compiler::{
    build_graph, parse_document, BuildOptions, HistoryKind, StateGraph, StateKind, StateNode,
    Transition, Trigger,
};
pub use context::{Context, ContextView};
pub use error::{BindKind, DefinitionError, RuntimeError, StepFault};
pub use machine::{Machine, MAX_MICROSTEPS};
pub use monitor::{Monitor, MonitorRecord, RecordKind, DEFAULT_MONITOR_CAPACITY};
pub use orchestrator::Orchestrator;
pub use registry::{
    action_fn, guard_fn, guard_try_fn, service_fn, Action, ActionScope, Guard, OutboundSend,
    Registry, Service,
};
pub use services::ServiceJob;
pub use types::{
    Event, EventKind, MachineSnapshot, MachineStatus, NodeId, KEY_ERROR, KEY_EVENT, KEY_RESULT,
};
