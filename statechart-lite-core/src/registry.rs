//! Name-indexed tables of host-supplied callbacks (C3), and the scopes
//! they run in.
//!
//! Actions receive a mutable [`ActionScope`]: context get/set plus
//! buffered event emission (self-raises and orchestrator sends are flushed
//! by the engine after the actions run; direct synchronous cross-machine
//! calls are not possible by construction). Guards are pure predicates
//! over a read-only [`ContextView`]. Services are long-running tasks
//! handed a [`ServiceJob`] with a context snapshot and a cancellation
//! token.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::{Context, ContextView};
use crate::error::{BindKind, DefinitionError};
use crate::services::ServiceJob;
use crate::types::Event;

// ─── Host-binding traits ──────────────────────────────────────

#[async_trait]
pub trait Action: Send + Sync {
    /// Mutate context and/or enqueue events. Must not block the loop.
    async fn execute(&self, scope: &mut ActionScope<'_>) -> Result<(), String>;
}

pub trait Guard: Send + Sync {
    /// Pure predicate. An `Err` is treated as guard-false and reported.
    fn evaluate(&self, ctx: &ContextView<'_>) -> Result<bool, String>;
}

#[async_trait]
pub trait Service: Send + Sync {
    /// Long-running task scoped to a state's occupancy. Must respect
    /// `job.cancel` at its next await point; the engine drops the task at
    /// the cancellation boundary either way.
    async fn run(&self, job: ServiceJob) -> Result<Value, String>;
}

// ─── Action scope ─────────────────────────────────────────────

/// Cross-machine send buffered by an action, flushed via the orchestrator.
#[derive(Clone, Debug)]
pub struct OutboundSend {
    pub to: String,
    pub event: String,
    pub payload: Option<Value>,
}

/// What an action can see and do during one step.
pub struct ActionScope<'a> {
    pub(crate) machine: &'a str,
    pub(crate) state: &'a str,
    pub(crate) event: &'a Event,
    pub(crate) ctx: &'a mut Context,
    pub(crate) raised: &'a mut Vec<Event>,
    pub(crate) outbound: &'a mut Vec<OutboundSend>,
}

impl ActionScope<'_> {
    pub fn machine(&self) -> &str {
        self.machine
    }

    /// Fully-qualified id of the state this action runs for (the source
    /// state for transition actions).
    pub fn state(&self) -> &str {
        self.state
    }

    /// The event being processed.
    pub fn event(&self) -> &Event {
        self.event
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.ctx.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.ctx.set(key, value);
    }

    /// Read-modify-write on an integer counter; missing or non-numeric
    /// starts at 0.
    pub fn bump(&mut self, key: &str, delta: i64) -> i64 {
        let next = self.ctx.get(key).and_then(Value::as_i64).unwrap_or(0) + delta;
        self.ctx.set(key, Value::from(next));
        next
    }

    /// Enqueue an event to this machine, processed as its own macrostep
    /// after the current one.
    pub fn raise(&mut self, event: impl Into<String>) {
        self.raised.push(Event::named(event));
    }

    pub fn raise_with_payload(&mut self, event: impl Into<String>, payload: Value) {
        self.raised.push(Event::with_payload(event, payload));
    }

    /// Enqueue a cross-machine send, delivered through the orchestrator
    /// after the current microstep's actions finish.
    pub fn send_to(&mut self, to: impl Into<String>, event: impl Into<String>) {
        self.outbound.push(OutboundSend {
            to: to.into(),
            event: event.into(),
            payload: None,
        });
    }

    pub fn send_to_with_payload(
        &mut self,
        to: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) {
        self.outbound.push(OutboundSend {
            to: to.into(),
            event: event.into(),
            payload: Some(payload),
        });
    }
}

// ─── Closure adapters ─────────────────────────────────────────

struct FnAction<F>(F);

#[async_trait]
impl<F> Action for FnAction<F>
where
    F: Fn(&mut ActionScope<'_>) -> Result<(), String> + Send + Sync,
{
    async fn execute(&self, scope: &mut ActionScope<'_>) -> Result<(), String> {
        (self.0)(scope)
    }
}

/// Wrap a synchronous closure as an action.
pub fn action_fn<F>(f: F) -> Arc<dyn Action>
where
    F: Fn(&mut ActionScope<'_>) -> Result<(), String> + Send + Sync + 'static,
{
    Arc::new(FnAction(f))
}

struct FnGuard<F>(F);

impl<F> Guard for FnGuard<F>
where
    F: Fn(&ContextView<'_>) -> bool + Send + Sync,
{
    fn evaluate(&self, ctx: &ContextView<'_>) -> Result<bool, String> {
        Ok((self.0)(ctx))
    }
}

/// Wrap an infallible predicate as a guard.
pub fn guard_fn<F>(f: F) -> Arc<dyn Guard>
where
    F: Fn(&ContextView<'_>) -> bool + Send + Sync + 'static,
{
    Arc::new(FnGuard(f))
}

struct TryGuard<F>(F);

impl<F> Guard for TryGuard<F>
where
    F: Fn(&ContextView<'_>) -> Result<bool, String> + Send + Sync,
{
    fn evaluate(&self, ctx: &ContextView<'_>) -> Result<bool, String> {
        (self.0)(ctx)
    }
}

/// Wrap a fallible predicate as a guard.
pub fn guard_try_fn<F>(f: F) -> Arc<dyn Guard>
where
    F: Fn(&ContextView<'_>) -> Result<bool, String> + Send + Sync + 'static,
{
    Arc::new(TryGuard(f))
}

struct FnService<F>(F);

#[async_trait]
impl<F, Fut> Service for FnService<F>
where
    F: Fn(ServiceJob) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, String>> + Send + 'static,
{
    async fn run(&self, job: ServiceJob) -> Result<Value, String> {
        (self.0)(job).await
    }
}

/// Wrap an async closure as a service.
pub fn service_fn<F, Fut>(f: F) -> Arc<dyn Service>
where
    F: Fn(ServiceJob) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, String>> + Send + 'static,
{
    Arc::new(FnService(f))
}

// ─── Registry ─────────────────────────────────────────────────

/// The three tables bound at machine construction. Actions under one name
/// form an ordered list and all run, in order; guards and services are
/// single-valued per name.
#[derive(Clone, Default)]
pub struct Registry {
    actions: HashMap<String, Vec<Arc<dyn Action>>>,
    guards: HashMap<String, Arc<dyn Guard>>,
    services: HashMap<String, Arc<dyn Service>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_action(&mut self, name: impl Into<String>, action: Arc<dyn Action>) -> &mut Self {
        self.actions.entry(name.into()).or_default().push(action);
        self
    }

    pub fn add_guard(&mut self, name: impl Into<String>, guard: Arc<dyn Guard>) -> &mut Self {
        self.guards.insert(name.into(), guard);
        self
    }

    pub fn add_service(&mut self, name: impl Into<String>, service: Arc<dyn Service>) -> &mut Self {
        self.services.insert(name.into(), service);
        self
    }

    pub fn actions_for(&self, name: &str) -> Option<&[Arc<dyn Action>]> {
        self.actions.get(name).map(Vec::as_slice)
    }

    pub fn guard(&self, name: &str) -> Option<&Arc<dyn Guard>> {
        self.guards.get(name)
    }

    pub fn service(&self, name: &str) -> Option<&Arc<dyn Service>> {
        self.services.get(name)
    }

    /// Every name the graph references must be bound, else `BindError`.
    pub fn bind_check(&self, graph: &crate::compiler::StateGraph) -> Result<(), DefinitionError> {
        for node in &graph.nodes {
            for name in node.entry.iter().chain(node.exit.iter()) {
                if !self.actions.contains_key(name) {
                    return Err(self.unbound(BindKind::Action, name, &node.id));
                }
            }
            for t in &node.transitions {
                for name in &t.actions {
                    if !self.actions.contains_key(name) {
                        return Err(self.unbound(BindKind::Action, name, &node.id));
                    }
                }
                if let Some(name) = &t.guard {
                    if !self.guards.contains_key(name) {
                        return Err(self.unbound(BindKind::Guard, name, &node.id));
                    }
                }
            }
            if let Some(invoke) = &node.invoke {
                if !self.services.contains_key(&invoke.src) {
                    return Err(self.unbound(BindKind::Service, &invoke.src, &node.id));
                }
            }
        }
        Ok(())
    }

    fn unbound(&self, kind: BindKind, name: &str, state: &str) -> DefinitionError {
        DefinitionError::Bind {
            kind,
            name: name.to_string(),
            state: state.to_string(),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("guards", &self.guards.keys().collect::<Vec<_>>())
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish()
    }
}
