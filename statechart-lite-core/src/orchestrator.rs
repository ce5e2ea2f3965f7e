//! Orchestrator / event bus (C9).
//!
//! A registry of machines by identifier within one scope ("channel
//! group"). Delivery is asynchronous: `send` enqueues onto the target's
//! event loop and returns; sends to unknown or stopped recipients are
//! dropped (observable via logging, not via return). Broadcast fans out
//! over an explicit subscription table. Multiple orchestrators may coexist
//! in one process — there is no global singleton; machines get their
//! orchestrator at construction.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::compiler::BuildOptions;
use crate::error::DefinitionError;
use crate::machine::Machine;
use crate::registry::Registry;
use crate::types::Event;

struct Endpoint {
    display_name: String,
    machine: Machine,
}

#[derive(Default)]
struct Inner {
    machines: RwLock<HashMap<String, Endpoint>>,
    /// publisher id → subscriber ids, broadcast fan-out order.
    subscriptions: RwLock<HashMap<String, Vec<String>>>,
}

/// Cheap-to-clone handle to one channel group.
#[derive(Clone, Default)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse, build, bind, spawn, and register a machine under `id` (the
    /// description's own `id` is overridden so registration and
    /// fully-qualified state ids agree).
    pub async fn create_machine(
        &self,
        id: &str,
        text: &str,
        registry: Registry,
    ) -> Result<Machine, DefinitionError> {
        let opts = BuildOptions {
            isolate: false,
            id_override: Some(id.to_string()),
        };
        let machine = Machine::build(text, registry, &opts, Some(self.clone()))?;
        self.register(&machine).await;
        Ok(machine)
    }

    /// Like [`create_machine`](Self::create_machine), but with identifier
    /// isolation: the registered id carries a fresh suffix, so the same
    /// description can be instantiated repeatedly in one group.
    pub async fn create_machine_isolated(
        &self,
        id: &str,
        text: &str,
        registry: Registry,
    ) -> Result<Machine, DefinitionError> {
        let opts = BuildOptions {
            isolate: true,
            id_override: Some(id.to_string()),
        };
        let machine = Machine::build(text, registry, &opts, Some(self.clone()))?;
        self.register(&machine).await;
        Ok(machine)
    }

    pub async fn register(&self, machine: &Machine) {
        self.register_named(machine, machine.id()).await;
    }

    /// Re-registering an existing id updates the display name; prior
    /// observations persist (the monitor channel lives on the machine).
    pub async fn register_named(&self, machine: &Machine, display_name: &str) {
        let mut machines = self.inner.machines.write().await;
        machines.insert(
            machine.id().to_string(),
            Endpoint {
                display_name: display_name.to_string(),
                machine: machine.clone(),
            },
        );
    }

    /// Remove a machine from the group. Subscriptions naming it stay; the
    /// resulting sends are dropped like any unknown recipient.
    pub async fn unregister(&self, id: &str) -> bool {
        self.inner.machines.write().await.remove(id).is_some()
    }

    pub async fn get(&self, id: &str) -> Option<Machine> {
        self.inner
            .machines
            .read()
            .await
            .get(id)
            .map(|e| e.machine.clone())
    }

    pub async fn display_name(&self, id: &str) -> Option<String> {
        self.inner
            .machines
            .read()
            .await
            .get(id)
            .map(|e| e.display_name.clone())
    }

    pub async fn ids(&self) -> Vec<String> {
        self.inner.machines.read().await.keys().cloned().collect()
    }

    /// Asynchronous delivery: enqueue onto `to`'s event loop and return.
    /// Per-pair ordering (A→B) follows enqueue order.
    pub async fn send(&self, from: &str, to: &str, event: &str, payload: Option<Value>) {
        let target = {
            let machines = self.inner.machines.read().await;
            machines.get(to).map(|e| e.machine.clone())
        };
        match target {
            Some(machine) => {
                let event = match payload {
                    Some(payload) => Event::with_payload(event, payload),
                    None => Event::named(event),
                };
                if !machine.post(event) {
                    tracing::warn!(from, to, "send dropped: recipient stopped");
                }
            }
            None => {
                tracing::warn!(from, to, event, "send dropped: unknown recipient");
            }
        }
    }

    /// Subscribe `subscriber` to `publisher`'s broadcasts. Idempotent.
    pub async fn subscribe(&self, publisher: &str, subscriber: &str) {
        let mut subs = self.inner.subscriptions.write().await;
        let list = subs.entry(publisher.to_string()).or_default();
        if !list.iter().any(|s| s == subscriber) {
            list.push(subscriber.to_string());
        }
    }

    pub async fn unsubscribe(&self, publisher: &str, subscriber: &str) {
        let mut subs = self.inner.subscriptions.write().await;
        if let Some(list) = subs.get_mut(publisher) {
            list.retain(|s| s != subscriber);
        }
    }

    /// Fan `event` out to every subscriber of `from`, via `send`.
    pub async fn broadcast(&self, from: &str, event: &str) {
        let subscribers = {
            let subs = self.inner.subscriptions.read().await;
            subs.get(from).cloned().unwrap_or_default()
        };
        for to in subscribers {
            self.send(from, &to, event, None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    const TOGGLE: &str =
        "{ id: 't', initial: 'off', states: { off: { on: { FLIP: 'on' } }, on: {} } }";

    #[tokio::test]
    async fn register_lookup_unregister() {
        let orchestrator = Orchestrator::new();
        let machine = orchestrator
            .create_machine("t", TOGGLE, Registry::new())
            .await
            .unwrap();
        machine.start().await.unwrap();

        assert!(orchestrator.get("t").await.is_some());
        assert_eq!(orchestrator.ids().await, vec!["t".to_string()]);
        assert!(orchestrator.unregister("t").await);
        assert!(orchestrator.get("t").await.is_none());
        assert!(!orchestrator.unregister("t").await);
    }

    #[tokio::test]
    async fn sends_to_unknown_recipients_are_dropped_without_error() {
        let orchestrator = Orchestrator::new();
        orchestrator.send("nobody", "missing", "PING", None).await;
    }

    #[tokio::test]
    async fn re_registration_updates_the_display_name() {
        let orchestrator = Orchestrator::new();
        let machine = orchestrator
            .create_machine("t", TOGGLE, Registry::new())
            .await
            .unwrap();
        assert_eq!(orchestrator.display_name("t").await.unwrap(), "t");
        orchestrator.register_named(&machine, "toggler").await;
        assert_eq!(orchestrator.display_name("t").await.unwrap(), "toggler");
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_unsubscribe_removes() {
        let orchestrator = Orchestrator::new();
        orchestrator.subscribe("p", "c1").await;
        orchestrator.subscribe("p", "c1").await;
        orchestrator.subscribe("p", "c2").await;
        {
            let subs = orchestrator.inner.subscriptions.read().await;
            assert_eq!(subs.get("p").unwrap().len(), 2);
        }
        orchestrator.unsubscribe("p", "c1").await;
        let subs = orchestrator.inner.subscriptions.read().await;
        assert_eq!(subs.get("p").unwrap(), &vec!["c2".to_string()]);
    }
}
