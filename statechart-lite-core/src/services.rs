//! Invoked services scoped to state occupancy (C8).
//!
//! Entering a state with an `invoke` launches its service with a fresh
//! cancellation token owned by that occupancy. Completion posts a
//! success/error event back onto the machine's queue carrying an
//! invocation sequence number; exiting the state cancels the token,
//! retires the invocation, and thereby discards any not-yet-delivered
//! completion.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::machine::Mailbox;
use crate::monitor::{Monitor, RecordKind};
use crate::types::{Event, EventKind, NodeId};

/// Everything a service task gets handed: a context snapshot (the live map
/// stays confined to the event loop), its machine and state, and the
/// cancellation token it must respect at its next await point.
#[derive(Clone)]
pub struct ServiceJob {
    pub machine: String,
    /// Fully-qualified id of the invoking state.
    pub state: String,
    pub context: serde_json::Map<String, Value>,
    pub cancel: CancellationToken,
}

struct RunningService {
    invocation: u64,
    service_name: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub(crate) struct ServiceBoard {
    running: HashMap<NodeId, RunningService>,
    seq: u64,
}

impl ServiceBoard {
    pub fn new() -> Self {
        Self {
            running: HashMap::new(),
            seq: 0,
        }
    }

    /// Launch `service` for `node`; returns the invocation number stamped
    /// onto its completion events.
    #[allow(clippy::too_many_arguments)]
    pub fn launch(
        &mut self,
        node: NodeId,
        state_id: &str,
        service_name: &str,
        service: std::sync::Arc<dyn crate::registry::Service>,
        job: ServiceJob,
        tx: &mpsc::UnboundedSender<Mailbox>,
        monitor: &Monitor,
    ) -> u64 {
        self.seq += 1;
        let invocation = self.seq;
        let token = job.cancel.clone();
        monitor.emit(RecordKind::ServiceStarted {
            state: state_id.to_string(),
            service: service_name.to_string(),
        });

        let tx = tx.clone();
        let run_token = token.clone();
        let handle = tokio::spawn(async move {
            let result = tokio::select! {
                _ = run_token.cancelled() => return,
                result = service.run(job) => result,
            };
            let event = match result {
                Ok(value) => Event {
                    kind: EventKind::ServiceDone { node, invocation },
                    payload: Some(value),
                },
                Err(message) => Event {
                    kind: EventKind::ServiceFailed { node, invocation },
                    payload: Some(Value::String(message)),
                },
            };
            let _ = tx.send(Mailbox::Deliver { event, reply: None });
        });

        self.running.insert(
            node,
            RunningService {
                invocation,
                service_name: service_name.to_string(),
                token,
                handle,
            },
        );
        invocation
    }

    /// Signal cancellation for `node`'s service and retire its invocation,
    /// so a racing completion is dropped at the queue.
    pub fn cancel_state(&mut self, node: NodeId, state_id: &str, monitor: &Monitor) {
        if let Some(running) = self.running.remove(&node) {
            running.token.cancel();
            monitor.emit(RecordKind::ServiceCancelled {
                state: state_id.to_string(),
                service: running.service_name,
            });
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, running) in self.running.drain() {
            running.token.cancel();
            running.handle.abort();
        }
    }

    /// Match a completion event against the live invocation for `node`.
    /// Returns the service name and retires the entry; `None` means the
    /// completion is stale (state exited in the meantime) and must be
    /// dropped.
    pub fn complete(&mut self, node: NodeId, invocation: u64) -> Option<String> {
        let live = self
            .running
            .get(&node)
            .is_some_and(|r| r.invocation == invocation);
        if !live {
            return None;
        }
        self.running.remove(&node).map(|r| r.service_name)
    }
}

impl Drop for ServiceBoard {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
