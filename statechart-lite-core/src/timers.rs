//! `after` timers tied to state occupancy (C7).
//!
//! Arming spawns a sleep task that posts a synthetic fire event back onto
//! the owning machine's queue. Cancellation happens synchronously during
//! the exit phase, before exit actions run; a fire that already made it
//! into the queue is filtered out at processing time when the owning node
//! is no longer entered.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::compiler::{StateGraph, Trigger};
use crate::machine::Mailbox;
use crate::monitor::{Monitor, RecordKind};
use crate::types::{Event, EventKind, NodeId};

pub(crate) struct TimerBoard {
    handles: HashMap<(NodeId, String), JoinHandle<()>>,
}

impl TimerBoard {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
        }
    }

    /// Arm every `after` entry declared on `node`.
    pub fn arm_state(
        &mut self,
        graph: &StateGraph,
        node: NodeId,
        tx: &mpsc::UnboundedSender<Mailbox>,
        monitor: &Monitor,
    ) {
        let state_id = &graph.nodes[node].id;
        for t in &graph.nodes[node].transitions {
            let Trigger::After { delay_ms, timer_id } = &t.trigger else {
                continue;
            };
            let key = (node, timer_id.clone());
            if self.handles.contains_key(&key) {
                // One timer per after-entry; guard chains share it.
                continue;
            }
            monitor.emit(RecordKind::TimerArmed {
                state: state_id.clone(),
                timer: timer_id.clone(),
                delay_ms: *delay_ms,
            });
            let tx = tx.clone();
            let delay = Duration::from_millis(*delay_ms);
            let fire_timer_id = timer_id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let event = Event {
                    kind: EventKind::TimerFired {
                        node,
                        timer_id: fire_timer_id,
                    },
                    payload: None,
                };
                let _ = tx.send(Mailbox::Deliver { event, reply: None });
            });
            self.handles.insert(key, handle);
        }
    }

    /// Abort every timer owned by `node`. Runs before the node's exit
    /// actions observe its absence.
    pub fn cancel_state(&mut self, graph: &StateGraph, node: NodeId, monitor: &Monitor) {
        let owned: Vec<(NodeId, String)> = self
            .handles
            .keys()
            .filter(|(n, _)| *n == node)
            .cloned()
            .collect();
        for key in owned {
            if let Some(handle) = self.handles.remove(&key) {
                handle.abort();
                monitor.emit(RecordKind::TimerCancelled {
                    state: graph.nodes[node].id.clone(),
                    timer: key.1,
                });
            }
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }
}

impl Drop for TimerBoard {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
