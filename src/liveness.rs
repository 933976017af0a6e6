//! Local principals and the liveness-monitoring primitive.
//!
//! A principal is a live actor-like entity: it owns an unbounded JSON
//! mailbox and dies either on its own (handle dropped or `exit()`) or
//! forcibly (`kill`, used by clash resolution). The [`PrincipalHost`]
//! owns every live principal on a node and implements the monitor
//! primitive: `monitor(principal, sink)` returns a [`MonitorRef`], and
//! termination posts a [`Down`] notification to every watcher sink.
//!
//! Monitoring an already-dead principal fires immediately with
//! [`DownReason::NoProcess`], so callers never have to check liveness
//! before installing a monitor.
//!
//! The same [`Down`] type is reused by the cluster mesh for remote
//! registrar liveness (reason [`DownReason::Disconnected`]); both sources
//! funnel into the registrar's mailbox through one channel.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::trace;

use crate::types::{MonitorRef, NodeId, Principal, PrincipalId};

/// Why a DOWN notification fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownReason {
    /// The principal terminated on its own.
    Exited,
    /// The principal was forcibly terminated.
    Killed,
    /// The principal was already dead when the monitor was installed.
    NoProcess,
    /// The link to the principal's node was lost.
    Disconnected,
}

/// Delivered to every watcher when a monitored principal terminates.
#[derive(Debug, Clone)]
pub struct Down {
    /// The monitor that fired.
    pub reference: MonitorRef,
    /// The principal that went down.
    pub principal: Principal,
    /// Why it went down.
    pub reason: DownReason,
}

/// Sink that monitors deliver DOWN notifications to.
pub type DownSink = mpsc::UnboundedSender<Down>;

struct Cell {
    mailbox: mpsc::UnboundedSender<JsonValue>,
    watchers: Vec<(MonitorRef, DownSink)>,
}

/// Owns every live local principal on a node.
pub struct PrincipalHost {
    node: NodeId,
    cells: DashMap<PrincipalId, Cell>,
    /// Monitor reference -> watched principal, for demonitor.
    monitors: DashMap<MonitorRef, PrincipalId>,
}

impl PrincipalHost {
    /// Create a host for principals living on `node`.
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            cells: DashMap::new(),
            monitors: DashMap::new(),
        }
    }

    /// The node these principals live on.
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Spawn a fresh principal and hand back its receiving half.
    pub fn spawn(self: &Arc<Self>) -> PrincipalHandle {
        let id = PrincipalId::fresh();
        let (tx, rx) = mpsc::unbounded_channel();
        self.cells.insert(
            id,
            Cell {
                mailbox: tx,
                watchers: Vec::new(),
            },
        );
        PrincipalHandle {
            principal: Principal::new(id, self.node.clone()),
            host: Arc::clone(self),
            inbox: rx,
        }
    }

    /// Whether the principal is still alive on this host.
    pub fn alive(&self, id: &PrincipalId) -> bool {
        self.cells.contains_key(id)
    }

    /// Number of live principals.
    pub fn live_count(&self) -> usize {
        self.cells.len()
    }

    /// Install a liveness monitor on `principal`. If the principal is
    /// already dead, a DOWN with [`DownReason::NoProcess`] is delivered
    /// immediately.
    pub fn monitor(&self, principal: &Principal, sink: DownSink) -> MonitorRef {
        let reference = MonitorRef::fresh();
        match self.cells.get_mut(&principal.id()) {
            Some(mut cell) => {
                cell.watchers.push((reference, sink));
                self.monitors.insert(reference, principal.id());
            }
            None => {
                let _ = sink.send(Down {
                    reference,
                    principal: principal.clone(),
                    reason: DownReason::NoProcess,
                });
            }
        }
        reference
    }

    /// Cancel a monitor. A DOWN already in flight may still be delivered;
    /// receivers key off the reverse index to tolerate that.
    pub fn demonitor(&self, reference: &MonitorRef) {
        if let Some((_, id)) = self.monitors.remove(reference) {
            if let Some(mut cell) = self.cells.get_mut(&id) {
                cell.watchers.retain(|(r, _)| r != reference);
            }
        }
    }

    /// Deliver a payload to a local principal's mailbox. Returns false
    /// (and drops the payload) when the principal is gone.
    pub fn deliver(&self, principal: &Principal, payload: JsonValue) -> bool {
        match self.cells.get(&principal.id()) {
            Some(cell) => cell.mailbox.send(payload).is_ok(),
            None => false,
        }
    }

    /// Forcibly terminate a principal, firing DOWN to all watchers.
    pub fn kill(&self, principal: &Principal) {
        self.terminate(principal, DownReason::Killed);
    }

    fn terminate(&self, principal: &Principal, reason: DownReason) {
        if let Some((_, cell)) = self.cells.remove(&principal.id()) {
            trace!(principal = %principal, ?reason, "principal terminated");
            for (reference, sink) in cell.watchers {
                self.monitors.remove(&reference);
                let _ = sink.send(Down {
                    reference,
                    principal: principal.clone(),
                    reason,
                });
            }
        }
    }
}

impl std::fmt::Debug for PrincipalHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrincipalHost")
            .field("node", &self.node)
            .field("live", &self.cells.len())
            .finish()
    }
}

/// Receiving half of a local principal: its mailbox plus termination
/// control. Dropping the handle terminates the principal.
pub struct PrincipalHandle {
    principal: Principal,
    host: Arc<PrincipalHost>,
    inbox: mpsc::UnboundedReceiver<JsonValue>,
}

impl PrincipalHandle {
    /// The principal this handle controls.
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Receive the next payload. Returns `None` once the principal has
    /// been terminated (e.g. killed by clash resolution) and the mailbox
    /// is drained.
    pub async fn recv(&mut self) -> Option<JsonValue> {
        self.inbox.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<JsonValue> {
        self.inbox.try_recv().ok()
    }

    /// Whether the principal is still alive.
    pub fn is_alive(&self) -> bool {
        self.host.alive(&self.principal.id())
    }

    /// Terminate this principal. Equivalent to dropping the handle.
    pub fn exit(self) {}
}

impl Drop for PrincipalHandle {
    fn drop(&mut self) {
        self.host.terminate(&self.principal, DownReason::Exited);
    }
}

impl std::fmt::Debug for PrincipalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrincipalHandle")
            .field("principal", &self.principal)
            .finish()
    }
}
