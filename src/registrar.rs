//! The registrar: one task per node, one mailbox, every state transition.
//!
//! All mutations of registry state - API calls, inbound peer
//! notifications, liveness DOWNs, membership events - are serialized
//! through this single message loop, processed strictly in arrival order.
//! Every handler is non-blocking: table mutation, broadcast enqueue, and
//! monitor install/remove all complete before the next message is taken.
//! The loop suspends only while waiting on its mailbox.
//!
//! Reads never come through here; they go straight to the shared table.
//!
//! # Convergence
//!
//! A node only ever authoritatively mutates bindings it owns; everything
//! remote arrives by notification. Concurrent registrations of one name on
//! different nodes ("clashes") are resolved without negotiation: every
//! node applies the same total order on node identities to the same pair
//! of bindings, and the loser's home node terminates its own principal.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::cluster::{MeshEvent, Transport};
use crate::liveness::{Down, DownSink, PrincipalHost};
use crate::network::{SyncEntry, WireMessage};
use crate::table::RegistryTable;
use crate::types::{Binding, Meta, MonitorRef, Name, NodeId, Origin, Principal};

/// Mailbox items processed by the registrar, strictly in order.
pub(crate) enum Event {
    Register {
        name: Name,
        principal: Principal,
        reply: oneshot::Sender<bool>,
    },
    Unregister {
        name: Name,
        reply: oneshot::Sender<()>,
    },
    SetMeta {
        name: Name,
        meta: Meta,
        reply: oneshot::Sender<()>,
    },
    Mesh(MeshEvent),
    Down(Down),
    Shutdown,
}

pub(crate) struct Registrar {
    node: NodeId,
    table: Arc<RegistryTable>,
    principals: Arc<PrincipalHost>,
    transport: Arc<dyn Transport>,
    /// Connected peer registrars, each tracked by a link monitor.
    peers: HashMap<NodeId, MonitorRef>,
    /// Sink handed to every monitor this registrar installs.
    down_tx: DownSink,
}

impl Registrar {
    pub(crate) fn new(
        node: NodeId,
        table: Arc<RegistryTable>,
        principals: Arc<PrincipalHost>,
        transport: Arc<dyn Transport>,
        down_tx: DownSink,
    ) -> Self {
        Self {
            node,
            table,
            principals,
            transport,
            peers: HashMap::new(),
            down_tx,
        }
    }

    /// The message loop. Runs until `Shutdown` or until every sender is
    /// gone.
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            match event {
                Event::Register {
                    name,
                    principal,
                    reply,
                } => {
                    let accepted = self.register(name, principal);
                    let _ = reply.send(accepted);
                }
                Event::Unregister { name, reply } => {
                    self.unregister(&name);
                    let _ = reply.send(());
                }
                Event::SetMeta { name, meta, reply } => {
                    self.set_meta(&name, meta);
                    let _ = reply.send(());
                }
                Event::Mesh(mesh_event) => self.handle_mesh(mesh_event),
                Event::Down(down) => self.handle_down(down),
                Event::Shutdown => break,
            }
        }
        debug!(node = %self.node, "registrar stopped");
    }

    // ── Mutation API ─────────────────────────────────────────────────────

    fn register(&mut self, name: Name, principal: Principal) -> bool {
        if !principal.is_local_to(&self.node) {
            debug!(%name, %principal, "rejecting registration of non-local principal");
            return false;
        }
        if self.table.contains(&name) {
            debug!(%name, "rejecting registration, name taken");
            return false;
        }

        let monitor = self.principals.monitor(&principal, self.down_tx.clone());
        self.table
            .insert(Binding::local(name.clone(), principal.clone(), monitor));
        self.broadcast(WireMessage::RegisterNotify {
            from: self.node.clone(),
            name,
            principal,
            meta: None,
        });
        true
    }

    fn unregister(&mut self, name: &Name) {
        let binding = match self.table.get(name) {
            Some(binding) if binding.origin.is_local() => binding,
            // Missing or remote: advisory no-op, the home node is the
            // authority.
            _ => return,
        };

        if let Some(monitor) = binding.monitor {
            self.principals.demonitor(&monitor);
            self.table.take_monitor(&monitor);
        }
        self.table.remove(name);
        self.broadcast(WireMessage::UnregisterNotify {
            from: self.node.clone(),
            name: name.clone(),
        });
    }

    fn set_meta(&mut self, name: &Name, meta: Meta) {
        match self.table.get(name) {
            Some(binding) if binding.origin.is_local() => {}
            _ => return,
        }

        self.table.update_meta(name, meta.clone());
        self.broadcast(WireMessage::MetaNotify {
            from: self.node.clone(),
            name: name.clone(),
            meta,
        });
    }

    fn broadcast(&self, message: WireMessage) {
        for peer in self.peers.keys() {
            self.transport.send_to(peer, message.clone());
        }
    }

    // ── Membership ───────────────────────────────────────────────────────

    fn handle_mesh(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::NodeUp(node) => {
                info!(peer = %node, "node up, requesting sync");
                self.transport.send_to(
                    &node,
                    WireMessage::SyncReq {
                        from: self.node.clone(),
                    },
                );
            }
            MeshEvent::NodeDown(node) => {
                // Cleanup belongs to the link-monitor DOWN; acting here too
                // would double-schedule the purge.
                debug!(peer = %node, "node down");
            }
            MeshEvent::Message { from, message } => self.handle_peer(from, message),
        }
    }

    // ── Inbound peer messages ────────────────────────────────────────────

    fn handle_peer(&mut self, from: NodeId, message: WireMessage) {
        match message {
            WireMessage::SyncReq { .. } => {
                let bindings = self
                    .table
                    .local_info()
                    .into_iter()
                    .map(|(name, principal, meta)| SyncEntry {
                        name,
                        principal,
                        meta,
                    })
                    .collect();
                self.transport.send_to(
                    &from,
                    WireMessage::SyncResp {
                        from: self.node.clone(),
                        bindings,
                    },
                );
                // Close the handshake: if we did not know this peer yet,
                // ask for its bindings too, so both sides converge even if
                // one missed the node-up edge.
                if self.add_peer(&from) {
                    self.transport.send_to(
                        &from,
                        WireMessage::SyncReq {
                            from: self.node.clone(),
                        },
                    );
                }
            }

            WireMessage::SyncResp { bindings, .. } => {
                self.add_peer(&from);
                debug!(peer = %from, entries = bindings.len(), "applying sync snapshot");
                for entry in bindings {
                    self.apply_registration(&from, entry.name, entry.principal, Some(entry.meta));
                }
            }

            WireMessage::RegisterNotify {
                name,
                principal,
                meta,
                ..
            } => {
                if !self.known_peer(&from, "register_notify") {
                    return;
                }
                self.apply_registration(&from, name, principal, meta);
            }

            WireMessage::UnregisterNotify { name, .. } => {
                if !self.known_peer(&from, "unregister_notify") {
                    return;
                }
                if let Some(binding) = self.table.get(&name) {
                    // Only the owning node may remove a binding; a stale
                    // notify about someone else's (or our own) name is
                    // ignored.
                    if binding.origin == Origin::Remote(from.clone()) {
                        self.table.remove(&name);
                        trace!(%name, peer = %from, "binding unregistered by owner");
                    }
                }
            }

            WireMessage::MetaNotify { name, meta, .. } => {
                if !self.known_peer(&from, "meta_notify") {
                    return;
                }
                if let Some(binding) = self.table.get(&name) {
                    if binding.origin == Origin::Remote(from.clone()) {
                        self.table.update_meta(&name, meta);
                    }
                }
            }

            WireMessage::Forward { principal, payload } => {
                if principal.is_local_to(&self.node) {
                    if !self.principals.deliver(&principal, payload) {
                        trace!(%principal, "forward dropped, principal gone");
                    }
                } else {
                    trace!(%principal, "forward dropped, principal not hosted here");
                }
            }

            WireMessage::Hello { .. } => {
                warn!(peer = %from, "unexpected hello after handshake, dropped");
            }
        }
    }

    fn known_peer(&self, from: &NodeId, what: &str) -> bool {
        if self.peers.contains_key(from) {
            return true;
        }
        // A stray late message from a disconnected peer must not
        // re-corrupt state before its DOWN is processed.
        warn!(peer = %from, message = what, "notification from unknown peer dropped");
        false
    }

    /// Add `node` to the peer set with a link monitor. Returns true when
    /// the peer was newly added.
    fn add_peer(&mut self, node: &NodeId) -> bool {
        if self.peers.contains_key(node) {
            return false;
        }
        let monitor = self.transport.monitor(node, self.down_tx.clone());
        self.peers.insert(node.clone(), monitor);
        info!(peer = %node, "peer added");
        true
    }

    // ── Registration application and clash resolution ────────────────────

    fn apply_registration(
        &mut self,
        from: &NodeId,
        name: Name,
        principal: Principal,
        meta: Option<Meta>,
    ) {
        match self.table.get(&name) {
            None => {
                self.table.insert(Binding::remote(
                    name,
                    principal,
                    from.clone(),
                    meta.unwrap_or_default(),
                ));
            }
            Some(existing) if existing.principal == principal => {
                // Duplicate announcement (e.g. sync overlapping a notify).
            }
            Some(existing) => {
                self.resolve_clash(existing, name, principal, meta.unwrap_or_default())
            }
        }
    }

    /// Two nodes registered `name` concurrently. The binding whose home
    /// node sorts first in the cluster total order wins; every node
    /// reaches the same verdict independently.
    fn resolve_clash(&mut self, existing: Binding, name: Name, incoming: Principal, meta: Meta) {
        let n_new = incoming.home().clone();
        let n_old = existing.principal.home().clone();

        if n_new < n_old {
            warn!(%name, winner = %n_new, loser = %n_old, "name clash, overwriting binding");
            self.table
                .insert(Binding::remote(name, incoming, n_new, meta));
            if n_old == self.node {
                // The losing side is our own principal: terminate it.
                // The binding and reverse index are not touched here; the
                // DOWN of the terminated principal finishes the
                // bookkeeping and must tolerate the overwritten binding.
                self.principals.kill(&existing.principal);
            }
        } else {
            // The winning side reaches the same verdict on its own and
            // broadcasts; nothing to send back.
            debug!(%name, kept = %n_old, dropped = %n_new, "name clash, keeping existing binding");
        }
    }

    // ── DOWN handling ────────────────────────────────────────────────────

    fn handle_down(&mut self, down: Down) {
        if let Some(node) = self.peer_for(&down.reference) {
            self.drop_peer(&node);
            return;
        }
        self.principal_down(down);
    }

    fn peer_for(&self, reference: &MonitorRef) -> Option<NodeId> {
        self.peers
            .iter()
            .find(|(_, monitor)| *monitor == reference)
            .map(|(node, _)| node.clone())
    }

    /// A peer registrar went down: forget it and purge everything it
    /// owned, before any further message is processed.
    fn drop_peer(&mut self, node: &NodeId) {
        self.peers.remove(node);
        let purged = self.table.purge_origin(node);
        info!(peer = %node, purged, "peer down, purged its bindings");

        if self.transport.is_connected(node) {
            // The link flapped and was already re-established before this
            // DOWN was processed; restart the handshake on the fresh link
            // or the purge would leave both sides out of sync.
            self.transport.send_to(
                node,
                WireMessage::SyncReq {
                    from: self.node.clone(),
                },
            );
        }
    }

    /// A monitored local principal terminated.
    fn principal_down(&mut self, down: Down) {
        let name = match self.table.take_monitor(&down.reference) {
            Some(name) => name,
            None => {
                // Already demonitored (normal unregister raced the DOWN).
                trace!(reference = %down.reference, "down for retired monitor");
                return;
            }
        };

        if let Some(binding) = self.table.get(&name) {
            if binding.monitor == Some(down.reference) && binding.principal == down.principal {
                self.table.remove(&name);
                debug!(%name, principal = %down.principal, "principal down, name unregistered");
                self.broadcast(WireMessage::UnregisterNotify {
                    from: self.node.clone(),
                    name,
                });
            } else {
                // A clash win from remote raced ahead and overwrote the
                // binding; the reverse entry was all that remained.
                trace!(%name, "down for overwritten binding, nothing to do");
            }
        }
    }
}
