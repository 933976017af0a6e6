//! The public registry handle and node lifecycle.
//!
//! [`Registry::start`] wires a node together: the shared table, the
//! principal host, the TCP mesh, and the registrar task consuming one
//! mailbox. The handle is cheap to clone (`Arc` internally) and safe to
//! share across tasks.
//!
//! Mutations (`register_name`, `unregister_name`, `set_meta`) round-trip
//! through the registrar's mailbox and therefore serialize with every
//! other state transition. Reads (`whereis_name`, enumeration) go straight
//! to the shared table and never wait on the registrar.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;

use crate::cluster::{Mesh, PeerInfo};
use crate::error::{RegistryError, RegistryResult};
use crate::liveness::{PrincipalHandle, PrincipalHost};
use crate::network::{WireMessage, DEFAULT_PORT};
use crate::registrar::{Event, Registrar};
use crate::table::RegistryTable;
use crate::types::{Meta, Name, NodeId, Principal, PrincipalId};

/// Configuration for a registry node.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// This node's identity. Must be unique in the cluster; its
    /// lexicographic rank is the clash-resolution order.
    pub node: NodeId,
    /// Address to bind for mesh communication.
    pub bind_addr: SocketAddr,
    /// Listen addresses of existing nodes to dial at startup.
    pub seeds: Vec<SocketAddr>,
}

impl RegistryConfig {
    /// Create a config for a node with the given identity.
    pub fn new(node: impl Into<NodeId>) -> Self {
        Self {
            node: node.into(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            seeds: Vec::new(),
        }
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Add a seed address to dial at startup.
    pub fn seed(mut self, addr: SocketAddr) -> Self {
        self.seeds.push(addr);
        self
    }
}

/// Scheduling priority for the registrar task.
///
/// A best-effort knob: tokio's scheduler has no task priorities, so the
/// value is recorded and reported but does not change scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl Priority {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Priority::Low,
            2 => Priority::High,
            _ => Priority::Normal,
        }
    }
}

/// Point-in-time summary of a registry node.
#[derive(Debug, Clone)]
pub struct RegistryStatus {
    /// This node's identity.
    pub node: NodeId,
    /// The mesh listen address, once bound.
    pub address: Option<SocketAddr>,
    /// Number of connected peer registrars.
    pub peer_count: usize,
    /// Total bindings in the table, local and remote.
    pub binding_count: usize,
    /// Bindings owned by this node.
    pub local_count: usize,
    /// Whether the node is running.
    pub is_running: bool,
}

/// A running registry node.
///
/// Cloning is cheap and every clone drives the same node.
#[derive(Clone)]
pub struct Registry {
    node: NodeId,
    table: Arc<RegistryTable>,
    principals: Arc<PrincipalHost>,
    mesh: Arc<Mesh>,
    events: mpsc::UnboundedSender<Event>,
    priority: Arc<AtomicU8>,
    running: Arc<RwLock<bool>>,
}

impl Registry {
    /// Start a registry node: bind the mesh, dial the seeds, and spawn the
    /// registrar task.
    pub async fn start(config: RegistryConfig) -> RegistryResult<Self> {
        let node = config.node;
        let table = Arc::new(RegistryTable::new());
        let principals = Arc::new(PrincipalHost::new(node.clone()));
        let registrar_identity = Principal::new(PrincipalId::fresh(), node.clone());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (mesh_tx, mut mesh_rx) = mpsc::unbounded_channel();
        let (down_tx, mut down_rx) = mpsc::unbounded_channel();

        let mesh = Mesh::new(
            node.clone(),
            registrar_identity,
            config.bind_addr,
            config.seeds,
            mesh_tx,
        );
        let addr = mesh.start().await?;
        info!(node = %node, %addr, "registry node started");

        // Pump mesh events and DOWN notifications into the registrar's
        // mailbox, preserving per-source order.
        let tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = mesh_rx.recv().await {
                if tx.send(Event::Mesh(event)).is_err() {
                    break;
                }
            }
        });
        let tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(down) = down_rx.recv().await {
                if tx.send(Event::Down(down)).is_err() {
                    break;
                }
            }
        });

        let registrar = Registrar::new(
            node.clone(),
            Arc::clone(&table),
            Arc::clone(&principals),
            mesh.clone(),
            down_tx,
        );
        tokio::spawn(registrar.run(event_rx));

        Ok(Self {
            node,
            table,
            principals,
            mesh,
            events: event_tx,
            priority: Arc::new(AtomicU8::new(Priority::Normal as u8)),
            running: Arc::new(RwLock::new(true)),
        })
    }

    /// Stop the node: halt the registrar and tear down every link. The
    /// local table is left intact; peers observe the closed links as this
    /// registrar going down and purge what it owned.
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        if !*running {
            return;
        }
        *running = false;

        let _ = self.events.send(Event::Shutdown);
        self.mesh.shutdown();
        info!(node = %self.node, "registry node stopped");
    }

    /// Whether the node is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// This node's identity.
    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    /// The mesh listen address (resolved when binding to port 0).
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.mesh.local_addr()
    }

    /// Dial another node's listen address.
    pub fn connect(&self, addr: SocketAddr) {
        self.mesh.connect(addr);
    }

    /// Spawn a fresh local principal.
    pub fn spawn_principal(&self) -> PrincipalHandle {
        self.principals.spawn()
    }

    // ── Mutation API (serialized through the registrar) ──────────────────

    /// Register `name` for a local principal. Returns `false` when the
    /// principal lives on another node or the name is already taken
    /// anywhere in the registry.
    pub async fn register_name(
        &self,
        name: impl Into<Name>,
        principal: &Principal,
    ) -> RegistryResult<bool> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.events
            .send(Event::Register {
                name: name.into(),
                principal: principal.clone(),
                reply: reply_tx,
            })
            .map_err(|_| RegistryError::Stopped)?;
        reply_rx.await.map_err(|_| RegistryError::Stopped)
    }

    /// Unregister `name`. Advisory: a missing name or one owned by another
    /// node is left untouched, and the call still succeeds.
    pub async fn unregister_name(&self, name: impl Into<Name>) -> RegistryResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.events
            .send(Event::Unregister {
                name: name.into(),
                reply: reply_tx,
            })
            .map_err(|_| RegistryError::Stopped)?;
        reply_rx.await.map_err(|_| RegistryError::Stopped)
    }

    /// Overwrite the meta attributes of a locally owned binding. Advisory
    /// in the same way as [`Registry::unregister_name`].
    pub async fn set_meta(&self, name: impl Into<Name>, meta: Meta) -> RegistryResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.events
            .send(Event::SetMeta {
                name: name.into(),
                meta,
                reply: reply_tx,
            })
            .map_err(|_| RegistryError::Stopped)?;
        reply_rx.await.map_err(|_| RegistryError::Stopped)
    }

    // ── Read path (no registrar involvement) ─────────────────────────────

    /// The principal bound to `name`, if any.
    pub fn whereis_name(&self, name: impl Into<Name>) -> Option<Principal> {
        self.table.whereis(&name.into())
    }

    /// The meta attributes of the binding for `name`, if any.
    pub fn meta_of(&self, name: impl Into<Name>) -> Option<Meta> {
        self.table.meta_of(&name.into())
    }

    /// Deliver a payload to whatever `name` currently resolves to: a local
    /// principal's mailbox, or a forward over the mesh to the principal's
    /// home node. Silently dropped on a missing name or dead principal.
    pub fn send(&self, name: impl Into<Name>, payload: JsonValue) {
        let principal = match self.table.whereis(&name.into()) {
            Some(principal) => principal,
            None => return,
        };
        if principal.is_local_to(&self.node) {
            let _ = self.principals.deliver(&principal, payload);
        } else {
            use crate::cluster::Transport;
            let home = principal.home().clone();
            self.mesh
                .send_to(&home, WireMessage::Forward { principal, payload });
        }
    }

    /// Names of the bindings this node owns.
    pub fn local_registered_names(&self) -> Vec<Name> {
        self.table.local_names()
    }

    /// `(name, principal, meta)` for the bindings this node owns.
    pub fn local_registered_info(&self) -> Vec<(Name, Principal, Meta)> {
        self.table.local_info()
    }

    /// All known names, local and remote.
    pub fn registered_names(&self) -> Vec<Name> {
        self.table.names()
    }

    /// All known `(name, principal)` pairs.
    pub fn registered_info(&self) -> Vec<(Name, Principal)> {
        self.table.info()
    }

    // ── Introspection ────────────────────────────────────────────────────

    /// Set the registrar's scheduling priority, returning the previous
    /// value. Best-effort; see [`Priority`].
    pub fn set_priority(&self, priority: Priority) -> Priority {
        Priority::from_u8(self.priority.swap(priority as u8, Ordering::Relaxed))
    }

    /// The current registrar priority.
    pub fn priority(&self) -> Priority {
        Priority::from_u8(self.priority.load(Ordering::Relaxed))
    }

    /// Currently connected peers.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.mesh.peers()
    }

    /// A point-in-time summary of this node.
    pub async fn status(&self) -> RegistryStatus {
        RegistryStatus {
            node: self.node.clone(),
            address: self.mesh.local_addr(),
            peer_count: self.mesh.peers().len(),
            binding_count: self.table.len(),
            local_count: self.table.local_names().len(),
            is_running: *self.running.read().await,
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("node", &self.node)
            .field("bindings", &self.table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback_config(node: &str) -> RegistryConfig {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0);
        RegistryConfig::new(node).bind_addr(addr)
    }

    #[test]
    fn config_builder() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9000);
        let seed = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9001);
        let config = RegistryConfig::new("a").bind_addr(addr).seed(seed);

        assert_eq!(config.node, NodeId::from("a"));
        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.seeds, vec![seed]);
    }

    #[test]
    fn config_defaults_to_well_known_port() {
        let config = RegistryConfig::new("a");
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert!(config.seeds.is_empty());
    }

    #[tokio::test]
    async fn start_and_stop() {
        let registry = Registry::start(loopback_config("a")).await.unwrap();
        assert!(registry.is_running().await);
        assert!(registry.listen_addr().is_some());

        registry.stop().await;
        assert!(!registry.is_running().await);
    }

    #[tokio::test]
    async fn api_after_stop_errors() {
        let registry = Registry::start(loopback_config("a")).await.unwrap();
        let handle = registry.spawn_principal();
        registry.stop().await;

        // Give the registrar a moment to drain its mailbox and exit.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let result = registry.register_name("x", handle.principal()).await;
        assert!(matches!(result, Err(RegistryError::Stopped)));
    }

    #[tokio::test]
    async fn priority_is_recorded() {
        let registry = Registry::start(loopback_config("a")).await.unwrap();
        assert_eq!(registry.priority(), Priority::Normal);
        assert_eq!(registry.set_priority(Priority::High), Priority::Normal);
        assert_eq!(registry.priority(), Priority::High);
        registry.stop().await;
    }
}
