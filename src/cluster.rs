//! Peer mesh for the registry cluster.
//!
//! Maintains one full-duplex TCP link per peer pair and turns link
//! lifecycle into the two signals the registrar consumes:
//!
//! - Membership events ([`MeshEvent::NodeUp`] / [`MeshEvent::NodeDown`])
//!   whenever a link is established or lost.
//! - Liveness DOWNs for installed link monitors, delivered through the
//!   same [`Down`] channel local principal monitors use.
//!
//! # Link protocol
//!
//! The dialer sends `hello{node, listen_addr, registrar}` as its first
//! frame; the acceptor replies with its own hello. After the exchange the
//! connection splits into a reader task (frames become
//! [`MeshEvent::Message`]) and a writer task draining a per-link unbounded
//! queue, which is what gives per-pair FIFO delivery. Sends are
//! best-effort: no acknowledgement, loss is absorbed by the registrar's
//! DOWN-plus-resync cycle.
//!
//! Crossed dials (both sides connecting simultaneously) are resolved
//! without negotiation: the connection dialed by the node that sorts
//! first in the cluster total order wins on both sides.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::liveness::{Down, DownReason, DownSink};
use crate::network::{Connection, Listener, WireMessage};
use crate::types::{MonitorRef, NodeId, Principal, PrincipalId};

/// Delay between dial attempts.
const DIAL_RETRY: Duration = Duration::from_millis(500);

/// How often a seed address is retried before giving up.
const SEED_DIAL_ATTEMPTS: u32 = 20;

/// How often an explicit `connect` is retried before giving up.
const CONNECT_ATTEMPTS: u32 = 5;

/// Cluster transport as seen by the registrar.
///
/// [`Mesh`] is the TCP implementation; anything providing per-pair FIFO
/// delivery, membership events, and link-loss DOWN signals can stand in.
pub trait Transport: Send + Sync {
    /// This node's identity.
    fn local_node(&self) -> &NodeId;

    /// Best-effort enqueue to a peer; silently dropped when no live link
    /// exists.
    fn send_to(&self, to: &NodeId, message: WireMessage);

    /// Watch the remote registrar behind `node`. Fires immediately with
    /// [`DownReason::Disconnected`] when the link is already gone.
    fn monitor(&self, node: &NodeId, sink: DownSink) -> MonitorRef;

    /// Cancel a link monitor.
    fn demonitor(&self, reference: &MonitorRef);

    /// Whether a live link to `node` exists right now.
    fn is_connected(&self, node: &NodeId) -> bool;
}

/// Membership and message events emitted by the mesh.
#[derive(Debug)]
pub enum MeshEvent {
    /// A link to `NodeId` was established.
    NodeUp(NodeId),
    /// The link to `NodeId` was lost.
    NodeDown(NodeId),
    /// A frame arrived from a connected peer.
    Message { from: NodeId, message: WireMessage },
}

/// Information about a connected peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// The peer's node identity.
    pub node: NodeId,
    /// The peer's advertised listen address.
    pub address: SocketAddr,
    /// When the current link came up.
    pub connected_at: DateTime<Utc>,
}

struct Link {
    tx: mpsc::UnboundedSender<WireMessage>,
    address: SocketAddr,
    registrar: Principal,
    connected_at: DateTime<Utc>,
    /// Which side dialed this connection (crossed-dial tie-break).
    dialer: NodeId,
    /// Distinguishes this connection from its replacements during
    /// teardown.
    generation: u64,
}

/// The TCP mesh: listener, per-peer links, link monitors.
pub struct Mesh {
    node: NodeId,
    /// This registrar's principal identity, advertised in hellos.
    registrar: Principal,
    bind_addr: SocketAddr,
    seeds: Vec<SocketAddr>,
    links: DashMap<NodeId, Link>,
    watchers: DashMap<NodeId, Vec<(MonitorRef, DownSink)>>,
    monitor_index: DashMap<MonitorRef, NodeId>,
    events: mpsc::UnboundedSender<MeshEvent>,
    listen_addr: RwLock<Option<SocketAddr>>,
    shutdown_tx: broadcast::Sender<()>,
    generation: AtomicU64,
}

impl Mesh {
    /// Create a mesh for `node`, reporting events to `events`.
    pub fn new(
        node: NodeId,
        registrar: Principal,
        bind_addr: SocketAddr,
        seeds: Vec<SocketAddr>,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            node,
            registrar,
            bind_addr,
            seeds,
            links: DashMap::new(),
            watchers: DashMap::new(),
            monitor_index: DashMap::new(),
            events,
            listen_addr: RwLock::new(None),
            shutdown_tx,
            generation: AtomicU64::new(0),
        })
    }

    /// Bind the listener, spawn the accept loop, and start dialing seeds.
    /// Returns the actual bound address (resolved when binding port 0).
    pub async fn start(self: &Arc<Self>) -> RegistryResult<SocketAddr> {
        let listener = Listener::bind(self.bind_addr).await?;
        let actual = listener.local_addr();
        {
            let mut guard = self.listen_addr.write().await;
            *guard = Some(actual);
        }

        let mesh = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        if let Ok(conn) = result {
                            let mesh = Arc::clone(&mesh);
                            tokio::spawn(async move {
                                if let Err(e) = mesh.handshake_in(conn).await {
                                    debug!("inbound handshake failed: {}", e);
                                }
                            });
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        for seed in self.seeds.clone() {
            let mesh = Arc::clone(self);
            tokio::spawn(mesh.dial(seed, SEED_DIAL_ATTEMPTS));
        }

        Ok(actual)
    }

    /// The bound listen address, once `start` has completed.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.listen_addr.try_read() {
            Ok(guard) => *guard,
            Err(_) => None,
        }
    }

    /// Dial a peer's listen address in the background.
    pub fn connect(self: &Arc<Self>, addr: SocketAddr) {
        let mesh = Arc::clone(self);
        tokio::spawn(mesh.dial(addr, CONNECT_ATTEMPTS));
    }

    /// Stop the mesh: close the listener, drop all links. Peers observe
    /// the closed sockets as link loss.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.links.clear();
    }

    /// All currently connected peers.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.links
            .iter()
            .map(|entry| PeerInfo {
                node: entry.key().clone(),
                address: entry.value().address,
                connected_at: entry.value().connected_at,
            })
            .collect()
    }

    fn hello(&self) -> WireMessage {
        WireMessage::Hello {
            node: self.node.clone(),
            listen_addr: self.local_addr().unwrap_or(self.bind_addr),
            registrar: self.registrar.clone(),
        }
    }

    async fn dial(self: Arc<Self>, addr: SocketAddr, attempts: u32) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        for attempt in 1..=attempts {
            match Connection::connect(addr).await {
                Ok(conn) => match self.handshake_out(conn).await {
                    Ok(()) => return,
                    Err(e) => debug!(%addr, attempt, "outbound handshake failed: {}", e),
                },
                Err(e) => trace!(%addr, attempt, "dial failed: {}", e),
            }
            tokio::select! {
                _ = sleep(DIAL_RETRY) => {}
                _ = shutdown_rx.recv() => return,
            }
        }
        warn!(%addr, "giving up dialing after {} attempts", attempts);
    }

    async fn handshake_out(self: &Arc<Self>, mut conn: Connection) -> RegistryResult<()> {
        conn.send(&self.hello()).await?;
        match conn.receive().await? {
            WireMessage::Hello {
                node,
                listen_addr,
                registrar,
            } => {
                self.install_link(conn, node, listen_addr, registrar, self.node.clone());
                Ok(())
            }
            other => Err(RegistryError::Network(format!(
                "expected hello, got {:?}",
                other
            ))),
        }
    }

    async fn handshake_in(self: &Arc<Self>, mut conn: Connection) -> RegistryResult<()> {
        match conn.receive().await? {
            WireMessage::Hello {
                node,
                listen_addr,
                registrar,
            } => {
                conn.send(&self.hello()).await?;
                let dialer = node.clone();
                self.install_link(conn, node, listen_addr, registrar, dialer);
                Ok(())
            }
            other => Err(RegistryError::Network(format!(
                "expected hello, got {:?}",
                other
            ))),
        }
    }

    /// Register a freshly handshaken connection and spawn its reader and
    /// writer tasks.
    fn install_link(
        self: &Arc<Self>,
        conn: Connection,
        peer: NodeId,
        address: SocketAddr,
        registrar: Principal,
        dialer: NodeId,
    ) {
        if peer == self.node {
            debug!("ignoring connection to self");
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();
        let link = Link {
            tx,
            address,
            registrar,
            connected_at: Utc::now(),
            dialer: dialer.clone(),
            generation,
        };

        let replaced = match self.links.entry(peer.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                // Same dialer means a reconnect: always replace. Otherwise
                // the crossed dial from the smaller node wins.
                let replace =
                    occupied.get().dialer == dialer || dialer < occupied.get().dialer;
                if !replace {
                    debug!(peer = %peer, "dropping crossed dial, existing link wins");
                    return;
                }
                Some(occupied.insert(link))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(link);
                None
            }
        };
        let was_known = replaced.is_some();

        // A replaced connection never reaches its own teardown (the
        // generation no longer matches), so retire its monitors here: the
        // registrar reacts to the DOWN by purging and resyncing over the
        // fresh link.
        if let Some(old) = replaced {
            self.fire_watchers(&peer, &old.registrar);
        }

        let (mut reader, mut writer) = conn.into_split();

        let mesh = Arc::clone(self);
        let writer_peer = peer.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = rx.recv() => match message {
                        Some(message) => {
                            if let Err(e) = writer.send(&message).await {
                                trace!(peer = %writer_peer, "link write failed: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            mesh.teardown(&writer_peer, generation);
        });

        let mesh = Arc::clone(self);
        let reader_peer = peer.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = reader.receive() => match frame {
                        Ok(message) => {
                            let event = MeshEvent::Message {
                                from: reader_peer.clone(),
                                message,
                            };
                            if mesh.events.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            trace!(peer = %reader_peer, "link read failed: {}", e);
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            mesh.teardown(&reader_peer, generation);
        });

        if !was_known {
            info!(peer = %peer, %address, "link established");
            let _ = self.events.send(MeshEvent::NodeUp(peer));
        }
    }

    /// Drop a dead link and fire its monitors. Both the reader and writer
    /// task call this; the generation check makes the second call (and any
    /// call for an already-replaced connection) a no-op.
    fn teardown(&self, peer: &NodeId, generation: u64) {
        let removed = self
            .links
            .remove_if(peer, |_, link| link.generation == generation);
        if let Some((_, link)) = removed {
            debug!(peer = %peer, "link lost");
            self.fire_watchers(peer, &link.registrar);
            let _ = self.events.send(MeshEvent::NodeDown(peer.clone()));
        }
    }

    /// Fire and clear every monitor watching `peer`.
    fn fire_watchers(&self, peer: &NodeId, registrar: &Principal) {
        if let Some((_, watchers)) = self.watchers.remove(peer) {
            for (reference, sink) in watchers {
                self.monitor_index.remove(&reference);
                let _ = sink.send(Down {
                    reference,
                    principal: registrar.clone(),
                    reason: DownReason::Disconnected,
                });
            }
        }
    }
}

impl Transport for Mesh {
    fn local_node(&self) -> &NodeId {
        &self.node
    }

    fn send_to(&self, to: &NodeId, message: WireMessage) {
        match self.links.get(to) {
            Some(link) => {
                if link.tx.send(message).is_err() {
                    trace!(peer = %to, "link closed, message dropped");
                }
            }
            None => trace!(peer = %to, "no link, message dropped"),
        }
    }

    fn monitor(&self, node: &NodeId, sink: DownSink) -> MonitorRef {
        let reference = MonitorRef::fresh();
        if self.links.contains_key(node) {
            self.watchers
                .entry(node.clone())
                .or_default()
                .push((reference, sink));
            self.monitor_index.insert(reference, node.clone());

            // The link may have died between the check and the insert; the
            // teardown that raced us already fired every watcher it saw, so
            // fire ours manually if it is still registered.
            if !self.links.contains_key(node) {
                if let Some(mut watchers) = self.watchers.get_mut(node) {
                    if let Some(pos) = watchers.iter().position(|(r, _)| *r == reference) {
                        let (reference, sink) = watchers.remove(pos);
                        self.monitor_index.remove(&reference);
                        let _ = sink.send(Down {
                            reference,
                            principal: Principal::new(PrincipalId::nil(), node.clone()),
                            reason: DownReason::Disconnected,
                        });
                    }
                }
            }
        } else {
            let _ = sink.send(Down {
                reference,
                principal: Principal::new(PrincipalId::nil(), node.clone()),
                reason: DownReason::Disconnected,
            });
        }
        reference
    }

    fn demonitor(&self, reference: &MonitorRef) {
        if let Some((_, node)) = self.monitor_index.remove(reference) {
            if let Some(mut watchers) = self.watchers.get_mut(&node) {
                watchers.retain(|(r, _)| r != reference);
            }
        }
    }

    fn is_connected(&self, node: &NodeId) -> bool {
        self.links.contains_key(node)
    }
}

impl std::fmt::Debug for Mesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mesh")
            .field("node", &self.node)
            .field("links", &self.links.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0)
    }

    fn registrar_principal(node: &str) -> Principal {
        Principal::new(PrincipalId::fresh(), NodeId::from(node))
    }

    async fn expect_node_up(rx: &mut mpsc::UnboundedReceiver<MeshEvent>) -> NodeId {
        loop {
            match timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
                MeshEvent::NodeUp(node) => return node,
                other => panic!("expected node-up, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn handshake_raises_node_up_on_both_sides() {
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();

        let a = Mesh::new(
            NodeId::from("a"),
            registrar_principal("a"),
            loopback(),
            Vec::new(),
            a_tx,
        );
        let addr_a = a.start().await.unwrap();

        let b = Mesh::new(
            NodeId::from("b"),
            registrar_principal("b"),
            loopback(),
            vec![addr_a],
            b_tx,
        );
        b.start().await.unwrap();

        assert_eq!(expect_node_up(&mut b_rx).await, NodeId::from("a"));
        assert_eq!(expect_node_up(&mut a_rx).await, NodeId::from("b"));
        assert!(a.is_connected(&NodeId::from("b")));
        assert!(b.is_connected(&NodeId::from("a")));
    }

    #[tokio::test]
    async fn frames_flow_in_fifo_order() {
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();

        let a = Mesh::new(
            NodeId::from("a"),
            registrar_principal("a"),
            loopback(),
            Vec::new(),
            a_tx,
        );
        let addr_a = a.start().await.unwrap();
        let b = Mesh::new(
            NodeId::from("b"),
            registrar_principal("b"),
            loopback(),
            vec![addr_a],
            b_tx,
        );
        b.start().await.unwrap();
        expect_node_up(&mut b_rx).await;
        expect_node_up(&mut a_rx).await;

        for i in 0..10 {
            b.send_to(
                &NodeId::from("a"),
                WireMessage::UnregisterNotify {
                    from: NodeId::from("b"),
                    name: crate::types::Name::from(format!("n{}", i)),
                },
            );
        }

        for i in 0..10 {
            match timeout(WAIT, a_rx.recv()).await.unwrap().unwrap() {
                MeshEvent::Message {
                    from,
                    message: WireMessage::UnregisterNotify { name, .. },
                } => {
                    assert_eq!(from, NodeId::from("b"));
                    assert_eq!(name, crate::types::Name::from(format!("n{}", i)));
                }
                other => panic!("expected notify, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn link_monitor_fires_on_peer_shutdown() {
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();

        let a = Mesh::new(
            NodeId::from("a"),
            registrar_principal("a"),
            loopback(),
            Vec::new(),
            a_tx,
        );
        let addr_a = a.start().await.unwrap();
        let b = Mesh::new(
            NodeId::from("b"),
            registrar_principal("b"),
            loopback(),
            vec![addr_a],
            b_tx,
        );
        b.start().await.unwrap();
        expect_node_up(&mut b_rx).await;
        expect_node_up(&mut a_rx).await;

        let (down_tx, mut down_rx) = mpsc::unbounded_channel();
        let reference = b.monitor(&NodeId::from("a"), down_tx);

        a.shutdown();

        let down = timeout(WAIT, down_rx.recv()).await.unwrap().unwrap();
        assert_eq!(down.reference, reference);
        assert_eq!(down.reason, DownReason::Disconnected);
        assert_eq!(down.principal.home(), &NodeId::from("a"));
    }

    #[tokio::test]
    async fn monitor_on_unknown_node_fires_immediately() {
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let a = Mesh::new(
            NodeId::from("a"),
            registrar_principal("a"),
            loopback(),
            Vec::new(),
            a_tx,
        );
        a.start().await.unwrap();

        let (down_tx, mut down_rx) = mpsc::unbounded_channel();
        a.monitor(&NodeId::from("ghost"), down_tx);

        let down = timeout(WAIT, down_rx.recv()).await.unwrap().unwrap();
        assert_eq!(down.reason, DownReason::Disconnected);
    }
}
