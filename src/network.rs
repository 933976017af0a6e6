//! Wire protocol and framing for registrar-to-registrar traffic.
//!
//! Peers speak a small message set over TCP: each frame is a 4-byte
//! big-endian length header followed by a JSON-encoded [`WireMessage`].
//! The transport contract the registrar relies on is per-pair FIFO:
//! frames written on one link arrive in write order or the link dies.
//!
//! Connections are used full-duplex; [`Connection`] covers the handshake,
//! then splits into a [`FrameReader`] / [`FrameWriter`] pair owned by the
//! per-link reader and writer tasks.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{RegistryError, RegistryResult};
use crate::types::{Meta, Name, NodeId, Principal};

/// Default port for registry mesh communication.
pub const DEFAULT_PORT: u16 = 7474;

/// Maximum frame size (16 MB). Generous: the largest frame is a bulk sync
/// response carrying one node's local bindings.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A `(name, principal, meta)` triple carried in a bulk sync response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEntry {
    pub name: Name,
    pub principal: Principal,
    pub meta: Meta,
}

/// Messages exchanged between registrars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Link handshake; the first frame in each direction on a fresh
    /// connection. Carries the sender's listen address (so the acceptor
    /// can report it) and its registrar principal (the identity remote
    /// liveness monitors watch).
    Hello {
        node: NodeId,
        listen_addr: SocketAddr,
        registrar: Principal,
    },

    /// "Send me your local bindings."
    SyncReq { from: NodeId },

    /// Bulk snapshot of the sender's locally owned bindings.
    SyncResp {
        from: NodeId,
        bindings: Vec<SyncEntry>,
    },

    /// Single-entry registration announcement. `meta` is present only when
    /// replaying an entry that already carries attributes; plain broadcasts
    /// omit it.
    RegisterNotify {
        from: NodeId,
        name: Name,
        principal: Principal,
        meta: Option<Meta>,
    },

    /// Removal announcement.
    UnregisterNotify { from: NodeId, name: Name },

    /// Metadata overwrite announcement.
    MetaNotify {
        from: NodeId,
        name: Name,
        meta: Meta,
    },

    /// Payload for a principal hosted on the receiving node.
    Forward {
        principal: Principal,
        payload: JsonValue,
    },
}

impl WireMessage {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> RegistryResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(RegistryError::Serialization)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> RegistryResult<Self> {
        serde_json::from_slice(bytes).map_err(RegistryError::Serialization)
    }
}

async fn write_frame<W>(writer: &mut W, message: &WireMessage) -> RegistryResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message.to_bytes()?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(RegistryError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| RegistryError::Network(format!("failed to write frame length: {}", e)))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| RegistryError::Network(format!("failed to write frame body: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| RegistryError::Network(format!("failed to flush stream: {}", e)))?;

    Ok(())
}

async fn read_frame<R>(reader: &mut R) -> RegistryResult<WireMessage>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| RegistryError::Network(format!("failed to read frame length: {}", e)))?;

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RegistryError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| RegistryError::Network(format!("failed to read frame body: {}", e)))?;

    WireMessage::from_bytes(&bytes)
}

/// A connection to a peer, used whole during the handshake.
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Wrap an accepted TCP stream.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self { stream, peer_addr }
    }

    /// Connect to a peer.
    pub async fn connect(addr: SocketAddr) -> RegistryResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RegistryError::Network(format!("failed to connect to {}: {}", addr, e)))?;
        Ok(Self::new(stream, addr))
    }

    /// The remote socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Send a message.
    pub async fn send(&mut self, message: &WireMessage) -> RegistryResult<()> {
        write_frame(&mut self.stream, message).await
    }

    /// Receive a message.
    pub async fn receive(&mut self) -> RegistryResult<WireMessage> {
        read_frame(&mut self.stream).await
    }

    /// Split into read and write halves for full-duplex use.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            FrameReader { reader: read_half },
            FrameWriter { writer: write_half },
        )
    }
}

/// Reading half of a split connection.
pub struct FrameReader {
    reader: OwnedReadHalf,
}

impl FrameReader {
    /// Receive the next frame.
    pub async fn receive(&mut self) -> RegistryResult<WireMessage> {
        read_frame(&mut self.reader).await
    }
}

/// Writing half of a split connection.
pub struct FrameWriter {
    writer: OwnedWriteHalf,
}

impl FrameWriter {
    /// Send a frame.
    pub async fn send(&mut self, message: &WireMessage) -> RegistryResult<()> {
        write_frame(&mut self.writer, message).await
    }
}

/// TCP listener for incoming mesh connections.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind to an address and start listening.
    pub async fn bind(addr: SocketAddr) -> RegistryResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RegistryError::Network(format!("failed to bind to {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RegistryError::Network(format!("failed to get local address: {}", e)))?;

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// The bound local address (resolved when binding to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept an incoming connection.
    pub async fn accept(&self) -> RegistryResult<Connection> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| RegistryError::Network(format!("failed to accept connection: {}", e)))?;
        Ok(Connection::new(stream, peer_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrincipalId;
    use std::net::{IpAddr, Ipv4Addr};

    fn principal(home: &str) -> Principal {
        Principal::new(PrincipalId::fresh(), NodeId::from(home))
    }

    #[test]
    fn message_round_trip() {
        let message = WireMessage::RegisterNotify {
            from: NodeId::from("a"),
            name: Name::from("x"),
            principal: principal("a"),
            meta: None,
        };

        let bytes = message.to_bytes().unwrap();
        let decoded = WireMessage::from_bytes(&bytes).unwrap();

        match decoded {
            WireMessage::RegisterNotify { from, name, meta, .. } => {
                assert_eq!(from, NodeId::from("a"));
                assert_eq!(name, Name::from("x"));
                assert!(meta.is_none());
            }
            other => panic!("expected RegisterNotify, got {:?}", other),
        }
    }

    #[test]
    fn sync_entries_carry_meta() {
        let mut meta = Meta::new();
        meta.insert("k".to_string(), serde_json::json!(1));

        let message = WireMessage::SyncResp {
            from: NodeId::from("b"),
            bindings: vec![SyncEntry {
                name: Name::from("x"),
                principal: principal("b"),
                meta,
            }],
        };

        let decoded = WireMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();
        match decoded {
            WireMessage::SyncResp { bindings, .. } => {
                assert_eq!(bindings.len(), 1);
                assert_eq!(bindings[0].meta.get("k"), Some(&serde_json::json!(1)));
            }
            other => panic!("expected SyncResp, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn framed_exchange_over_tcp() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0);
        let listener = Listener::bind(addr).await.unwrap();
        let listen_addr = listener.local_addr();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let msg = conn.receive().await.unwrap();
            conn.send(&WireMessage::SyncResp {
                from: NodeId::from("b"),
                bindings: Vec::new(),
            })
            .await
            .unwrap();
            msg
        });

        let mut client = Connection::connect(listen_addr).await.unwrap();
        client
            .send(&WireMessage::SyncReq {
                from: NodeId::from("a"),
            })
            .await
            .unwrap();

        match client.receive().await.unwrap() {
            WireMessage::SyncResp { from, bindings } => {
                assert_eq!(from, NodeId::from("b"));
                assert!(bindings.is_empty());
            }
            other => panic!("expected SyncResp, got {:?}", other),
        }

        match server.await.unwrap() {
            WireMessage::SyncReq { from } => assert_eq!(from, NodeId::from("a")),
            other => panic!("expected SyncReq, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn split_halves_frame_independently() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0);
        let listener = Listener::bind(addr).await.unwrap();
        let listen_addr = listener.local_addr();

        let server = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            let (mut reader, mut writer) = conn.into_split();
            let msg = reader.receive().await.unwrap();
            writer.send(&msg).await.unwrap();
        });

        let conn = Connection::connect(listen_addr).await.unwrap();
        let (mut reader, mut writer) = conn.into_split();
        writer
            .send(&WireMessage::UnregisterNotify {
                from: NodeId::from("a"),
                name: Name::from("x"),
            })
            .await
            .unwrap();

        match reader.receive().await.unwrap() {
            WireMessage::UnregisterNotify { name, .. } => assert_eq!(name, Name::from("x")),
            other => panic!("expected UnregisterNotify, got {:?}", other),
        }

        server.await.unwrap();
    }
}
