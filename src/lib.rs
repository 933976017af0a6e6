//! # namecast — distributed name registry
//!
//! namecast associates human-readable names with live actor-like entities
//! ("principals") across a cluster of cooperating nodes. Lookups are
//! eventually consistent: registrations, unregistrations, and metadata
//! updates propagate to every connected peer, and bindings are cleaned up
//! automatically when a principal or a peer node fails.
//!
//! ## Quick start
//!
//! ```ignore
//! use namecast::{Registry, RegistryConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Registry::start(
//!         RegistryConfig::new("a").bind_addr("127.0.0.1:7474".parse()?),
//!     )
//!     .await?;
//!
//!     // Spawn a principal and give it a name.
//!     let mut worker = registry.spawn_principal();
//!     registry.register_name("worker", worker.principal()).await?;
//!
//!     // Anyone on any connected node can now resolve and message it.
//!     registry.send("worker", json!({"job": 1}));
//!     let job = worker.recv().await;
//!     println!("got {:?}", job);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Model
//!
//! Each node runs one **registrar**: a single task that serializes every
//! state transition (API calls, peer notifications, liveness DOWNs,
//! membership events) through one mailbox. The only shared mutable state
//! is the binding table, which supports lock-free concurrent reads, so
//! `whereis_name` and the enumeration calls never wait on the registrar.
//!
//! A node only ever authoritatively mutates bindings it owns. Remote
//! state arrives strictly by notification over the peer mesh, and two
//! nodes that concurrently register the same name converge without
//! negotiation: the binding whose home node sorts first in the cluster
//! total order wins everywhere, and the loser's principal is terminated.
//!
//! There is no persistence and no strong consistency; a node that
//! rejoins rebuilds its view of remote bindings from peer sync.
//!
//! ## Logging
//!
//! The log level can be controlled via the `NAMECAST_LOG` environment
//! variable once [`init_logging`] has been called (`error`, `warn`,
//! `info`, `debug`, `trace`).

mod core;
mod error;
mod registrar;

pub mod cluster;
pub mod liveness;
pub mod network;
pub mod table;
pub mod types;

// Public API exports
pub use core::{Priority, Registry, RegistryConfig, RegistryStatus};
pub use error::{RegistryError, RegistryResult};
pub use types::{Binding, Meta, MonitorRef, Name, NodeId, Origin, Principal, PrincipalId};

pub use cluster::{Mesh, MeshEvent, PeerInfo, Transport};
pub use liveness::{Down, DownReason, DownSink, PrincipalHandle, PrincipalHost};
pub use network::{SyncEntry, WireMessage, DEFAULT_PORT};
pub use table::RegistryTable;

// Re-export commonly used external types for convenience
pub use serde_json::{json, Value as JsonValue};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use namecast::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{Priority, Registry, RegistryConfig, RegistryStatus};
    pub use crate::error::{RegistryError, RegistryResult};
    pub use crate::liveness::{Down, DownReason, PrincipalHandle};
    pub use crate::types::{Binding, Meta, Name, NodeId, Origin, Principal};
    pub use serde_json::{json, Value as JsonValue};
}

// ============================================================================
// Logging and Observability
// ============================================================================

/// Initialize the logging system.
///
/// Call once at application startup. Configures the tracing subscriber
/// with an environment filter read from `NAMECAST_LOG` (defaults to
/// `info`).
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("NAMECAST_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Initialize logging with a specific level.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(level);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
