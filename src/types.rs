//! Core data model for the registry.
//!
//! The registry maps a [`Name`] to a [`Binding`]: the live [`Principal`]
//! the name refers to, the [`Origin`] node that owns the binding, an
//! optional liveness [`MonitorRef`] (present only for locally owned
//! bindings), and opaque [`Meta`] attributes.
//!
//! Node identities are small human-readable strings; `Ord` on [`NodeId`]
//! is the cluster-wide total order used by clash resolution.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Identity of a node in the cluster.
///
/// The derived `Ord` (lexicographic on the underlying name) is the same
/// total order the membership layer uses, and the one clash resolution
/// relies on: given two concurrent registrations of one name, every node
/// independently keeps the binding whose home node sorts first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node identity from a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The node name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for NodeId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A registered name. Opaque and immutable once created; unique within
/// the registry on every node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Name(String);

impl Name {
    /// Create a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Name {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Name {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Opaque key-value attributes attached to a binding.
pub type Meta = HashMap<String, JsonValue>;

/// Unique identifier of a principal, independent of its home node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrincipalId(Uuid);

impl PrincipalId {
    /// Generate a fresh random identifier.
    pub(crate) fn fresh() -> Self {
        Self(Uuid::new_v4())
    }

    /// The all-zero identifier, used when a peer's registrar identity is
    /// not known (e.g. a monitor installed on an already-lost link).
    pub(crate) fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Reference to a live actor-like entity and the node it lives on.
///
/// A principal is only ever authoritatively registered, unregistered, or
/// mutated by its home node; every other node learns about it through
/// peer notifications.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    id: PrincipalId,
    home: NodeId,
}

impl Principal {
    pub(crate) fn new(id: PrincipalId, home: NodeId) -> Self {
        Self { id, home }
    }

    /// The principal's unique identifier.
    pub fn id(&self) -> PrincipalId {
        self.id
    }

    /// The node this principal lives on.
    pub fn home(&self) -> &NodeId {
        &self.home
    }

    /// Whether this principal lives on `node`.
    pub fn is_local_to(&self, node: &NodeId) -> bool {
        &self.home == node
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.home)
    }
}

/// Opaque token identifying an installed liveness monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitorRef(Uuid);

impl MonitorRef {
    pub(crate) fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MonitorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mon-{}", &self.0.to_string()[..8])
    }
}

/// Where a binding is owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Owned by this node; the binding carries a liveness monitor.
    Local,
    /// Owned by the named remote node.
    Remote(NodeId),
}

impl Origin {
    /// Whether the binding is owned by this node.
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Local)
    }

    /// The owning remote node, if any.
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            Origin::Local => None,
            Origin::Remote(node) => Some(node),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Local => write!(f, "local"),
            Origin::Remote(node) => write!(f, "{}", node),
        }
    }
}

/// A `name -> principal` record in the local table.
#[derive(Debug, Clone)]
pub struct Binding {
    /// The registered name.
    pub name: Name,
    /// The principal the name refers to.
    pub principal: Principal,
    /// Which node owns this binding.
    pub origin: Origin,
    /// Liveness monitor on the principal; present iff `origin` is local.
    pub monitor: Option<MonitorRef>,
    /// Opaque attributes, defaults to empty.
    pub meta: Meta,
}

impl Binding {
    /// A binding owned by this node, monitored for liveness.
    pub(crate) fn local(name: Name, principal: Principal, monitor: MonitorRef) -> Self {
        Self {
            name,
            principal,
            origin: Origin::Local,
            monitor: Some(monitor),
            meta: Meta::new(),
        }
    }

    /// A binding learned from the remote node `owner`.
    pub(crate) fn remote(name: Name, principal: Principal, owner: NodeId, meta: Meta) -> Self {
        Self {
            name,
            principal,
            origin: Origin::Remote(owner),
            monitor: None,
            meta,
        }
    }
}
