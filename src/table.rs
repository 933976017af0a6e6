//! The shared binding table.
//!
//! One instance per node, holding every known binding (local and remote)
//! plus a reverse index from liveness monitor to name. The registrar task
//! is the only writer; readers (`whereis`, enumeration) run on arbitrary
//! caller threads concurrently with it and with each other, which is why
//! both maps are DashMaps. Point operations are atomic at row granularity;
//! there are no transactions.
//!
//! Readers tolerate races by design: a binding may vanish between lookup
//! and use, and callers treat a missing principal as a no-op on `send`.

use dashmap::DashMap;

use crate::types::{Binding, Meta, MonitorRef, Name, NodeId, Origin, Principal};

/// Concurrent table of bindings keyed by name, with a reverse index from
/// monitor reference back to name for DOWN handling.
///
/// The reverse index holds an entry exactly for the locally owned bindings
/// (those carrying a monitor), with one deliberate exception: when a clash
/// overwrite replaces a local binding, the stale reverse entry survives
/// until the DOWN of the terminated principal retires it.
#[derive(Debug, Default)]
pub struct RegistryTable {
    /// All known bindings, local and remote.
    bindings: DashMap<Name, Binding>,
    /// Monitor reference -> name, for locally owned bindings.
    monitors: DashMap<MonitorRef, Name>,
}

impl RegistryTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The principal currently bound to `name`, if any.
    pub fn whereis(&self, name: &Name) -> Option<Principal> {
        self.bindings.get(name).map(|b| b.principal.clone())
    }

    /// Whether any binding (of any origin) exists for `name`.
    pub fn contains(&self, name: &Name) -> bool {
        self.bindings.contains_key(name)
    }

    /// A snapshot of the binding for `name`.
    pub fn get(&self, name: &Name) -> Option<Binding> {
        self.bindings.get(name).map(|b| b.clone())
    }

    /// The meta attributes of the binding for `name`.
    pub fn meta_of(&self, name: &Name) -> Option<Meta> {
        self.bindings.get(name).map(|b| b.meta.clone())
    }

    /// Insert or overwrite the binding for its name. A monitored binding
    /// also gets a reverse-index entry; overwriting never touches reverse
    /// entries of the previous binding.
    pub(crate) fn insert(&self, binding: Binding) {
        if let Some(monitor) = binding.monitor {
            self.monitors.insert(monitor, binding.name.clone());
        }
        self.bindings.insert(binding.name.clone(), binding);
    }

    /// Remove the binding for `name`, leaving any reverse entry alone.
    pub(crate) fn remove(&self, name: &Name) -> Option<Binding> {
        self.bindings.remove(name).map(|(_, binding)| binding)
    }

    /// Remove and return the reverse-index entry for `monitor`.
    pub(crate) fn take_monitor(&self, monitor: &MonitorRef) -> Option<Name> {
        self.monitors.remove(monitor).map(|(_, name)| name)
    }

    /// Overwrite the meta of an existing binding. Returns false when no
    /// binding for `name` exists.
    pub(crate) fn update_meta(&self, name: &Name, meta: Meta) -> bool {
        match self.bindings.get_mut(name) {
            Some(mut binding) => {
                binding.meta = meta;
                true
            }
            None => false,
        }
    }

    /// All registered names, in no particular order.
    pub fn names(&self) -> Vec<Name> {
        self.bindings.iter().map(|b| b.name.clone()).collect()
    }

    /// All `(name, principal)` pairs.
    pub fn info(&self) -> Vec<(Name, Principal)> {
        self.bindings
            .iter()
            .map(|b| (b.name.clone(), b.principal.clone()))
            .collect()
    }

    /// Names of the bindings this node owns.
    pub fn local_names(&self) -> Vec<Name> {
        self.bindings
            .iter()
            .filter(|b| b.origin.is_local())
            .map(|b| b.name.clone())
            .collect()
    }

    /// `(name, principal, meta)` triples of the bindings this node owns;
    /// exactly the payload a bulk sync response ships.
    pub fn local_info(&self) -> Vec<(Name, Principal, Meta)> {
        self.bindings
            .iter()
            .filter(|b| b.origin.is_local())
            .map(|b| (b.name.clone(), b.principal.clone(), b.meta.clone()))
            .collect()
    }

    /// Delete every binding owned by the remote node `origin`. Returns the
    /// number of bindings purged. Reverse entries need no scrub: they exist
    /// only for local bindings.
    pub(crate) fn purge_origin(&self, origin: &NodeId) -> usize {
        let before = self.bindings.len();
        self.bindings
            .retain(|_, binding| binding.origin != Origin::Remote(origin.clone()));
        before - self.bindings.len()
    }

    /// Number of bindings in the table.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the table holds no bindings.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrincipalId;
    use proptest::prelude::*;

    fn principal(home: &str) -> Principal {
        Principal::new(PrincipalId::fresh(), NodeId::from(home))
    }

    fn remote(name: &str, home: &str) -> Binding {
        let p = principal(home);
        Binding::remote(Name::from(name), p, NodeId::from(home), Meta::new())
    }

    #[test]
    fn whereis_hits_and_misses() {
        let table = RegistryTable::new();
        let binding = remote("x", "b");
        let expected = binding.principal.clone();
        table.insert(binding);

        assert_eq!(table.whereis(&Name::from("x")), Some(expected));
        assert_eq!(table.whereis(&Name::from("y")), None);
    }

    #[test]
    fn insert_local_adds_reverse_entry() {
        let table = RegistryTable::new();
        let monitor = MonitorRef::fresh();
        table.insert(Binding::local(Name::from("x"), principal("a"), monitor));

        assert_eq!(table.take_monitor(&monitor), Some(Name::from("x")));
        // The binding itself is untouched by reverse-index removal.
        assert!(table.contains(&Name::from("x")));
    }

    #[test]
    fn overwrite_keeps_stale_reverse_entry() {
        let table = RegistryTable::new();
        let monitor = MonitorRef::fresh();
        table.insert(Binding::local(Name::from("x"), principal("c"), monitor));

        // A clash overwrite replaces the binding with a remote one.
        table.insert(remote("x", "a"));

        let binding = table.get(&Name::from("x")).unwrap();
        assert!(binding.monitor.is_none());
        // The stale reverse entry is still there for the pending DOWN.
        assert_eq!(table.take_monitor(&monitor), Some(Name::from("x")));
    }

    #[test]
    fn update_meta_only_touches_existing() {
        let table = RegistryTable::new();
        table.insert(remote("x", "b"));

        let mut meta = Meta::new();
        meta.insert("k".to_string(), serde_json::json!(1));

        assert!(table.update_meta(&Name::from("x"), meta.clone()));
        assert!(!table.update_meta(&Name::from("y"), meta.clone()));
        assert_eq!(table.meta_of(&Name::from("x")), Some(meta));
    }

    #[test]
    fn local_enumeration_filters_origin() {
        let table = RegistryTable::new();
        table.insert(Binding::local(
            Name::from("mine"),
            principal("a"),
            MonitorRef::fresh(),
        ));
        table.insert(remote("theirs", "b"));

        assert_eq!(table.local_names(), vec![Name::from("mine")]);
        assert_eq!(table.local_info().len(), 1);
        assert_eq!(table.names().len(), 2);
    }

    #[test]
    fn purge_origin_is_selective() {
        let table = RegistryTable::new();
        table.insert(remote("one", "b"));
        table.insert(remote("two", "b"));
        table.insert(remote("three", "c"));
        table.insert(Binding::local(
            Name::from("mine"),
            principal("a"),
            MonitorRef::fresh(),
        ));

        assert_eq!(table.purge_origin(&NodeId::from("b")), 2);
        assert_eq!(table.len(), 2);
        assert!(table.contains(&Name::from("three")));
        assert!(table.contains(&Name::from("mine")));
    }

    proptest! {
        /// After purging an origin, no binding of that origin remains and
        /// every other binding survives.
        #[test]
        fn purge_removes_exactly_one_origin(
            names in prop::collection::hash_set("[a-z]{1,8}", 1..32),
            homes in prop::collection::vec(prop::sample::select(vec!["b", "c", "d"]), 32),
        ) {
            let table = RegistryTable::new();
            for (name, home) in names.iter().zip(homes.iter()) {
                table.insert(remote(name, home));
            }
            let total = table.len();
            let purged_b: usize = table
                .info()
                .iter()
                .filter(|(_, p)| p.home() == &NodeId::from("b"))
                .count();

            prop_assert_eq!(table.purge_origin(&NodeId::from("b")), purged_b);
            prop_assert_eq!(table.len(), total - purged_b);
            for (name, principal) in table.info() {
                prop_assert_ne!(principal.home(), &NodeId::from("b"), "left behind {}", name);
            }
        }
    }
}
