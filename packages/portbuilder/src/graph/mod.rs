//! In-memory package graph: parsed port metadata plus bidirectional
//! dependency edges.

pub mod state;

use std::sync::Arc;

use dashmap::DashMap;
use derive_more::Display;
use strum::{Display as StrumDisplay, EnumString};

pub use state::{BuildState, BuildStateRegistry, Flag};

/// Composite registry key: `origin`, or `origin@flavor` when a flavor is set.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display, Ord, PartialOrd)]
pub struct PortKey(String);

impl PortKey {
    pub fn new(origin: impl AsRef<str>, flavor: impl AsRef<str>) -> Self {
        let origin = origin.as_ref();
        let flavor = flavor.as_ref();
        if flavor.is_empty() {
            Self(origin.to_string())
        } else {
            Self(format!("{origin}@{flavor}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The kind of a dependency edge between two ports.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, StrumDisplay, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum DepKind {
    Fetch,
    Extract,
    Patch,
    Build,
    Lib,
    Run,
}

impl DepKind {
    /// All dependency kinds, in the order the port tool's Makefile
    /// variables are queried.
    pub const ALL: [DepKind; 6] = [
        DepKind::Fetch,
        DepKind::Extract,
        DepKind::Patch,
        DepKind::Build,
        DepKind::Lib,
        DepKind::Run,
    ];

    /// The Makefile variable this dependency kind is read from.
    pub fn makefile_var(self) -> &'static str {
        match self {
            DepKind::Fetch => "FETCH_DEPENDS",
            DepKind::Extract => "EXTRACT_DEPENDS",
            DepKind::Patch => "PATCH_DEPENDS",
            DepKind::Build => "BUILD_DEPENDS",
            DepKind::Lib => "LIB_DEPENDS",
            DepKind::Run => "RUN_DEPENDS",
        }
    }
}

/// A single parsed port, plus its resolved edges.
///
/// Mutable fields (the raw dependency strings, resolved edges, and
/// metadata populated by the resolver) live behind a `parking_lot`-free
/// `std::sync::RwLock` so `Port` can be shared behind an `Arc` across the
/// resolver's worker pool without the caller needing a `&mut`.
#[derive(Debug)]
pub struct Port {
    pub key: PortKey,
    pub category: String,
    pub name: String,
    pub flavor: String,
    inner: std::sync::RwLock<PortInner>,
}

#[derive(Debug, Default, Clone)]
struct PortInner {
    version: String,
    pkg_file_name: String,
    raw_depends: [String; 6],
    depends_on: Vec<(Arc<Port>, DepKind)>,
    depended_by: Vec<(Arc<Port>, DepKind)>,
}

impl Port {
    fn new(key: PortKey, category: String, name: String, flavor: String) -> Arc<Self> {
        Arc::new(Self {
            key,
            category,
            name,
            flavor,
            inner: std::sync::RwLock::new(PortInner::default()),
        })
    }

    pub fn origin(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    pub fn version(&self) -> String {
        self.inner.read().expect("port lock poisoned").version.clone()
    }

    pub fn set_version(&self, version: impl Into<String>) {
        self.inner.write().expect("port lock poisoned").version = version.into();
    }

    pub fn pkg_file_name(&self) -> String {
        self.inner
            .read()
            .expect("port lock poisoned")
            .pkg_file_name
            .clone()
    }

    pub fn set_pkg_file_name(&self, name: impl Into<String>) {
        self.inner.write().expect("port lock poisoned").pkg_file_name = name.into();
    }

    pub fn raw_depends(&self, kind: DepKind) -> String {
        self.inner.read().expect("port lock poisoned").raw_depends[kind as usize].clone()
    }

    pub fn set_raw_depends(&self, kind: DepKind, value: impl Into<String>) {
        self.inner.write().expect("port lock poisoned").raw_depends[kind as usize] = value.into();
    }

    pub fn depends_on(&self) -> Vec<(Arc<Port>, DepKind)> {
        self.inner.read().expect("port lock poisoned").depends_on.clone()
    }

    pub fn depended_by(&self) -> Vec<(Arc<Port>, DepKind)> {
        self.inner.read().expect("port lock poisoned").depended_by.clone()
    }

    /// Number of ports that directly depend on this one. Used for progress
    /// display and diagnostics only; not load-bearing for scheduling.
    pub fn dependent_count(&self) -> usize {
        self.inner.read().expect("port lock poisoned").depended_by.len()
    }

    /// Longest chain of dependencies below this port. Used for progress
    /// display and diagnostics only. Cycle-safe: a port already on the
    /// current path contributes no further depth rather than looping.
    pub fn max_dependency_depth(&self) -> usize {
        self.max_dependency_depth_along(&mut Vec::new())
    }

    fn max_dependency_depth_along(&self, path: &mut Vec<PortKey>) -> usize {
        if path.contains(&self.key) {
            return 0;
        }
        path.push(self.key.clone());
        let depth = self
            .depends_on()
            .iter()
            .map(|(dep, _)| 1 + dep.max_dependency_depth_along(path))
            .max()
            .unwrap_or(0);
        path.pop();
        depth
    }

    /// Record that `dependent` depends on `dependency` with the given
    /// kind, and the reverse edge on `dependency`. Idempotent: repeated
    /// calls with the same pair do not duplicate the edge.
    ///
    /// Takes both sides as `&Arc<Port>` (rather than a `self: &Arc<Self>`
    /// receiver, which isn't a stable self-type) since both ends need
    /// their own clone of the other's `Arc` to store in their edge list.
    pub fn link(dependent: &Arc<Port>, dependency: &Arc<Port>, kind: DepKind) {
        {
            let mut inner = dependent.inner.write().expect("port lock poisoned");
            if !inner
                .depends_on
                .iter()
                .any(|(p, k)| Arc::ptr_eq(p, dependency) && *k == kind)
            {
                inner.depends_on.push((Arc::clone(dependency), kind));
            }
        }
        {
            let mut inner = dependency.inner.write().expect("port lock poisoned");
            if !inner
                .depended_by
                .iter()
                .any(|(p, k)| Arc::ptr_eq(p, dependent) && *k == kind)
            {
                inner.depended_by.push((Arc::clone(dependent), kind));
            }
        }
    }
}

/// Thread-safe registry of parsed [`Port`]s, keyed by origin (+ flavor).
#[derive(Debug, Default, Clone)]
pub struct PackageRegistry {
    entries: Arc<DashMap<PortKey, Arc<Port>>>,
}

impl PackageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for `key`, inserting a fresh empty [`Port`] if
    /// absent. The second element of the tuple is `true` iff this call
    /// created the entry.
    pub fn enter(&self, category: &str, name: &str, flavor: &str) -> (Arc<Port>, bool) {
        let key = PortKey::new(format!("{category}/{name}"), flavor);
        if let Some(existing) = self.entries.get(&key) {
            return (Arc::clone(existing.value()), false);
        }
        let port = Port::new(
            key.clone(),
            category.to_string(),
            name.to_string(),
            flavor.to_string(),
        );
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(occ) => (Arc::clone(occ.get()), false),
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                vac.insert(Arc::clone(&port));
                (port, true)
            }
        }
    }

    pub fn find(&self, key: &PortKey) -> Option<Arc<Port>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    pub fn all(&self) -> Vec<Arc<Port>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn enter_is_idempotent() {
        let registry = PackageRegistry::new();
        let (a, created_a) = registry.enter("games", "foo", "");
        let (b, created_b) = registry.enter("games", "foo", "");
        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn flavor_distinguishes_ports() {
        let registry = PackageRegistry::new();
        let (a, _) = registry.enter("games", "foo", "");
        let (b, _) = registry.enter("games", "foo", "flavor1");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn dependent_count_and_max_depth_reflect_the_chain() {
        let registry = PackageRegistry::new();
        let (a, _) = registry.enter("games", "a", "");
        let (b, _) = registry.enter("games", "b", "");
        let (c, _) = registry.enter("games", "c", "");
        Port::link(&b, &a, DepKind::Build);
        Port::link(&c, &b, DepKind::Build);

        assert_eq!(a.dependent_count(), 1);
        assert_eq!(c.dependent_count(), 0);
        assert_eq!(c.max_dependency_depth(), 2);
        assert_eq!(a.max_dependency_depth(), 0);
    }

    #[test]
    fn max_dependency_depth_tolerates_cycles() {
        let registry = PackageRegistry::new();
        let (a, _) = registry.enter("games", "a", "");
        let (b, _) = registry.enter("games", "b", "");
        Port::link(&a, &b, DepKind::Build);
        Port::link(&b, &a, DepKind::Build);

        assert!(a.max_dependency_depth() <= 2);
    }

    #[test]
    fn link_is_bidirectional_and_idempotent() {
        let registry = PackageRegistry::new();
        let (a, _) = registry.enter("games", "a", "");
        let (b, _) = registry.enter("games", "b", "");

        Port::link(&a, &b, DepKind::Build);
        Port::link(&a, &b, DepKind::Build);

        assert_eq!(a.depends_on().len(), 1);
        assert_eq!(b.depended_by().len(), 1);
        assert_eq!(a.depends_on()[0].1, DepKind::Build);
        assert_eq!(b.depended_by()[0].1, DepKind::Build);
    }
}
