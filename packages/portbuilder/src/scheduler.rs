//! Topological build ordering over the package graph.
//!
//! Kahn's algorithm, run in two modes over the same underlying pass:
//! [`build_order`] is permissive (ports unreachable because of a cycle are
//! simply absent from the output), [`topo_order_strict`] is strict (the
//! same situation is reported as a [`CycleError`]). Ties are broken by FIFO
//! insertion order so a build over an unchanged graph is deterministic.

use std::{collections::HashMap, sync::Arc};

use tracing::instrument;

use crate::{error::CycleError, graph::Port};

/// Build order respecting dependencies. Ports that can never become ready
/// because they sit in a cycle (or depend, transitively, only on ports in
/// one) are silently absent from the output; the orchestrator is expected
/// to treat anything never produced here as skipped.
#[instrument(skip(ports))]
pub fn build_order(ports: &[Arc<Port>]) -> Vec<Arc<Port>> {
    topo(ports).0
}

/// Build order respecting dependencies, failing if any port could not be
/// placed.
#[instrument(skip(ports))]
pub fn topo_order_strict(ports: &[Arc<Port>]) -> Result<Vec<Arc<Port>>, CycleError> {
    let (ordered, unreached) = topo(ports);
    if unreached.is_empty() {
        Ok(ordered)
    } else {
        let total = unreached.len();
        let sample_origins = unreached.iter().take(5).map(|p| p.origin()).collect();
        Err(CycleError {
            total,
            sample_origins,
        })
    }
}

/// Shared Kahn's-algorithm pass. Returns the ports that were successfully
/// ordered, plus whatever remained unreached (non-empty iff `ports`
/// contains a cycle reachable from the input set).
fn topo(ports: &[Arc<Port>]) -> (Vec<Arc<Port>>, Vec<Arc<Port>>) {
    let mut in_degree: HashMap<String, usize> = HashMap::with_capacity(ports.len());
    for port in ports {
        in_degree.insert(port.key.as_str().to_string(), port.depends_on().len());
    }

    let mut queue: std::collections::VecDeque<Arc<Port>> = ports
        .iter()
        .filter(|p| in_degree.get(p.key.as_str()).copied() == Some(0))
        .cloned()
        .collect();

    let mut ordered = Vec::with_capacity(ports.len());
    let mut enqueued: std::collections::HashSet<String> =
        queue.iter().map(|p| p.key.as_str().to_string()).collect();

    while let Some(port) = queue.pop_front() {
        ordered.push(Arc::clone(&port));
        for (dependent, _kind) in port.depended_by() {
            let key = dependent.key.as_str().to_string();
            let Some(degree) = in_degree.get_mut(&key) else {
                // `dependent` isn't part of the input set; not our concern.
                continue;
            };
            *degree -= 1;
            if *degree == 0 && enqueued.insert(key) {
                queue.push_back(dependent);
            }
        }
    }

    let ordered_keys: std::collections::HashSet<String> =
        ordered.iter().map(|p| p.key.as_str().to_string()).collect();
    let unreached = ports
        .iter()
        .filter(|p| !ordered_keys.contains(p.key.as_str()))
        .cloned()
        .collect();

    (ordered, unreached)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::graph::{DepKind, PackageRegistry};

    #[test]
    fn orders_a_simple_chain() {
        let registry = PackageRegistry::new();
        let (a, _) = registry.enter("games", "a", "");
        let (b, _) = registry.enter("games", "b", "");
        let (c, _) = registry.enter("games", "c", "");
        Port::link(&b, &a, DepKind::Build);
        Port::link(&c, &b, DepKind::Build);

        let order = build_order(&registry.all());
        let positions: HashMap<_, _> = order
            .iter()
            .enumerate()
            .map(|(i, p)| (p.key.as_str().to_string(), i))
            .collect();
        assert!(positions["games/a"] < positions["games/b"]);
        assert!(positions["games/b"] < positions["games/c"]);
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn strict_mode_reports_a_cycle() {
        let registry = PackageRegistry::new();
        let (a, _) = registry.enter("games", "a", "");
        let (b, _) = registry.enter("games", "b", "");
        Port::link(&a, &b, DepKind::Build);
        Port::link(&b, &a, DepKind::Build);

        let err = topo_order_strict(&registry.all()).unwrap_err();
        assert_eq!(err.total, 2);
    }

    #[test]
    fn permissive_mode_drops_cycle_members() {
        let registry = PackageRegistry::new();
        let (a, _) = registry.enter("games", "a", "");
        let (b, _) = registry.enter("games", "b", "");
        Port::link(&a, &b, DepKind::Build);
        Port::link(&b, &a, DepKind::Build);

        let order = build_order(&registry.all());
        assert!(order.is_empty());
    }

    #[test]
    fn ties_preserve_insertion_order() {
        let registry = PackageRegistry::new();
        let (a, _) = registry.enter("games", "a", "");
        let (b, _) = registry.enter("games", "b", "");
        let (c, _) = registry.enter("games", "c", "");

        let order = build_order(&[a, b, c]);
        let origins: Vec<_> = order.iter().map(|p| p.origin()).collect();
        assert_eq!(origins, vec!["games/a", "games/b", "games/c"]);
    }
}
