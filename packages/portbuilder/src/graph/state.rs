//! Transient per-run build state, kept separate from [`super::Port`] so a
//! single resolver pass can be reused across multiple build runs.

use std::sync::Arc;

use bitflags::bitflags;
use dashmap::DashMap;

use super::PortKey;

bitflags! {
    /// The fixed set of flags a port's build state can carry during a run.
    #[derive(Clone, Copy, Eq, PartialEq, Debug)]
    pub struct Flag: u16 {
        const SUCCESS          = 1 << 0;
        const FAILED           = 1 << 1;
        const SKIPPED           = 1 << 2;
        const IGNORED           = 1 << 3;
        const RUNNING           = 1 << 4;
        const NO_BUILD_IGNORE   = 1 << 5;
        const NOT_FOUND         = 1 << 6;
        const CORRUPT           = 1 << 7;
        const PACKAGED          = 1 << 8;
        const META              = 1 << 9;
        const DUMMY             = 1 << 10;
        const MANUAL_SELECTION  = 1 << 11;

        /// A terminal state: the worker pool stops waiting on this port.
        const TERMINAL = Self::SUCCESS.bits()
            | Self::FAILED.bits()
            | Self::SKIPPED.bits()
            | Self::IGNORED.bits()
            | Self::NOT_FOUND.bits()
            | Self::CORRUPT.bits();
    }
}

/// Per-port transient state for a single orchestrator run.
#[derive(Debug, Default)]
pub struct BuildState {
    inner: std::sync::RwLock<Inner>,
}

#[derive(Debug, Default, Clone)]
struct Inner {
    flags: Flag,
    ignore_reason: String,
    last_phase: String,
}

impl Default for Flag {
    fn default() -> Self {
        Flag::empty()
    }
}

impl BuildState {
    pub fn has(&self, flag: Flag) -> bool {
        self.inner.read().expect("state lock poisoned").flags.contains(flag)
    }

    pub fn set(&self, flag: Flag) {
        self.inner.write().expect("state lock poisoned").flags.insert(flag);
    }

    pub fn clear(&self, flag: Flag) {
        self.inner.write().expect("state lock poisoned").flags.remove(flag);
    }

    pub fn flags(&self) -> Flag {
        self.inner.read().expect("state lock poisoned").flags
    }

    pub fn is_terminal(&self) -> bool {
        self.flags().intersects(Flag::TERMINAL)
    }

    pub fn ignore_reason(&self) -> String {
        self.inner.read().expect("state lock poisoned").ignore_reason.clone()
    }

    pub fn set_ignore_reason(&self, reason: impl Into<String>) {
        self.inner.write().expect("state lock poisoned").ignore_reason = reason.into();
    }

    pub fn last_phase(&self) -> String {
        self.inner.read().expect("state lock poisoned").last_phase.clone()
    }

    pub fn set_last_phase(&self, phase: impl Into<String>) {
        self.inner.write().expect("state lock poisoned").last_phase = phase.into();
    }
}

/// Thread-safe registry of [`BuildState`], parallel to [`super::PackageRegistry`].
#[derive(Debug, Default, Clone)]
pub struct BuildStateRegistry {
    entries: Arc<DashMap<PortKey, Arc<BuildState>>>,
}

impl BuildStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the state for `key`, inserting a fresh empty one if absent.
    pub fn enter(&self, key: &PortKey) -> Arc<BuildState> {
        if let Some(existing) = self.entries.get(key) {
            return Arc::clone(existing.value());
        }
        match self.entries.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(occ) => Arc::clone(occ.get()),
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                let state = Arc::new(BuildState::default());
                vac.insert(Arc::clone(&state));
                state
            }
        }
    }

    pub fn find(&self, key: &PortKey) -> Option<Arc<BuildState>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn new_state_is_not_terminal() {
        let state = BuildState::default();
        assert!(!state.is_terminal());
    }

    #[test]
    fn success_is_terminal() {
        let state = BuildState::default();
        state.set(Flag::SUCCESS);
        assert!(state.is_terminal());
    }

    #[test]
    fn running_is_not_terminal() {
        let state = BuildState::default();
        state.set(Flag::RUNNING);
        assert!(!state.is_terminal());
    }

    #[test]
    fn registry_enter_is_idempotent() {
        let registry = BuildStateRegistry::new();
        let key = PortKey::new("games/foo", "");
        let a = registry.enter(&key);
        a.set(Flag::SUCCESS);
        let b = registry.enter(&key);
        assert_eq!(a.flags(), b.flags());
        assert!(Arc::ptr_eq(&a, &b));
    }
}
