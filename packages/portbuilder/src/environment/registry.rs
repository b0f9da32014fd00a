//! Backend registry: maps a backend name (`"bsd"`, `"mock"`) to a
//! constructor for a fresh, unconfigured [`super::Environment`].
//!
//! Registration happens by side effect of [`install_default_backends`],
//! called once (idempotently) the first time a name is resolved, mirroring
//! the spec's "registration is by side effect of loading a backend module"
//! without requiring a `ctor`-style linker trick for the two backends this
//! crate ships.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use super::Environment;
use crate::error::ResolveError;

/// Constructs a fresh [`Environment`] instance for a backend.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;
    fn create(&self) -> Box<dyn Environment>;
}

fn registry() -> &'static DashMap<&'static str, Arc<dyn Backend>> {
    static REGISTRY: OnceLock<DashMap<&'static str, Arc<dyn Backend>>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// Register a backend under its name, replacing any prior registration.
pub fn register(backend: Arc<dyn Backend>) {
    registry().insert(backend.name(), backend);
}

/// Register the two backends this crate ships: `"bsd"` and `"mock"`.
/// Safe to call repeatedly; only the first call has any effect.
pub fn install_default_backends() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        register(Arc::new(super::bsd::BsdBackend));
        register(Arc::new(super::mock::MockBackend));
    });
}

/// Resolve a backend name to its constructor.
pub fn resolve(name: &str) -> Result<Arc<dyn Backend>, ResolveError> {
    install_default_backends();
    registry()
        .get(name)
        .map(|entry| Arc::clone(entry.value()))
        .ok_or_else(|| ResolveError::UnknownBackend {
            name: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_both_default_backends() {
        assert!(resolve("bsd").is_ok());
        assert!(resolve("mock").is_ok());
    }

    #[test]
    fn unknown_backend_is_an_error() {
        assert!(resolve("nonexistent").is_err());
    }
}
