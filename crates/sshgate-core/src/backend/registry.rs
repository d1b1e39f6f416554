//! Catalogue of named backends.
//!
//! Filled once during startup, then shared read-only (typically behind an
//! `Arc`). Registration takes `&mut self`, so the borrow checker keeps it out
//! of the concurrent lookup phase.

use super::{Backend, Session};
use crate::error::{GateError, GateResult};
use std::collections::HashMap;
use tracing::{debug, info};

/// Backends indexed by name, plus their registration order.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    backends: HashMap<String, Backend>,
    backend_keys: Vec<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend. A second registration under the same name replaces
    /// the first; the name then appears twice in [`Self::backends`].
    pub fn register(&mut self, backend: Backend) {
        let name = backend.name().to_string();
        if self.backends.insert(name.clone(), backend).is_some() {
            debug!(backend = %name, "backend re-registered, replacing previous");
        }
        info!(backend = %name, "backend registered");
        self.backend_keys.push(name);
    }

    /// Registered names in registration order.
    pub fn backends(&self) -> &[String] {
        &self.backend_keys
    }

    /// A copy of the named backend.
    pub fn get_backend(&self, name: &str) -> GateResult<Backend> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| GateError::BackendNotFound(name.to_string()))
    }

    /// Look up `backend` and create a session on it.
    pub fn create_session(
        &self,
        backend: &str,
        session_id: &str,
        username: &str,
    ) -> GateResult<Box<dyn Session>> {
        self.get_backend(backend)?.create_session(session_id, username)
    }
}
