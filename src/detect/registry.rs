use std::collections::HashMap;

use anyhow::{anyhow, Result};

use super::backend::InferenceBackend;
use super::backends::StubBackend;

/// Named inference backends available to this build.
///
/// The configured backend is taken out of the registry and moved onto the
/// inference worker thread.
pub struct BackendRegistry {
    backends: HashMap<String, Box<dyn InferenceBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Registry with the backends bundled in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(StubBackend::new());
        registry
    }

    /// Register a backend under its own name, replacing any previous one.
    pub fn register<B: InferenceBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        self.backends.insert(name, Box::new(backend));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Remove and return the backend named `name`.
    pub fn take(&mut self, name: &str) -> Result<Box<dyn InferenceBackend>> {
        self.backends.remove(name).ok_or_else(|| {
            anyhow!(
                "inference backend '{}' not registered (available: {})",
                name,
                self.list().join(", ")
            )
        })
    }

    /// List registered backends, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
