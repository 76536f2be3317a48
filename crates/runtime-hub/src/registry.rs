//! Runtime registry
//!
//! Maps logical names to runtime instances so independent parts of a process
//! can share runtimes by name. Instances are created lazily on first request
//! and at most one instance ever exists per name.

use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;

use crate::error::RuntimeError;
use crate::initializer::{RuntimeFactory, RuntimeInitializer};
use crate::runtime::{Runtime, RuntimeOptions};

/// Registry of named runtimes
///
/// Construct one per process and pass it to whoever needs runtimes.
pub struct RuntimeRegistry {
    /// Map of runtime name to instance
    runtimes: DashMap<String, Runtime>,

    /// Held while creating, so racing first requests build a single instance
    create_lock: Mutex<()>,

    factory: Arc<dyn RuntimeFactory>,
}

impl RuntimeRegistry {
    pub fn new(factory: impl RuntimeFactory + 'static) -> Self {
        Self {
            runtimes: DashMap::new(),
            create_lock: Mutex::new(()),
            factory: Arc::new(factory),
        }
    }

    /// The runtime registered under `name`, creating it if needed.
    ///
    /// `options` only matter for the call that creates the instance; they are
    /// ignored when the name is already registered.
    pub fn get_or_create(&self, name: &str, options: Option<RuntimeOptions>) -> Result<Runtime, RuntimeError> {
        if let Some(runtime) = self.lookup(name) {
            return Ok(runtime);
        }

        let _guard = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(runtime) = self.lookup(name) {
            return Ok(runtime);
        }

        let runtime = self.factory.create(name, options)?;
        self.runtimes.insert(name.to_string(), runtime.clone());
        tracing::info!(runtime = %name, "Registered runtime");
        Ok(runtime)
    }

    /// The runtime registered under `name`, without creating one
    pub fn lookup(&self, name: &str) -> Option<Runtime> {
        self.runtimes.get(name).map(|entry| entry.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.runtimes.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.runtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::new(RuntimeInitializer::new())
    }
}

impl std::fmt::Debug for RuntimeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeRegistry")
            .field("runtimes", &self.names())
            .finish()
    }
}
