//! Read-mostly instance lookup table

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::InstanceConfig;

type InstanceMap = HashMap<String, Arc<InstanceConfig>>;

/// Lookup table `name → InstanceConfig`.
///
/// Readers clone the inner `Arc` under a briefly-held read lock; no
/// suspension point ever holds the lock. `replace_all` swaps the whole map
/// pointer, so an in-flight request observes either the old table or the
/// new one, never a mix.
pub struct InstanceRegistry {
    inner: RwLock<Arc<InstanceMap>>,
}

impl InstanceRegistry {
    /// Build a registry from a plain instance map.
    pub fn new(instances: HashMap<String, InstanceConfig>) -> Self {
        Self {
            inner: RwLock::new(Arc::new(Self::wrap(instances))),
        }
    }

    /// Look up an instance by name.
    pub fn get(&self, name: &str) -> Option<Arc<InstanceConfig>> {
        self.inner.read().unwrap().get(name).cloned()
    }

    /// Atomically replace the whole instance table.
    pub fn replace_all(&self, instances: HashMap<String, InstanceConfig>) {
        let map = Arc::new(Self::wrap(instances));
        *self.inner.write().unwrap() = map;
    }

    /// Snapshot of the current table, for the debug endpoint.
    pub fn snapshot(&self) -> Arc<InstanceMap> {
        self.inner.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn wrap(instances: HashMap<String, InstanceConfig>) -> InstanceMap {
        instances
            .into_iter()
            .map(|(name, config)| (name, Arc::new(config)))
            .collect()
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}
