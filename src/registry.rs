use std::collections::BTreeMap;
use std::sync::Arc;

/// key: capability-registry -> name to implementation, resolved once at startup
pub struct Registry<T: ?Sized> {
    entries: BTreeMap<String, Arc<T>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Replaces any implementation previously registered under `name`.
    pub fn register(&mut self, name: impl Into<String>, implementation: Arc<T>) -> &mut Self {
        self.entries.insert(name.into(), implementation);
        self
    }

    pub fn with(mut self, name: impl Into<String>, implementation: Arc<T>) -> Self {
        self.register(name, implementation);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
