//! Keyed stores for the layer's per-object state.
//!
//! Dispatchable Vulkan handles (instances, physical devices, devices, queues,
//! command buffers) all start with the loader's dispatch-table pointer, and
//! child handles alias their parent's. That first machine word is the lookup
//! key for instance and device state; queues and swapchains are keyed inside
//! their device's state by raw handle value.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ash::vk::Handle;

use crate::lock;

/// Dispatch-table pointer of a dispatchable handle, 0 for a null handle.
/// The handle must be a live dispatchable handle obtained from the loader;
/// its first machine word is the loader's dispatch table by contract.
pub fn dispatch_key<H: Handle>(handle: H) -> usize {
    let raw = handle.as_raw();
    if raw == 0 {
        return 0;
    }
    unsafe { *(raw as usize as *const usize) }
}

/// A mutex-guarded keyed store. Add, lookup and remove hold the lock only for
/// the operation itself; `walk` holds it across the whole traversal.
pub struct Registry<V> {
    entries: Mutex<HashMap<usize, Arc<V>>>,
}

impl<V> Registry<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: usize, value: Arc<V>) {
        lock(&self.entries).insert(key, value);
    }

    pub fn get(&self, key: usize) -> Option<Arc<V>> {
        lock(&self.entries).get(&key).cloned()
    }

    pub fn remove(&self, key: usize) -> Option<Arc<V>> {
        lock(&self.entries).remove(&key)
    }

    pub fn walk(&self, mut visit: impl FnMut(usize, &Arc<V>)) {
        for (key, value) in lock(&self.entries).iter() {
            visit(*key, value);
        }
    }
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let registry = Registry::new();
        registry.insert(0x10, Arc::new("a"));
        registry.insert(0x20, Arc::new("b"));

        assert_eq!(registry.get(0x10).as_deref(), Some(&"a"));
        assert_eq!(registry.get(0x30), None);

        assert_eq!(registry.remove(0x20).as_deref(), Some(&"b"));
        assert_eq!(registry.get(0x20), None);
    }

    #[test]
    fn walk_sees_every_entry() {
        let registry = Registry::new();
        for key in 1..=5usize {
            registry.insert(key, Arc::new(key * 10));
        }
        let mut seen = Vec::new();
        registry.walk(|key, value| seen.push((key, **value)));
        seen.sort_unstable();
        assert_eq!(seen, vec![(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)]);
    }

    #[test]
    fn replaced_entries_drop_the_old_value() {
        let registry = Registry::new();
        let first = Arc::new(1);
        registry.insert(7, first.clone());
        registry.insert(7, Arc::new(2));
        // only our local clone keeps the first value alive
        assert_eq!(Arc::strong_count(&first), 1);
        assert_eq!(registry.get(7).as_deref(), Some(&2));
    }
}
