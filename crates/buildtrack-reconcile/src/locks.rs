use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use buildtrack_core::ObjectId;

/// One mutex per construction object. Runs for different objects proceed in parallel;
/// two runs for the same object are serialized. A handle is dropped from the registry
/// once its last user releases it.
#[derive(Debug, Default)]
pub struct ObjectLocks {
    locks: Mutex<HashMap<ObjectId, Arc<Mutex<()>>>>,
}

impl ObjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, object_id: ObjectId) -> Arc<Mutex<()>> {
        let mut locks = self.registry();
        Arc::clone(locks.entry(object_id).or_default())
    }

    pub fn with_lock<T>(&self, object_id: ObjectId, f: impl FnOnce() -> T) -> T {
        let handle = self.handle(object_id);
        let result = {
            let _guard: MutexGuard<'_, ()> =
                handle.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        self.release(object_id, handle);
        result
    }

    /// Number of objects with a live handle.
    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Clones are only handed out under the registry lock, so dropping ours under it and
    // seeing a count of one means nobody else holds or waits on the mutex.
    fn release(&self, object_id: ObjectId, handle: Arc<Mutex<()>>) {
        let mut locks = self.registry();
        drop(handle);
        let idle = locks
            .get(&object_id)
            .is_some_and(|held| Arc::strong_count(held) == 1);
        if idle {
            locks.remove(&object_id);
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<ObjectId, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
