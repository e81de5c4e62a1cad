use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    refs: usize,
}

/// Process-wide registry of per-key exclusive locks. Each key maps to a
/// reference-counted slot that is destroyed when the last holder or
/// waiter releases it, so the table never outgrows the set of keys
/// currently in flight.
#[derive(Default)]
pub struct KeyLockRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl KeyLockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Blocks until exclusive ownership of `key`. The returned guard is
    /// owned and may be moved into a task; dropping it releases the key
    /// on every exit path.
    pub async fn acquire(self: &Arc<Self>, key: &str) -> KeyLockGuard {
        let lock = {
            let mut slots = self.slots.lock().expect("keylock registry");
            let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                refs: 0,
            });
            slot.refs += 1;
            Arc::clone(&slot.lock)
        };
        let guard = lock.lock_owned().await;
        KeyLockGuard {
            registry: Arc::clone(self),
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().expect("keylock registry").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &str) {
        let mut slots = self.slots.lock().expect("keylock registry");
        if let Some(slot) = slots.get_mut(key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(key);
            }
        }
    }
}

pub struct KeyLockGuard {
    registry: Arc<KeyLockRegistry>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.registry.release(&self.key);
    }
}
