use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::index::{spawn_reaper, CacheIndex, IndexOptions};
use crate::cache::{BackendConfiguration, CacheBackend, CacheType, CachedReference};
use crate::error::CacheError;

enum Payload {
    Bytes(Vec<u8>),
    Reference(CachedReference),
}

/// In-memory backend. Stores payloads by reference where possible so the
/// engines skip the serialization round trip entirely.
pub struct MemoryBackend {
    name: String,
    index: Arc<CacheIndex>,
    store: Arc<Mutex<HashMap<String, Payload>>>,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MemoryBackend {
    pub fn new(name: &str, opts: IndexOptions) -> Arc<Self> {
        let index = CacheIndex::new(name, opts);
        let store: Arc<Mutex<HashMap<String, Payload>>> = Arc::new(Mutex::new(HashMap::new()));
        let reap_store = Arc::clone(&store);
        let reaper = spawn_reaper(Arc::clone(&index), move |keys| {
            let mut map = reap_store.lock().expect("memory cache");
            for key in keys {
                map.remove(key);
            }
        });
        Arc::new(Self {
            name: name.to_string(),
            index,
            store,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    pub fn retrieve_reference(
        &self,
        key: &str,
        allow_touch: bool,
    ) -> Result<CachedReference, CacheError> {
        if !self.index.touch(key, allow_touch) {
            return Err(CacheError::KeyNotFound);
        }
        let store = self.store.lock().expect("memory cache");
        match store.get(key) {
            Some(Payload::Reference(r)) => Ok(r.clone()),
            Some(Payload::Bytes(_)) | None => Err(CacheError::KeyNotFound),
        }
    }

    pub fn store_reference(
        &self,
        key: &str,
        value: CachedReference,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        if !self.index.admits(value.weight()) {
            return Err(CacheError::ObjectTooLarge);
        }
        self.index.insert(key, value.weight(), ttl);
        let mut store = self.store.lock().expect("memory cache");
        store.insert(key.to_string(), Payload::Reference(value));
        Ok(())
    }
}

impl CacheBackend for MemoryBackend {
    fn retrieve(&self, key: &str, allow_touch: bool) -> Result<Vec<u8>, CacheError> {
        if !self.index.touch(key, allow_touch) {
            return Err(CacheError::KeyNotFound);
        }
        let store = self.store.lock().expect("memory cache");
        match store.get(key) {
            Some(Payload::Bytes(b)) => Ok(b.clone()),
            Some(Payload::Reference(_)) | None => Err(CacheError::KeyNotFound),
        }
    }

    fn store(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        if !self.index.admits(value.len() as u64) {
            return Err(CacheError::ObjectTooLarge);
        }
        self.index.insert(key, value.len() as u64, ttl);
        let mut store = self.store.lock().expect("memory cache");
        store.insert(key.to_string(), Payload::Bytes(value));
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.index.remove(key);
        self.store.lock().expect("memory cache").remove(key);
    }

    fn bulk_remove(&self, keys: &[String]) {
        let mut store = self.store.lock().expect("memory cache");
        for key in keys {
            self.index.remove(key);
            store.remove(key);
        }
    }

    fn set_ttl(&self, key: &str, ttl: Duration) {
        self.index.set_ttl(key, ttl);
    }

    fn close(&self) {
        if let Some(reaper) = self.reaper.lock().expect("memory cache").take() {
            reaper.abort();
        }
        self.store.lock().expect("memory cache").clear();
    }

    fn configuration(&self) -> BackendConfiguration {
        BackendConfiguration {
            name: self.name.clone(),
            cache_type: CacheType::Memory,
        }
    }

    fn as_memory(&self) -> Option<&MemoryBackend> {
        Some(self)
    }
}
