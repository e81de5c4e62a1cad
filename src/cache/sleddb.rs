use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::index::{spawn_reaper, CacheIndex, IndexOptions};
use crate::cache::unix_now;
use crate::cache::{BackendConfiguration, CacheBackend, CacheType};
use crate::error::CacheError;

/// Embedded-database backend on sled. Values carry the little-endian
/// expiry timestamp ahead of the payload; the index is rebuilt by a full
/// scan on open.
pub struct SledBackend {
    name: String,
    db: sled::Db,
    index: Arc<CacheIndex>,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

fn unavailable(err: sled::Error) -> CacheError {
    CacheError::BackendUnavailable(err.to_string())
}

impl SledBackend {
    pub fn new(name: &str, path: &Path, opts: IndexOptions) -> Result<Arc<Self>, CacheError> {
        let db = sled::open(path).map_err(unavailable)?;
        let index = CacheIndex::new(name, opts);

        let now = unix_now();
        for item in db.iter() {
            let Ok((key, value)) = item else { continue };
            let Ok(key) = String::from_utf8(key.to_vec()) else {
                continue;
            };
            if value.len() < 8 {
                let _ = db.remove(key.as_bytes());
                continue;
            }
            let expires = i64::from_le_bytes(value[..8].try_into().unwrap());
            if expires <= now {
                let _ = db.remove(key.as_bytes());
                continue;
            }
            index.insert(
                &key,
                (value.len() - 8) as u64,
                Duration::from_secs((expires - now) as u64),
            );
        }

        let reap_db = db.clone();
        let reaper = spawn_reaper(Arc::clone(&index), move |keys| {
            for key in keys {
                let _ = reap_db.remove(key.as_bytes());
            }
        });

        Ok(Arc::new(Self {
            name: name.to_string(),
            db,
            index,
            reaper: Mutex::new(Some(reaper)),
        }))
    }
}

impl CacheBackend for SledBackend {
    fn retrieve(&self, key: &str, allow_touch: bool) -> Result<Vec<u8>, CacheError> {
        if !self.index.touch(key, allow_touch) {
            return Err(CacheError::KeyNotFound);
        }
        let value = self
            .db
            .get(key.as_bytes())
            .map_err(unavailable)?
            .ok_or(CacheError::KeyNotFound)?;
        if value.len() < 8 {
            return Err(CacheError::CorruptEntry);
        }
        Ok(value[8..].to_vec())
    }

    fn store(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        if !self.index.admits(value.len() as u64) {
            return Err(CacheError::ObjectTooLarge);
        }
        let expires = unix_now() + ttl.as_secs() as i64;
        let mut data = Vec::with_capacity(8 + value.len());
        data.extend_from_slice(&expires.to_le_bytes());
        data.extend_from_slice(&value);
        self.db.insert(key.as_bytes(), data).map_err(unavailable)?;
        self.index.insert(key, value.len() as u64, ttl);
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.index.remove(key);
        let _ = self.db.remove(key.as_bytes());
    }

    fn bulk_remove(&self, keys: &[String]) {
        for key in keys {
            self.remove(key);
        }
    }

    fn set_ttl(&self, key: &str, ttl: Duration) {
        self.index.set_ttl(key, ttl);
        if let Ok(Some(value)) = self.db.get(key.as_bytes()) {
            if value.len() >= 8 {
                let mut data = value.to_vec();
                let expires = unix_now() + ttl.as_secs() as i64;
                data[..8].copy_from_slice(&expires.to_le_bytes());
                let _ = self.db.insert(key.as_bytes(), data);
            }
        }
    }

    fn close(&self) {
        if let Some(reaper) = self.reaper.lock().expect("sled cache").take() {
            reaper.abort();
        }
        let _ = self.db.flush();
    }

    fn configuration(&self) -> BackendConfiguration {
        BackendConfiguration {
            name: self.name.clone(),
            cache_type: CacheType::Sled,
        }
    }
}
