use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha1::{Digest, Sha1};

use crate::cache::index::{spawn_reaper, CacheIndex, IndexOptions};
use crate::cache::unix_now;
use crate::cache::{BackendConfiguration, CacheBackend, CacheType};
use crate::error::CacheError;

/// Filesystem backend: one file per hashed key. Each file carries a small
/// header (expiry, original key) so the index can be rebuilt from a cold
/// directory.
pub struct FilesystemBackend {
    name: String,
    root: PathBuf,
    index: Arc<CacheIndex>,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

fn entry_path(root: &Path, key: &str) -> PathBuf {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    let hash = hex::encode(hasher.finalize());
    root.join(&hash[0..2]).join(format!("{hash}.bin"))
}

fn encode_entry(key: &str, expires: i64, value: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(12 + key.len() + value.len());
    data.extend_from_slice(&expires.to_le_bytes());
    data.extend_from_slice(&(key.len() as u32).to_le_bytes());
    data.extend_from_slice(key.as_bytes());
    data.extend_from_slice(value);
    data
}

// (expires, key, payload offset)
fn decode_header(data: &[u8]) -> Result<(i64, String, usize), CacheError> {
    if data.len() < 12 {
        return Err(CacheError::CorruptEntry);
    }
    let expires = i64::from_le_bytes(data[..8].try_into().unwrap());
    let key_len = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
    let body = 12 + key_len;
    if data.len() < body {
        return Err(CacheError::CorruptEntry);
    }
    let key = String::from_utf8(data[12..body].to_vec()).map_err(|_| CacheError::CorruptEntry)?;
    Ok((expires, key, body))
}

impl FilesystemBackend {
    pub fn new(name: &str, root: &Path, opts: IndexOptions) -> Result<Arc<Self>, CacheError> {
        std::fs::create_dir_all(root)
            .map_err(|err| CacheError::BackendUnavailable(err.to_string()))?;
        let index = CacheIndex::new(name, opts);
        seed_index(root, &index);

        let reap_root = root.to_path_buf();
        let reaper = spawn_reaper(Arc::clone(&index), move |keys| {
            for key in keys {
                let _ = std::fs::remove_file(entry_path(&reap_root, key));
            }
        });

        Ok(Arc::new(Self {
            name: name.to_string(),
            root: root.to_path_buf(),
            index,
            reaper: Mutex::new(Some(reaper)),
        }))
    }
}

// Seeds the index from whatever survives on disk. Recency is unknown for
// cold entries, so they all start equally old.
fn seed_index(root: &Path, index: &CacheIndex) {
    let now = unix_now();
    let Ok(shards) = std::fs::read_dir(root) else {
        return;
    };
    for shard in shards.flatten() {
        let Ok(files) = std::fs::read_dir(shard.path()) else {
            continue;
        };
        for file in files.flatten() {
            let Ok(data) = std::fs::read(file.path()) else {
                continue;
            };
            match decode_header(&data) {
                Ok((expires, key, body)) if expires > now => {
                    index.insert(
                        &key,
                        (data.len() - body) as u64,
                        Duration::from_secs((expires - now) as u64),
                    );
                }
                _ => {
                    let _ = std::fs::remove_file(file.path());
                }
            }
        }
    }
}

impl CacheBackend for FilesystemBackend {
    fn retrieve(&self, key: &str, allow_touch: bool) -> Result<Vec<u8>, CacheError> {
        if !self.index.touch(key, allow_touch) {
            return Err(CacheError::KeyNotFound);
        }
        let data = std::fs::read(entry_path(&self.root, key)).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CacheError::KeyNotFound
            } else {
                CacheError::BackendUnavailable(err.to_string())
            }
        })?;
        let (_, _, body) = decode_header(&data)?;
        Ok(data[body..].to_vec())
    }

    fn store(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        if !self.index.admits(value.len() as u64) {
            return Err(CacheError::ObjectTooLarge);
        }
        let path = entry_path(&self.root, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| CacheError::BackendUnavailable(err.to_string()))?;
        }
        let expires = unix_now() + ttl.as_secs() as i64;
        std::fs::write(&path, encode_entry(key, expires, &value))
            .map_err(|err| CacheError::BackendUnavailable(err.to_string()))?;
        self.index.insert(key, value.len() as u64, ttl);
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.index.remove(key);
        let _ = std::fs::remove_file(entry_path(&self.root, key));
    }

    fn bulk_remove(&self, keys: &[String]) {
        for key in keys {
            self.remove(key);
        }
    }

    fn set_ttl(&self, key: &str, ttl: Duration) {
        self.index.set_ttl(key, ttl);
        let path = entry_path(&self.root, key);
        if let Ok(mut data) = std::fs::read(&path) {
            if data.len() >= 8 {
                let expires = unix_now() + ttl.as_secs() as i64;
                data[..8].copy_from_slice(&expires.to_le_bytes());
                let _ = std::fs::write(&path, data);
            }
        }
    }

    fn close(&self) {
        if let Some(reaper) = self.reaper.lock().expect("fs cache").take() {
            reaper.abort();
        }
    }

    fn configuration(&self) -> BackendConfiguration {
        BackendConfiguration {
            name: self.name.clone(),
            cache_type: CacheType::Filesystem,
        }
    }
}
