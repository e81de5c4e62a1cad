use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;

use crate::cache::unix_now;
use crate::metrics;

/// Eviction and expiry policy knobs shared by every backend.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub max_size_bytes: u64,
    pub max_size_backoff_bytes: u64,
    pub max_size_objects: u64,
    pub max_size_backoff_objects: u64,
    pub max_object_size_bytes: u64,
    pub reap_interval: Duration,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            max_size_bytes: 536_870_912,
            max_size_backoff_bytes: 16_777_216,
            max_size_objects: 0,
            max_size_backoff_objects: 100,
            max_object_size_bytes: 524_288,
            reap_interval: Duration::from_secs(3),
        }
    }
}

// Recency lives in the map's insertion order: touch re-appends, eviction
// pops the front.
#[derive(Debug, Clone)]
struct IndexEntry {
    size: u64,
    expires: i64,
}

struct IndexState {
    // insertion order doubles as recency order: touch re-appends
    entries: IndexMap<String, IndexEntry>,
    bytes: u64,
}

/// Object index shared by all backends: tracks size, expiry, and recency
/// per key, and decides which keys the reaper removes. Payload deletion is
/// the owning backend's job.
pub struct CacheIndex {
    name: String,
    opts: IndexOptions,
    state: Mutex<IndexState>,
}

impl CacheIndex {
    pub fn new(name: &str, opts: IndexOptions) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            opts,
            state: Mutex::new(IndexState {
                entries: IndexMap::new(),
                bytes: 0,
            }),
        })
    }

    pub fn options(&self) -> &IndexOptions {
        &self.opts
    }

    /// Whether an object of `size` bytes is small enough to cache at all.
    pub fn admits(&self, size: u64) -> bool {
        self.opts.max_object_size_bytes == 0 || size <= self.opts.max_object_size_bytes
    }

    pub fn insert(&self, key: &str, size: u64, ttl: Duration) {
        let now = unix_now();
        let mut state = self.state.lock().expect("cache index");
        if let Some(old) = state.entries.shift_remove(key) {
            state.bytes -= old.size;
        }
        state.entries.insert(
            key.to_string(),
            IndexEntry {
                size,
                expires: now + ttl.as_secs() as i64,
            },
        );
        state.bytes += size;
        self.publish(&state);
    }

    /// Refreshes recency; returns false when the key is unknown or past
    /// its expiry (the caller treats both as a miss).
    pub fn touch(&self, key: &str, allow_touch: bool) -> bool {
        let now = unix_now();
        let mut state = self.state.lock().expect("cache index");
        let Some(entry) = state.entries.get(key).cloned() else {
            return false;
        };
        if entry.expires <= now {
            return false;
        }
        if allow_touch {
            state.entries.shift_remove(key);
            state.entries.insert(key.to_string(), entry);
        }
        true
    }

    pub fn remove(&self, key: &str) {
        let mut state = self.state.lock().expect("cache index");
        if let Some(old) = state.entries.shift_remove(key) {
            state.bytes -= old.size;
        }
        self.publish(&state);
    }

    pub fn set_ttl(&self, key: &str, ttl: Duration) {
        let now = unix_now();
        let mut state = self.state.lock().expect("cache index");
        if let Some(entry) = state.entries.get_mut(key) {
            entry.expires = now + ttl.as_secs() as i64;
        }
    }

    pub fn object_count(&self) -> u64 {
        self.state.lock().expect("cache index").entries.len() as u64
    }

    pub fn byte_size(&self) -> u64 {
        self.state.lock().expect("cache index").bytes
    }

    /// One reaper tick: expired keys first, then least-recently-used
    /// overflow down to the backoff marks. Returns the keys whose payloads
    /// the backend must delete.
    pub fn reap(&self) -> Vec<String> {
        let now = unix_now();
        let mut victims = Vec::new();
        let mut state = self.state.lock().expect("cache index");

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.expires <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(old) = state.entries.shift_remove(&key) {
                state.bytes -= old.size;
            }
            victims.push(key);
        }

        if self.opts.max_size_bytes > 0 && state.bytes > self.opts.max_size_bytes {
            let floor = self
                .opts
                .max_size_bytes
                .saturating_sub(self.opts.max_size_backoff_bytes);
            while state.bytes > floor {
                let Some((key, old)) = state.entries.shift_remove_index(0) else {
                    break;
                };
                state.bytes -= old.size;
                victims.push(key);
            }
        }

        if self.opts.max_size_objects > 0
            && state.entries.len() as u64 > self.opts.max_size_objects
        {
            let floor = self
                .opts
                .max_size_objects
                .saturating_sub(self.opts.max_size_backoff_objects);
            while state.entries.len() as u64 > floor {
                let Some((key, old)) = state.entries.shift_remove_index(0) else {
                    break;
                };
                state.bytes -= old.size;
                victims.push(key);
            }
        }

        self.publish(&state);
        victims
    }

    fn publish(&self, state: &IndexState) {
        metrics::set_cache_usage(&self.name, state.entries.len() as u64, state.bytes);
    }
}

/// Runs the reap loop until the returned handle is aborted. `delete` is
/// the backend's payload removal hook; it must not block on request-path
/// locks.
pub fn spawn_reaper<F>(index: Arc<CacheIndex>, delete: F) -> tokio::task::JoinHandle<()>
where
    F: Fn(&[String]) + Send + 'static,
{
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(index.options().reap_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let victims = index.reap();
            if !victims.is_empty() {
                log::debug!("cache reap removed {} entries", victims.len());
                delete(&victims);
            }
        }
    })
}
