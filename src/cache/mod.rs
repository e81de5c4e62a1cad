use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;

use crate::error::CacheError;
use crate::proxy::document::HttpDocument;
use crate::timeseries::Timeseries;

pub mod filesystem;
pub mod index;
pub mod memory;
pub mod sleddb;

const PREFIX_PLAIN: u8 = 0x00;
const PREFIX_SNAPPY: u8 = 0x01;

/// Outcome of a cache lookup, consumed by both control flow and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    Hit,
    PartialHit,
    RangeMiss,
    KeyMiss,
    Revalidated,
    NegativeCacheHit,
    ProxyOnly,
    Error,
}

impl LookupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LookupStatus::Hit => "hit",
            LookupStatus::PartialHit => "phit",
            LookupStatus::RangeMiss => "rmiss",
            LookupStatus::KeyMiss => "kmiss",
            LookupStatus::Revalidated => "revalidated",
            LookupStatus::NegativeCacheHit => "negative-hit",
            LookupStatus::ProxyOnly => "proxy-only",
            LookupStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Memory,
    Filesystem,
    Sled,
}

impl CacheType {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheType::Memory => "memory",
            CacheType::Filesystem => "filesystem",
            CacheType::Sled => "sled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendConfiguration {
    pub name: String,
    pub cache_type: CacheType,
}

/// Payload stored by reference on the in-memory backend, skipping the
/// serialization round trip entirely.
#[derive(Clone)]
pub enum CachedReference {
    Document(Arc<HttpDocument>),
    Timeseries(Arc<Timeseries>),
}

impl CachedReference {
    /// Approximate footprint for eviction accounting; serialized backends
    /// account exact byte lengths instead.
    pub fn weight(&self) -> u64 {
        match self {
            CachedReference::Document(d) => d.weight(),
            CachedReference::Timeseries(ts) => ts.size() as u64,
        }
    }
}

/// Key-to-bytes store with TTLs. `KeyNotFound` is the one and only miss
/// error; backends normalize any internal "not in cache" condition to it,
/// which keeps `LookupStatus::KeyMiss` and the error in lockstep.
pub trait CacheBackend: Send + Sync {
    fn retrieve(&self, key: &str, allow_touch: bool) -> Result<Vec<u8>, CacheError>;
    fn store(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;
    fn remove(&self, key: &str);
    fn bulk_remove(&self, keys: &[String]);
    fn set_ttl(&self, key: &str, ttl: Duration);
    fn close(&self);
    fn configuration(&self) -> BackendConfiguration;

    /// Reference-capable backends return themselves here; everyone else
    /// takes the serialized path.
    fn as_memory(&self) -> Option<&memory::MemoryBackend> {
        None
    }
}

/// Prepends the compression marker byte, snappy-compressing when asked.
pub fn wrap_payload(payload: &[u8], compress: bool) -> Vec<u8> {
    if compress {
        let compressed = snap::raw::Encoder::new()
            .compress_vec(payload)
            .unwrap_or_else(|_| payload.to_vec());
        let mut out = Vec::with_capacity(compressed.len() + 1);
        out.push(PREFIX_SNAPPY);
        out.extend_from_slice(&compressed);
        out
    } else {
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(PREFIX_PLAIN);
        out.extend_from_slice(payload);
        out
    }
}

/// Strips the marker byte, inflating snappy payloads. Unknown markers are
/// corrupt entries.
pub fn unwrap_payload(raw: &[u8]) -> Result<Vec<u8>, CacheError> {
    match raw.split_first() {
        Some((&PREFIX_PLAIN, rest)) => Ok(rest.to_vec()),
        Some((&PREFIX_SNAPPY, rest)) => snap::raw::Decoder::new()
            .decompress_vec(rest)
            .map_err(|_| CacheError::CorruptEntry),
        _ => Err(CacheError::CorruptEntry),
    }
}

/// Stored TTLs always land inside `[min, max]`.
pub fn clamp_ttl(ttl: Duration, min: Duration, max: Duration) -> Duration {
    ttl.clamp(min, max)
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}
