use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::cache::index::IndexOptions;
use crate::cache::CacheType;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub caches: Vec<CacheConfig>,
    #[serde(default)]
    pub origins: Vec<OriginConfig>,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if self.origins.is_empty() {
            return Err(anyhow!("at least one origin is required"));
        }
        let cache_names: Vec<&str> = self.caches.iter().map(|c| c.name.as_str()).collect();
        for origin in &self.origins {
            if origin.name.trim().is_empty() {
                return Err(anyhow!("origin.name is required"));
            }
            if origin.origin_url.trim().is_empty() {
                return Err(anyhow!("origin {}: origin_url is required", origin.name));
            }
            if !cache_names.contains(&origin.cache_name.as_str()) {
                return Err(anyhow!(
                    "origin {}: unknown cache {}",
                    origin.name,
                    origin.cache_name
                ));
            }
            if !(0.0..=1.0).contains(&origin.missing_tolerance_ratio) {
                return Err(anyhow!(
                    "origin {}: missing_tolerance_ratio must be within [0, 1]",
                    origin.name
                ));
            }
            if origin.min_ttl_secs > origin.max_ttl_secs {
                return Err(anyhow!(
                    "origin {}: min_ttl_secs exceeds max_ttl_secs",
                    origin.name
                ));
            }
        }
        for cache in &self.caches {
            if cache.cache_type != CacheType::Memory && cache.cache_path.trim().is_empty() {
                return Err(anyhow!("cache {}: cache_path is required", cache.name));
            }
        }
        Ok(())
    }

    pub fn cache(&self, name: &str) -> Option<&CacheConfig> {
        self.caches.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    /// Rotate the log file after this many MiB; 0 disables rotation.
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
}

#[derive(Debug, Deserialize)]
pub struct Server {
    #[serde(default)]
    pub addr: String,
    /// Total deadline for one proxied request, origin fetches included.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            addr: String::new(),
            request_timeout: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(240)
}

#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    pub name: String,
    #[serde(default = "default_cache_type")]
    pub cache_type: CacheType,
    #[serde(default)]
    pub cache_path: String,
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
    #[serde(default = "default_max_size_backoff_bytes")]
    pub max_size_backoff_bytes: u64,
    #[serde(default)]
    pub max_size_objects: u64,
    #[serde(default = "default_max_size_backoff_objects")]
    pub max_size_backoff_objects: u64,
    #[serde(default = "default_max_object_size_bytes")]
    pub max_object_size_bytes: u64,
    #[serde(default = "default_index_reap_secs")]
    pub index_reap_secs: u64,
}

impl CacheConfig {
    pub fn index_options(&self) -> IndexOptions {
        IndexOptions {
            max_size_bytes: self.max_size_bytes,
            max_size_backoff_bytes: self.max_size_backoff_bytes,
            max_size_objects: self.max_size_objects,
            max_size_backoff_objects: self.max_size_backoff_objects,
            max_object_size_bytes: self.max_object_size_bytes,
            reap_interval: Duration::from_secs(self.index_reap_secs.max(1)),
        }
    }
}

fn default_cache_type() -> CacheType {
    CacheType::Memory
}

fn default_max_size_bytes() -> u64 {
    536_870_912
}

fn default_max_size_backoff_bytes() -> u64 {
    16_777_216
}

fn default_max_size_backoff_objects() -> u64 {
    100
}

fn default_max_object_size_bytes() -> u64 {
    524_288
}

fn default_index_reap_secs() -> u64 {
    3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionMethod {
    Oldest,
    Lru,
}

impl Default for EvictionMethod {
    fn default() -> Self {
        EvictionMethod::Oldest
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OriginConfig {
    pub name: String,
    #[serde(default = "default_origin_type")]
    pub origin_type: String,
    pub origin_url: String,
    #[serde(default = "default_cache_name")]
    pub cache_name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_timeseries_ttl_secs")]
    pub timeseries_ttl_secs: u64,
    #[serde(default = "default_fast_forward_ttl_secs")]
    pub fast_forward_ttl_secs: u64,
    #[serde(default)]
    pub min_ttl_secs: u64,
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,
    #[serde(default = "default_revalidation_factor")]
    pub revalidation_factor: f64,
    #[serde(default)]
    pub backfill_tolerance_secs: u64,
    #[serde(default = "default_max_value_age_secs")]
    pub max_value_age_secs: u64,
    #[serde(default = "default_retention_factor")]
    pub timeseries_retention_factor: usize,
    #[serde(default)]
    pub timeseries_eviction_method: EvictionMethod,
    #[serde(default = "default_missing_tolerance_ratio")]
    pub missing_tolerance_ratio: f64,
    #[serde(default = "default_compressible_types")]
    pub compressible_types: Vec<String>,
    /// HTTP status code -> TTL seconds for negative caching.
    #[serde(default)]
    pub negative_cache: HashMap<u16, u64>,
    #[serde(default = "default_origin_timeout_secs")]
    pub origin_timeout_secs: u64,
    #[serde(default = "default_keep_alive_timeout_secs")]
    pub keep_alive_timeout_secs: u64,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,
    #[serde(default)]
    pub fast_forward_disable: bool,
}

impl OriginConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.origin_timeout_secs.max(1))
    }

    pub fn min_ttl(&self) -> Duration {
        Duration::from_secs(self.min_ttl_secs)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs.max(1))
    }

    pub fn timeseries_ttl(&self) -> Duration {
        Duration::from_secs(self.timeseries_ttl_secs.max(1))
    }

    pub fn is_compressible(&self, media_type: &str) -> bool {
        let mt = media_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.compressible_types.iter().any(|t| t == &mt)
    }
}

fn default_origin_type() -> String {
    "tsjson".to_string()
}

fn default_cache_name() -> String {
    "default".to_string()
}

fn default_timeseries_ttl_secs() -> u64 {
    21_600
}

fn default_fast_forward_ttl_secs() -> u64 {
    15
}

fn default_max_ttl_secs() -> u64 {
    86_400
}

fn default_revalidation_factor() -> f64 {
    2.0
}

fn default_max_value_age_secs() -> u64 {
    86_400
}

fn default_retention_factor() -> usize {
    1024
}

fn default_missing_tolerance_ratio() -> f64 {
    0.05
}

fn default_origin_timeout_secs() -> u64 {
    180
}

fn default_keep_alive_timeout_secs() -> u64 {
    300
}

fn default_max_idle_conns() -> usize {
    20
}

fn default_compressible_types() -> Vec<String> {
    [
        "text/html",
        "text/javascript",
        "text/css",
        "text/plain",
        "text/xml",
        "text/json",
        "application/json",
        "application/javascript",
        "application/xml",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn load(path: &Path) -> Result<Bootstrap> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let cfg: Bootstrap = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse config {}", path.display()))?;
    Ok(cfg)
}
