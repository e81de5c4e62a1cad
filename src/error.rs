use thiserror::Error;

/// Errors surfaced by cache backends. `KeyNotFound` always coincides with
/// `LookupStatus::KeyMiss`; anything a backend reports as "not in cache"
/// must be normalized to it before leaving the backend.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("key not found in cache")]
    KeyNotFound,

    #[error("corrupt cache entry")]
    CorruptEntry,

    #[error("cache backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("object exceeds the cache's max object size")]
    ObjectTooLarge,
}

impl CacheError {
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, CacheError::KeyNotFound)
    }
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("origin returned {status}: {message}")]
    Origin { status: u16, message: String },

    #[error("unsupported or unparsable range query: {0}")]
    QueryParse(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("origin deadline exceeded")]
    DeadlineExceeded,
}
