//! Client-side cache: a bounded LRU of the most recent `GET` replies,
//! evicted by server invalidation traffic.

use crate::types::Value;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::debug;

/// The pub/sub channel the server announces invalidations on when a
/// RESP2 sibling connection is used.
pub(crate) const INVALIDATION_CHANNEL: &str = "__redis__:invalidate";

#[derive(Debug)]
pub(crate) struct ClientCache {
    entries: Mutex<LruCache<Vec<u8>, Value>>,
}

impl ClientCache {
    pub(crate) fn new(capacity: usize) -> ClientCache {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        ClientCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the cached reply for `key`, marking it most recently
    /// used.
    pub(crate) fn lookup(&self, key: &[u8]) -> Option<Value> {
        let mut entries = self.entries.lock().ok()?;
        entries.get(key).cloned()
    }

    /// Stores a `GET` reply, evicting the least recently used entry
    /// when full.
    pub(crate) fn store(&self, key: Vec<u8>, value: Value) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(key, value);
        }
    }

    /// Removes one key. A miss is a no-op.
    pub(crate) fn invalidate(&self, key: &[u8]) {
        if let Ok(mut entries) = self.entries.lock() {
            if entries.pop(key).is_some() {
                debug!(key = %String::from_utf8_lossy(key), "invalidated cached entry");
            }
        }
    }

    /// Drops every entry; the server sends a nil invalidation when the
    /// whole tracking table was flushed.
    pub(crate) fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    /// Applies one invalidation payload: an array of keys, a single
    /// key, or nil for flush-all.
    pub(crate) fn apply_invalidation(&self, payload: &Value) {
        match payload {
            Value::Array(keys) => {
                for key in keys {
                    if let Some(key) = key.as_bytes() {
                        self.invalidate(key);
                    }
                }
            }
            Value::Nil => self.clear(),
            other => {
                if let Some(key) = other.as_bytes() {
                    self.invalidate(key);
                }
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }
}
