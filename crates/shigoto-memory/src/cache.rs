//! Mutex-guarded expiring key-value store.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use shigoto_core::backend::ResultCache;

use crate::lock;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-memory [`ResultCache`]. Clones share the same map.
///
/// Expiry is enforced lazily on read; a background eviction pass is not worth
/// having for the handful of short-lived keys this holds.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultCache for MemoryCache {
    type Error = Infallible;

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), Self::Error> {
        lock(&self.inner).insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        let mut inner = lock(&self.inner);
        match inner.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                inner.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}
