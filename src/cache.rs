//! Read-through content cache hook.
//!
//! Vault nodes on a forwarding path may answer cacheable requests from
//! here instead of routing them onward, and they opportunistically store
//! a copy of cacheable responses flowing through them. Requests are
//! keyed by the content's group address.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use tracing::trace;

use crate::common::Id;
use crate::config::MAX_CACHED_VALUES;
use crate::messages::Message;

pub struct CacheManager {
    values: Mutex<LruCache<Id, Vec<u8>>>,
}

impl CacheManager {
    pub fn new() -> CacheManager {
        CacheManager {
            values: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_CACHED_VALUES).expect("cache size is non-zero"),
            )),
        }
    }

    // === Public Methods ===

    /// Serves a cacheable request from the cache, if the content named
    /// by its destination is held here.
    pub fn lookup(&self, message: &Message) -> Option<Vec<u8>> {
        let key = message.destination_id?;
        let mut values = self.values.lock().unwrap();

        let hit = values.get(&key).cloned();
        if hit.is_some() {
            trace!(key = ?key, message_id = message.id, "Cache hit");
        }
        hit
    }

    /// Stores a copy of a cacheable response flowing through this node.
    pub fn store_copy(&self, message: &Message) {
        let Some(key) = message.group_claim.or(message.source_id) else {
            return;
        };
        let Some(payload) = message.data.first() else {
            return;
        };

        self.values.lock().unwrap().put(key, payload.clone());
        trace!(key = ?key, message_id = message.id, "Stored cache copy");
    }

    pub fn len(&self) -> usize {
        self.values.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        CacheManager::new()
    }
}
