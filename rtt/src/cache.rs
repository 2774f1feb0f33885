// Look-aside cache in front of the aggregate store. A miss is not an error,
// the caller falls through to the store and fills the cache itself.
use crate::bucket::AddressBucket;
use crate::metrics_defs::{CACHE_HIT, CACHE_MISS};
use crate::types::ClientGroup;
use moka::sync::Cache;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct LookasideCache {
    cache: Cache<AddressBucket, Arc<ClientGroup>>,
}

impl LookasideCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();

        LookasideCache { cache }
    }

    pub fn get(&self, key: &AddressBucket) -> Option<Arc<ClientGroup>> {
        let hit = self.cache.get(key);
        let metric_def = if hit.is_some() { CACHE_HIT } else { CACHE_MISS };
        counter!(metric_def).increment(1);
        hit
    }

    pub fn set(&self, group: Arc<ClientGroup>) {
        self.cache.insert(group.bucket, group);
    }

    pub fn delete(&self, key: &AddressBucket) {
        self.cache.invalidate(key);
    }
}
