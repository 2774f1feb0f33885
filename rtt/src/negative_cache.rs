// Lightweight negative cache which temporarily remembers buckets that have no
// stored client group, so repeated resolutions for them skip the store.
use crate::bucket::AddressBucket;
use crate::metrics_defs::{NEGATIVE_CACHE_HIT, NEGATIVE_CACHE_MISS};
use moka::sync::Cache;
use shared::counter;
use std::time::Duration;

#[derive(Clone)]
pub struct NegativeCache {
    cache: Cache<AddressBucket, ()>,
}

impl NegativeCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();

        NegativeCache { cache }
    }

    pub fn insert(&self, key: AddressBucket) {
        self.cache.insert(key, ());
    }

    pub fn remove(&self, key: &AddressBucket) {
        self.cache.invalidate(key);
    }

    pub fn contains(&self, key: &AddressBucket) -> bool {
        let cache_hit = self.cache.contains_key(key);
        let metric_def = if cache_hit {
            NEGATIVE_CACHE_HIT
        } else {
            NEGATIVE_CACHE_MISS
        };
        counter!(metric_def).increment(1);
        cache_hit
    }
}
