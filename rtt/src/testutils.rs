use crate::bucket::AddressBucket;
use crate::cache::LookasideCache;
use crate::negative_cache::NegativeCache;
use crate::query::{QueryError, QueryReport, QuerySource, QueryWindow};
use crate::registry::{Server, StaticRegistry};
use crate::resolver::ProximityResolver;
use crate::store::{AggregateStore, MemoryStore, ReadOutcome, StoreError};
use crate::types::{ClientGroup, RawSample};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

pub fn sample(t: i64, server_ip: &str, client_ip: &str, rtt: f64) -> RawSample {
    RawSample {
        logged_at: ts(t),
        server_ip: server_ip.parse().unwrap(),
        client_ip: client_ip.parse().unwrap(),
        rtt,
    }
}

pub fn server(site_id: &str, fqdn: &str, ipv4: &str, online: bool) -> Server {
    Server {
        service_id: "ndt".into(),
        site_id: site_id.into(),
        fqdn: fqdn.into(),
        ipv4: Some(ipv4.parse().unwrap()),
        ipv6: None,
        online,
    }
}

/// A registry with one online "ndt" server per `(ip, site)` pair.
pub fn registry_with(servers: &[(&str, &str)]) -> StaticRegistry {
    StaticRegistry::new(
        servers
            .iter()
            .map(|(ip, site)| server(site, &format!("ndt.{site}"), ip, true)),
    )
}

pub fn resolver_for<S: AggregateStore + 'static>(
    store: Arc<S>,
    registry: StaticRegistry,
) -> ProximityResolver {
    ProximityResolver::new(
        store,
        Arc::new(registry),
        LookasideCache::new(100, Duration::from_secs(60)),
        NegativeCache::new(100, Duration::from_secs(60)),
        Duration::from_secs(5),
    )
}

/// Wraps a [`MemoryStore`] and injects failures.
#[derive(Default)]
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    failing_keys: HashSet<AddressBucket>,
    bulk_read_failures: AtomicUsize,
    write_failures: AtomicUsize,
    read_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        FlakyStore::default()
    }

    pub fn from_store(inner: Arc<MemoryStore>) -> Self {
        FlakyStore {
            inner,
            ..Default::default()
        }
    }

    /// Reads of these keys always report a per-key failure.
    pub fn fail_reads_for(mut self, keys: impl IntoIterator<Item = AddressBucket>) -> Self {
        self.failing_keys.extend(keys);
        self
    }

    /// The next `n` bulk reads fail as a whole.
    pub fn fail_bulk_reads(self, n: usize) -> Self {
        self.bulk_read_failures.store(n, Ordering::SeqCst);
        self
    }

    /// The next `n` bulk writes fail as a whole.
    pub fn fail_writes(self, n: usize) -> Self {
        self.write_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AggregateStore for FlakyStore {
    async fn get_multi(&self, keys: &[AddressBucket]) -> Result<Vec<ReadOutcome>, StoreError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.bulk_read_failures) {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }

        let outcomes = self.inner.get_multi(keys).await?;
        Ok(keys
            .iter()
            .zip(outcomes)
            .map(|(key, outcome)| {
                if self.failing_keys.contains(key) {
                    let err = StoreError::Unavailable(format!("injected failure for {key}"));
                    ReadOutcome::Failed(err)
                } else {
                    outcome
                }
            })
            .collect())
    }

    async fn put_multi(&self, groups: &[ClientGroup]) -> Result<(), StoreError> {
        if Self::take_failure(&self.write_failures) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        self.inner.put_multi(groups).await
    }
}

/// A store that answers only after a fixed delay. Meant for tests running on
/// paused time.
#[derive(Default)]
pub struct SlowStore {
    inner: MemoryStore,
    read_delay: Duration,
    write_delay: Duration,
}

impl SlowStore {
    pub fn new() -> Self {
        SlowStore::default()
    }

    pub fn slow_reads(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn slow_writes(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl AggregateStore for SlowStore {
    async fn get_multi(&self, keys: &[AddressBucket]) -> Result<Vec<ReadOutcome>, StoreError> {
        tokio::time::sleep(self.read_delay).await;
        self.inner.get_multi(keys).await
    }

    async fn put_multi(&self, groups: &[ClientGroup]) -> Result<(), StoreError> {
        tokio::time::sleep(self.write_delay).await;
        self.inner.put_multi(groups).await
    }
}

#[derive(Default)]
struct QueryLog {
    windows: Vec<QueryWindow>,
    failures_left: usize,
}

/// Returns the same canned pages for every window it is asked about.
#[derive(Clone, Default)]
pub struct StaticQuerySource {
    pages: Arc<Vec<Vec<RawSample>>>,
    log: Arc<Mutex<QueryLog>>,
}

impl StaticQuerySource {
    pub fn new(pages: Vec<Vec<RawSample>>) -> Self {
        StaticQuerySource {
            pages: Arc::new(pages),
            log: Arc::default(),
        }
    }

    /// The first `n` fetches fail with a transient error.
    pub fn fail_first(self, n: usize) -> Self {
        self.log.lock().failures_left = n;
        self
    }

    /// Every window fetched so far, failed attempts included.
    pub fn windows(&self) -> Vec<QueryWindow> {
        self.log.lock().windows.clone()
    }
}

#[async_trait]
impl QuerySource for StaticQuerySource {
    async fn fetch(
        &self,
        window: &QueryWindow,
        on_page: &mut (dyn FnMut(Vec<RawSample>) + Send),
    ) -> Result<QueryReport, QueryError> {
        {
            let mut log = self.log.lock();
            log.windows.push(window.clone());
            if log.failures_left > 0 {
                log.failures_left -= 1;
                return Err(QueryError::InvalidResponse("injected failure".into()));
            }
        }

        let total_rows: usize = self.pages.iter().map(Vec::len).sum();
        if total_rows == 0 {
            return Err(QueryError::NoData);
        }
        for page in self.pages.iter() {
            on_page(page.clone());
        }
        Ok(QueryReport {
            total_rows: total_rows as u64,
            pages: self.pages.len() as u64,
            skipped_rows: 0,
        })
    }
}
