use crate::bucket::{AddressBucket, BucketError, bucket};
use crate::cache::LookasideCache;
use crate::metrics_defs::RESOLVE_REQUESTS;
use crate::negative_cache::NegativeCache;
use crate::registry::SiteRegistry;
use crate::store::{AggregateStore, StoreError};
use crate::types::{ClientGroup, ServerAddress};
use shared::counter;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),

    // No stored client group, or no site in it has an eligible server.
    #[error("insufficient data to resolve this address")]
    InsufficientData,

    #[error("store error: {0}")]
    Storage(#[from] StoreError),
}

impl From<BucketError> for ResolveError {
    fn from(err: BucketError) -> Self {
        match err {
            BucketError::InvalidAddress(addr) => ResolveError::InvalidAddress(addr),
        }
    }
}

impl ResolveError {
    fn outcome(&self) -> &'static str {
        match self {
            ResolveError::InvalidAddress(_) => "invalid_address",
            ResolveError::InsufficientData => "insufficient_data",
            ResolveError::Storage(_) => "storage_error",
        }
    }
}

/// Picks a server for a client from the sites with the lowest measured RTT
/// to the client's bucket. Stateless; calls may run concurrently.
#[derive(Clone)]
pub struct ProximityResolver {
    store: Arc<dyn AggregateStore>,
    registry: Arc<dyn SiteRegistry>,
    cache: LookasideCache,
    negative_cache: NegativeCache,
    op_timeout: Duration,
}

impl ProximityResolver {
    pub fn new(
        store: Arc<dyn AggregateStore>,
        registry: Arc<dyn SiteRegistry>,
        cache: LookasideCache,
        negative_cache: NegativeCache,
        op_timeout: Duration,
    ) -> Self {
        ProximityResolver {
            store,
            registry,
            cache,
            negative_cache,
            op_timeout,
        }
    }

    pub async fn resolve(
        &self,
        client_ip: &str,
        service_id: &str,
    ) -> Result<ServerAddress, ResolveError> {
        let result = match bucket(client_ip) {
            Ok(key) => self.resolve_bucket(key, service_id).await,
            Err(err) => Err(err.into()),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.outcome(),
        };
        counter!(RESOLVE_REQUESTS, "outcome" => outcome).increment(1);
        result
    }

    async fn resolve_bucket(
        &self,
        key: AddressBucket,
        service_id: &str,
    ) -> Result<ServerAddress, ResolveError> {
        let group = self.client_group(key).await?;

        // Sites are stored best first. A site without an eligible server is
        // skipped rather than failing the whole resolution.
        for site_rtt in &group.site_rtts {
            if let Some(server) = self
                .registry
                .random_online_server(&site_rtt.site_id, service_id)
            {
                return Ok(server);
            }
            tracing::debug!(
                site = %site_rtt.site_id,
                service = service_id,
                "no online server at site, trying next"
            );
        }

        Err(ResolveError::InsufficientData)
    }

    /// Probes the store with a single read, bypassing the caches.
    pub async fn check_store(&self) -> Result<(), ResolveError> {
        let key = AddressBucket::of(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        match timeout(self.op_timeout, self.store.get_multi(&[key])).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(StoreError::Timeout.into()),
        }
    }

    async fn client_group(&self, key: AddressBucket) -> Result<Arc<ClientGroup>, ResolveError> {
        if let Some(group) = self.cache.get(&key) {
            return Ok(group);
        }
        if self.negative_cache.contains(&key) {
            return Err(ResolveError::InsufficientData);
        }

        let stored = match timeout(self.op_timeout, self.store.get(&key)).await {
            Ok(result) => result?,
            Err(_) => return Err(StoreError::Timeout.into()),
        };

        match stored {
            Some(group) if !group.is_empty() => {
                let group = Arc::new(group);
                self.cache.set(group.clone());
                Ok(group)
            }
            _ => {
                self.negative_cache.insert(key);
                Err(ResolveError::InsufficientData)
            }
        }
    }
}
