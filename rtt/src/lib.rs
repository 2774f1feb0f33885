pub mod aggregate;
pub mod api;
pub mod bucket;
pub mod cache;
pub mod config;
pub mod import;
pub mod ledger;
pub mod metrics_defs;
pub mod negative_cache;
pub mod query;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod sync;
pub mod types;

#[cfg(test)]
mod testutils;

use crate::api::{ApiError, AppState};
use crate::cache::LookasideCache;
use crate::config::{Config, Listener, StoreType};
use crate::import::Importer;
use crate::ledger::{FileLedger, ImportLedger, MemoryLedger};
use crate::negative_cache::NegativeCache;
use crate::query::{HttpQuerySource, QueryError};
use crate::registry::{RegistryError, StaticRegistry};
use crate::resolver::ProximityResolver;
use crate::store::{AggregateStore, FileStore, MemoryStore, StoreError};
use crate::sync::{BatchSynchronizer, SyncError};
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum RttError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("query source error: {0}")]
    Query(#[from] QueryError),
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("no query source configured")]
    NoQuerySource,
}

pub fn get_store(store_type: &StoreType) -> Result<Arc<dyn AggregateStore>, StoreError> {
    let store: Arc<dyn AggregateStore> = match store_type {
        StoreType::Memory => Arc::new(MemoryStore::new()),
        StoreType::Filesystem { path } => Arc::new(FileStore::open(path)?),
    };
    Ok(store)
}

/// The resolver and importer wired to one store and registry.
pub struct Service {
    listener: Listener,
    resolver: ProximityResolver,
    importer: Option<Arc<Importer>>,
}

impl Service {
    pub fn build(config: &Config) -> Result<Self, RttError> {
        let store = get_store(&config.store.r#type)?;
        let registry = Arc::new(StaticRegistry::from_file(&config.registry.path)?);
        tracing::info!(servers = registry.len(), "loaded server registry");

        let cache = LookasideCache::new(config.cache.capacity, config.cache.ttl());
        let negative_cache =
            NegativeCache::new(config.negative_cache.capacity, config.negative_cache.ttl());

        let resolver = ProximityResolver::new(
            store.clone(),
            registry.clone(),
            cache.clone(),
            negative_cache.clone(),
            Duration::from_secs(config.sync.op_timeout_secs),
        );

        let importer = match &config.query_source {
            Some(query_source) => {
                let source = Arc::new(HttpQuerySource::new(query_source)?);
                let synchronizer = BatchSynchronizer::new(store, &config.sync)?
                    .with_caches(cache, negative_cache);
                let ledger: Arc<dyn ImportLedger> = match &config.ledger {
                    Some(ledger) => Arc::new(FileLedger::new(&ledger.path)),
                    None => Arc::new(MemoryLedger::new()),
                };
                Some(Arc::new(Importer::new(
                    source,
                    registry,
                    synchronizer,
                    ledger,
                    (&config.retry).into(),
                )))
            }
            None => {
                tracing::warn!("no query source configured, imports are disabled");
                None
            }
        };

        Ok(Service {
            listener: config.listener.clone(),
            resolver,
            importer,
        })
    }

    pub fn resolver(&self) -> &ProximityResolver {
        &self.resolver
    }

    pub fn importer(&self) -> Result<&Importer, RttError> {
        self.importer.as_deref().ok_or(RttError::NoQuerySource)
    }

    pub async fn serve(self) -> Result<(), RttError> {
        let state = AppState {
            resolver: self.resolver,
            importer: self.importer,
        };
        api::serve(self.listener, state).await?;
        Ok(())
    }
}
