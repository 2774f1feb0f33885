//! Reconciles freshly aggregated client groups with the durable store.
//!
//! Reads happen in chunks of at most `max_read_batch` keys, writes in chunks
//! of at most `max_write_batch` groups; the two sizes are independent. Only
//! groups that actually changed are written back. Failures are contained to
//! the records (or the batch) they affect and are left for the next run,
//! which is safe because merging is idempotent and only ever improves RTTs.
use crate::aggregate::merge_client_groups;
use crate::bucket::AddressBucket;
use crate::cache::LookasideCache;
use crate::config::SyncConfig;
use crate::metrics_defs::{SYNC_GROUPS, SYNC_WRITE_FAILURES};
use crate::negative_cache::NegativeCache;
use crate::store::{AggregateStore, ReadOutcome, StoreError};
use crate::types::ClientGroup;
use shared::chunk::{ChunkError, FlushBuffer, chunked};
use shared::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SyncError {
    #[error("invalid batch size: {0}")]
    InvalidBatchSize(#[from] ChunkError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub read_batches: usize,
    // Stored fresh because nothing usable was stored before.
    pub created: usize,
    pub merged: usize,
    pub unchanged: usize,
    pub read_errors: usize,
    pub write_batches: usize,
    pub written: usize,
    pub write_failures: usize,
    pub unwritten: usize,
}

impl SyncReport {
    /// True when every key was read and every write succeeded.
    pub fn is_clean(&self) -> bool {
        self.read_errors == 0 && self.write_failures == 0
    }
}

enum Reconciled {
    Write(ClientGroup, bool),
    Unchanged,
    Skipped,
}

pub struct BatchSynchronizer {
    store: Arc<dyn AggregateStore>,
    max_read_batch: usize,
    max_write_batch: usize,
    op_timeout: Duration,
    cache: Option<LookasideCache>,
    negative_cache: Option<NegativeCache>,
}

impl BatchSynchronizer {
    pub fn new(store: Arc<dyn AggregateStore>, config: &SyncConfig) -> Result<Self, SyncError> {
        if config.max_read_batch == 0 || config.max_write_batch == 0 {
            return Err(SyncError::InvalidBatchSize(ChunkError::ZeroSize));
        }
        Ok(BatchSynchronizer {
            store,
            max_read_batch: config.max_read_batch,
            max_write_batch: config.max_write_batch,
            op_timeout: Duration::from_secs(config.op_timeout_secs),
            cache: None,
            negative_cache: None,
        })
    }

    /// Caches to invalidate for every bucket written back.
    pub fn with_caches(mut self, cache: LookasideCache, negative_cache: NegativeCache) -> Self {
        self.cache = Some(cache);
        self.negative_cache = Some(negative_cache);
        self
    }

    pub async fn sync(
        &self,
        fresh: HashMap<AddressBucket, ClientGroup>,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        let mut pending = FlushBuffer::new(self.max_write_batch)?;

        for chunk in chunked(fresh, self.max_read_batch)? {
            report.read_batches += 1;
            let keys: Vec<AddressBucket> = chunk.iter().map(|(key, _)| *key).collect();

            let Some(outcomes) = self.read_chunk(&keys).await else {
                report.read_errors += keys.len();
                continue;
            };

            for ((key, group), outcome) in chunk.into_iter().zip(outcomes) {
                match reconcile(key, group, outcome) {
                    Reconciled::Write(group, created) => {
                        if created {
                            report.created += 1;
                        } else {
                            report.merged += 1;
                        }
                        if let Some(batch) = pending.push(group) {
                            self.flush(batch, &mut report).await;
                        }
                    }
                    Reconciled::Unchanged => report.unchanged += 1,
                    Reconciled::Skipped => report.read_errors += 1,
                }
            }
        }

        if let Some(batch) = pending.take_remainder() {
            self.flush(batch, &mut report).await;
        }

        counter!(SYNC_GROUPS, "outcome" => "created").increment(report.created as u64);
        counter!(SYNC_GROUPS, "outcome" => "merged").increment(report.merged as u64);
        counter!(SYNC_GROUPS, "outcome" => "unchanged").increment(report.unchanged as u64);
        counter!(SYNC_GROUPS, "outcome" => "read_error").increment(report.read_errors as u64);

        tracing::info!(
            created = report.created,
            merged = report.merged,
            unchanged = report.unchanged,
            read_errors = report.read_errors,
            written = report.written,
            unwritten = report.unwritten,
            "synchronized client groups with store"
        );

        Ok(report)
    }

    // None means the whole chunk could not be read.
    async fn read_chunk(&self, keys: &[AddressBucket]) -> Option<Vec<ReadOutcome>> {
        let result = match timeout(self.op_timeout, self.store.get_multi(keys)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        };

        match result {
            Ok(outcomes) if outcomes.len() == keys.len() => Some(outcomes),
            Ok(outcomes) => {
                tracing::error!(
                    expected = keys.len(),
                    received = outcomes.len(),
                    "bulk read returned the wrong number of outcomes, skipping chunk"
                );
                None
            }
            Err(err) => {
                tracing::error!(
                    keys = keys.len(),
                    error = %err,
                    "bulk read failed, skipping chunk"
                );
                None
            }
        }
    }

    async fn flush(&self, batch: Vec<ClientGroup>, report: &mut SyncReport) {
        report.write_batches += 1;
        let result = match timeout(self.op_timeout, self.store.put_multi(&batch)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        };

        match result {
            Ok(()) => {
                report.written += batch.len();
                for group in &batch {
                    if let Some(cache) = &self.cache {
                        cache.delete(&group.bucket);
                    }
                    if let Some(negative_cache) = &self.negative_cache {
                        negative_cache.remove(&group.bucket);
                    }
                }
                tracing::debug!(groups = batch.len(), total = report.written, "wrote batch");
            }
            Err(err) => {
                report.write_failures += 1;
                report.unwritten += batch.len();
                counter!(SYNC_WRITE_FAILURES).increment(1);
                tracing::error!(groups = batch.len(), error = %err, "bulk write failed");
            }
        }
    }
}

fn reconcile(key: AddressBucket, fresh: ClientGroup, outcome: ReadOutcome) -> Reconciled {
    match outcome {
        ReadOutcome::NotFound => Reconciled::Write(fresh, true),
        ReadOutcome::Found(stored) if stored.is_empty() => Reconciled::Write(fresh, true),
        ReadOutcome::Found(stored) if stored.bucket != key => {
            tracing::warn!(
                %key,
                stored = %stored.bucket,
                "stored group has a foreign bucket, replacing it"
            );
            Reconciled::Write(fresh, true)
        }
        ReadOutcome::Found(stored) => match merge_client_groups(&stored, &fresh) {
            Ok((merged, true)) => Reconciled::Write(merged, false),
            Ok((_, false)) => Reconciled::Unchanged,
            Err(err) => {
                tracing::error!(%key, error = %err, "could not merge client group");
                Reconciled::Skipped
            }
        },
        ReadOutcome::Failed(err) => {
            tracing::error!(%key, error = %err, "could not read client group, skipping");
            Reconciled::Skipped
        }
    }
}
