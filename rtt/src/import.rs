//! Drives ingestion runs: query one day of samples, fold them into client
//! groups and reconcile those with the store.
//!
//! The analytical source lags behind real time, so the most recent day that
//! can be imported is two days before now.
use crate::aggregate::{Aggregator, FoldStats};
use crate::ledger::{ImportLedger, LedgerError};
use crate::metrics_defs::{IMPORT_DURATION, IMPORT_ROWS};
use crate::query::{QueryError, QueryReport, QuerySource, QueryWindow};
use crate::registry::SiteRegistry;
use crate::sync::{BatchSynchronizer, SyncError, SyncReport};
use crate::types::RawSample;
use chrono::{DateTime, Days, NaiveDate, Utc};
use reqwest::StatusCode;
use shared::histogram;
use shared::retry::RetryPolicy;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

pub const IMPORT_LAG_DAYS: u64 = 2;

/// The first full day with RTT rows in the analytical source.
pub fn earliest_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2013, 6, 23).unwrap_or(NaiveDate::MIN)
}

/// The most recent day that is complete in the analytical source.
pub fn latest_importable_day(now: DateTime<Utc>) -> NaiveDate {
    let today = now.date_naive();
    today.checked_sub_days(Days::new(IMPORT_LAG_DAYS)).unwrap_or(today)
}

#[derive(thiserror::Error, Debug)]
pub enum ImportError {
    #[error("query failed: {0}")]
    Query(#[from] QueryError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl ImportError {
    /// Errors worth another attempt of the whole day.
    fn is_retryable(&self) -> bool {
        match self {
            ImportError::Query(QueryError::NoData | QueryError::InvalidUrl(_)) => false,
            // Rejected requests fail the same way every time, except for rate limiting.
            ImportError::Query(QueryError::Status { status }) => {
                !status.is_client_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            ImportError::Query(_) => true,
            ImportError::Sync(_) => false,
            ImportError::Ledger(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DayReport {
    pub day: NaiveDate,
    pub query: QueryReport,
    pub fold: FoldStats,
    pub sync: SyncReport,
    /// Whether the day moved the ledger forward.
    pub recorded: bool,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RangeReport {
    pub imported: Vec<DayReport>,
    pub failed: Vec<NaiveDate>,
}

impl RangeReport {
    pub fn days(&self) -> usize {
        self.imported.len() + self.failed.len()
    }
}

pub struct Importer {
    source: Arc<dyn QuerySource>,
    registry: Arc<dyn SiteRegistry>,
    synchronizer: BatchSynchronizer,
    ledger: Arc<dyn ImportLedger>,
    retry: RetryPolicy,
    // Runs read-modify-write the store and must not overlap.
    running: Mutex<()>,
}

impl Importer {
    pub fn new(
        source: Arc<dyn QuerySource>,
        registry: Arc<dyn SiteRegistry>,
        synchronizer: BatchSynchronizer,
        ledger: Arc<dyn ImportLedger>,
        retry: RetryPolicy,
    ) -> Self {
        Importer {
            source,
            registry,
            synchronizer,
            ledger,
            retry,
            running: Mutex::new(()),
        }
    }

    pub fn ledger(&self) -> &dyn ImportLedger {
        self.ledger.as_ref()
    }

    /// Imports a single day, retrying the whole day on transient failures.
    pub async fn import_day(&self, day: NaiveDate) -> Result<DayReport, ImportError> {
        let _running = self.running.lock().await;
        self.run_day_with_retry(day).await
    }

    pub async fn import_daily(&self, now: DateTime<Utc>) -> Result<DayReport, ImportError> {
        self.import_day(latest_importable_day(now)).await
    }

    /// Imports every day from the first day with data up to the most recent
    /// importable one.
    pub async fn import_all(&self, now: DateTime<Utc>) -> RangeReport {
        let _running = self.running.lock().await;
        self.run_range(earliest_day(), latest_importable_day(now))
            .await
    }

    /// Imports every day after the last one recorded in the ledger.
    pub async fn catch_up(&self, now: DateTime<Utc>) -> Result<RangeReport, ImportError> {
        let _running = self.running.lock().await;
        let from = match self.ledger.last_success()? {
            Some(last) => match last.succ_opt() {
                Some(next) => next,
                None => return Ok(RangeReport::default()),
            },
            None => earliest_day(),
        };
        Ok(self.run_range(from, latest_importable_day(now)).await)
    }

    async fn run_range(&self, from: NaiveDate, to: NaiveDate) -> RangeReport {
        let mut report = RangeReport::default();
        if from > to {
            tracing::info!(%from, %to, "nothing to import");
            return report;
        }

        tracing::info!(%from, %to, "importing range");
        for day in from.iter_days().take_while(|day| *day <= to) {
            match self.run_day_with_retry(day).await {
                Ok(day_report) => report.imported.push(day_report),
                Err(err) => {
                    tracing::error!(%day, error = %err, "failed to import day");
                    report.failed.push(day);
                }
            }
        }

        tracing::info!(
            days = report.days(),
            failed = report.failed.len(),
            "finished importing range"
        );
        report
    }

    async fn run_day_with_retry(&self, day: NaiveDate) -> Result<DayReport, ImportError> {
        let job = format!("import {day}");
        self.retry
            .run_while(&job, || self.run_day(day), ImportError::is_retryable)
            .await
    }

    async fn run_day(&self, day: NaiveDate) -> Result<DayReport, ImportError> {
        let started = Instant::now();
        let window = QueryWindow::for_day(day);
        tracing::info!(%day, "starting import");

        let mut aggregator = Aggregator::new(self.registry.as_ref());
        let query = self
            .source
            .fetch(&window, &mut |samples: Vec<RawSample>| {
                aggregator.fold_all(&samples)
            })
            .await?;
        histogram!(IMPORT_ROWS).record(query.total_rows as f64);

        let (groups, fold) = aggregator.finish();
        tracing::info!(
            %day,
            groups = groups.len(),
            folded = fold.folded,
            unknown_server = fold.unknown_server,
            invalid_rtt = fold.invalid_rtt,
            "aggregated samples"
        );

        let sync = self.synchronizer.sync(groups).await?;
        let recorded = if sync.is_clean() {
            self.record_if_next(day)?
        } else {
            tracing::warn!(
                %day,
                read_errors = sync.read_errors,
                write_failures = sync.write_failures,
                "import incomplete, not recording day as done"
            );
            false
        };

        histogram!(IMPORT_DURATION).record(started.elapsed().as_secs_f64());
        tracing::info!(%day, written = sync.written, "finished import");

        Ok(DayReport {
            day,
            query,
            fold,
            sync,
            recorded,
        })
    }

    /// Moves the ledger to `day` only when it directly follows the last
    /// recorded day, so the ledger never passes over a day that still needs
    /// importing.
    fn record_if_next(&self, day: NaiveDate) -> Result<bool, ImportError> {
        let next = match self.ledger.last_success()? {
            Some(last) => last.succ_opt(),
            None => Some(earliest_day()),
        };
        if next != Some(day) {
            tracing::debug!(%day, ?next, "day is not next in the ledger, not recording it");
            return Ok(false);
        }
        Ok(self.ledger.record_success(day)?)
    }
}
