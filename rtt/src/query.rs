//! Client for the analytical source holding raw traceroute RTT rows.
//!
//! A day query returns rows of `(log_time, server_ip, client_ip, avg_rtt)`,
//! possibly over many pages. Pages are handed to the caller as they arrive so
//! the whole result never has to be held in memory at once.
use crate::config::QuerySource as QuerySourceConfig;
use crate::metrics_defs::ROWS_SKIPPED;
use crate::types::RawSample;
use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, TimeDelta, Utc};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use shared::counter;
use std::net::IpAddr;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("query failed with status {status}")]
    Status { status: StatusCode },
    #[error("no rows received for the requested window")]
    NoData,
    #[error("result truncated: received {received} of {total} rows")]
    Truncated { received: u64, total: u64 },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Time window of one import, `[start, end]` inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl QueryWindow {
    pub fn for_day(day: NaiveDate) -> Self {
        let start = day.and_time(chrono::NaiveTime::MIN).and_utc();
        let end = day
            .checked_add_days(Days::new(1))
            .map(|next| next.and_time(chrono::NaiveTime::MIN).and_utc() - TimeDelta::seconds(1))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        QueryWindow { start, end }
    }

    /// Rows are partitioned into one table per month.
    pub fn period(&self) -> String {
        self.start.format("%Y_%m").to_string()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueryReport {
    pub total_rows: u64,
    pub pages: u64,
    pub skipped_rows: u64,
}

#[async_trait]
pub trait QuerySource: Send + Sync {
    /// Fetches every row in `window`, calling `on_page` once per page with
    /// the rows that parsed.
    async fn fetch(
        &self,
        window: &QueryWindow,
        on_page: &mut (dyn FnMut(Vec<RawSample>) + Send),
    ) -> Result<QueryReport, QueryError>;
}

fn build_query(table: &str, window: &QueryWindow) -> String {
    format!(
        "SELECT
            log_time,
            connection_spec.server_ip,
            paris_traceroute_hop.dest_ip,
            AVG(paris_traceroute_hop.rtt) AS rtt
        FROM [{table}]
        WHERE
            project = 3 AND
            log_time > {start} AND
            log_time < {end} AND
            log_time IS NOT NULL AND
            connection_spec.server_ip IS NOT NULL AND
            paris_traceroute_hop.dest_ip IS NOT NULL AND
            paris_traceroute_hop.rtt IS NOT NULL AND
            connection_spec.client_ip != paris_traceroute_hop.dest_ip
        GROUP EACH BY
            log_time,
            connection_spec.server_ip,
            paris_traceroute_hop.dest_ip;",
        start = window.start.timestamp(),
        end = window.end.timestamp(),
    )
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest {
    query: String,
    max_results: u32,
    timeout_ms: u64,
    use_query_cache: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    job_reference: Option<JobReference>,
    // The source encodes 64-bit counts as strings.
    total_rows: Option<String>,
    page_token: Option<String>,
    #[serde(default)]
    rows: Vec<TableRow>,
}

#[derive(Deserialize)]
struct TableRow {
    f: Vec<TableCell>,
}

#[derive(Deserialize)]
struct TableCell {
    v: Option<String>,
}

impl TableRow {
    fn cell(&self, i: usize) -> Option<&str> {
        self.f.get(i)?.v.as_deref()
    }

    fn to_sample(&self) -> Option<RawSample> {
        let logged_at = self.cell(0)?.parse::<i64>().ok()?;
        Some(RawSample {
            logged_at: DateTime::from_timestamp(logged_at, 0)?,
            server_ip: self.cell(1)?.parse::<IpAddr>().ok()?,
            client_ip: self.cell(2)?.parse::<IpAddr>().ok()?,
            rtt: self.cell(3)?.parse::<f64>().ok()?,
        })
    }
}

fn parse_rows(rows: Vec<TableRow>, report: &mut QueryReport) -> Vec<RawSample> {
    let received = rows.len();
    let samples: Vec<RawSample> = rows.iter().filter_map(TableRow::to_sample).collect();
    let skipped = (received - samples.len()) as u64;
    if skipped > 0 {
        counter!(ROWS_SKIPPED).increment(skipped);
        report.skipped_rows += skipped;
    }
    samples
}

pub struct HttpQuerySource {
    client: reqwest::Client,
    queries_url: String,
    dataset: String,
    max_results: u32,
    timeout: Duration,
}

impl HttpQuerySource {
    pub fn new(config: &QuerySourceConfig) -> Result<Self, QueryError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let queries_url = format!(
            "{}/projects/{}/queries",
            config.url.trim_end_matches('/'),
            config.project
        );

        Ok(HttpQuerySource {
            client,
            queries_url,
            dataset: config.dataset.clone(),
            max_results: config.max_results,
            timeout,
        })
    }

    fn table_for(&self, window: &QueryWindow) -> String {
        format!("{}.{}", self.dataset, window.period())
    }

    async fn read_response(response: reqwest::Response) -> Result<QueryResponse, QueryError> {
        if !response.status().is_success() {
            return Err(QueryError::Status {
                status: response.status(),
            });
        }
        Ok(response.json::<QueryResponse>().await?)
    }
}

#[async_trait]
impl QuerySource for HttpQuerySource {
    async fn fetch(
        &self,
        window: &QueryWindow,
        on_page: &mut (dyn FnMut(Vec<RawSample>) + Send),
    ) -> Result<QueryReport, QueryError> {
        let request = QueryRequest {
            query: build_query(&self.table_for(window), window),
            max_results: self.max_results,
            timeout_ms: self.timeout.as_millis() as u64,
            use_query_cache: true,
        };
        tracing::debug!(start = %window.start, end = %window.end, "issuing query");

        let response = self
            .client
            .post(&self.queries_url)
            .json(&request)
            .send()
            .await?;
        let first = Self::read_response(response).await?;

        let total: u64 = first
            .total_rows
            .as_deref()
            .unwrap_or("0")
            .parse()
            .map_err(|_| QueryError::InvalidResponse("totalRows is not a number".into()))?;
        if total == 0 {
            return Err(QueryError::NoData);
        }

        let mut report = QueryReport {
            total_rows: total,
            pages: 1,
            skipped_rows: 0,
        };
        let mut received = first.rows.len() as u64;
        tracing::info!(received, total, "received first page of query results");
        on_page(parse_rows(first.rows, &mut report));

        let mut page_token = first.page_token;
        let job_id = first.job_reference.map(|job| job.job_id);

        while received < total {
            let (Some(job_id), Some(token)) = (job_id.as_deref(), page_token.as_deref()) else {
                return Err(QueryError::Truncated { received, total });
            };

            let mut url = Url::parse(&format!("{}/{}", self.queries_url, job_id))
                .map_err(|e| QueryError::InvalidUrl(e.to_string()))?;
            url.query_pairs_mut()
                .append_pair("pageToken", token)
                .append_pair("maxResults", &self.max_results.to_string());

            let page = Self::read_response(self.client.get(url).send().await?).await?;
            if page.rows.is_empty() {
                return Err(QueryError::Truncated { received, total });
            }

            received += page.rows.len() as u64;
            report.pages += 1;
            tracing::info!(received, total, "received additional query results");
            on_page(parse_rows(page.rows, &mut report));
            page_token = page.page_token;
        }

        Ok(report)
    }
}
