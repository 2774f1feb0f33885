use serde::Deserialize;
use shared::retry::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StoreType {
    Memory,
    Filesystem { path: PathBuf },
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Store {
    #[serde(flatten)]
    pub r#type: StoreType,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

fn default_max_read_batch() -> usize {
    1000
}

fn default_max_write_batch() -> usize {
    300
}

fn default_op_timeout_secs() -> u64 {
    60
}

/// Limits imposed by the backing store on bulk operations.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SyncConfig {
    #[serde(default = "default_max_read_batch")]
    pub max_read_batch: usize,
    #[serde(default = "default_max_write_batch")]
    pub max_write_batch: usize,
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            max_read_batch: default_max_read_batch(),
            max_write_batch: default_max_write_batch(),
            op_timeout_secs: default_op_timeout_secs(),
        }
    }
}

fn default_dataset() -> String {
    "measurement-lab:m_lab".into()
}

fn default_max_results() -> u32 {
    // Responses must stay well under the source's size cap.
    50_000
}

fn default_query_timeout_secs() -> u64 {
    600
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct QuerySource {
    pub url: String,
    pub project: String,
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default = "default_query_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Cache {
    pub capacity: u64,
    pub ttl_secs: u64,
}

impl Cache {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_cache() -> Cache {
    Cache {
        capacity: 100_000,
        ttl_secs: 300,
    }
}

fn default_negative_cache() -> Cache {
    Cache {
        capacity: 10_000,
        ttl_secs: 5,
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Registry {
    pub path: PathBuf,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Ledger {
    pub path: PathBuf,
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> Option<u32> {
    Some(5)
}

fn default_max_delay_ms() -> Option<u64> {
    Some(3_600_000)
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Retry {
    // An explicit null retries without limit.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: Option<u64>,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl From<&Retry> for RetryPolicy {
    fn from(retry: &Retry) -> Self {
        RetryPolicy {
            max_attempts: retry.max_attempts,
            base_delay: Duration::from_millis(retry.base_delay_ms),
            multiplier: retry.multiplier,
            max_delay: retry.max_delay_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    pub store: Store,
    #[serde(default)]
    pub sync: SyncConfig,
    pub query_source: Option<QuerySource>,
    #[serde(default = "default_cache")]
    pub cache: Cache,
    #[serde(default = "default_negative_cache")]
    pub negative_cache: Cache,
    pub registry: Registry,
    pub ledger: Option<Ledger>,
    #[serde(default)]
    pub retry: Retry,
}
