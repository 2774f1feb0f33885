//! Metrics definitions for the RTT resolver and importer.

use shared::metrics_defs::{MetricDef, MetricType};

pub const CACHE_HIT: MetricDef = MetricDef {
    name: "cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of client group lookups served from the look-aside cache",
};

pub const CACHE_MISS: MetricDef = MetricDef {
    name: "cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of client group lookups that fell through to the store",
};

pub const NEGATIVE_CACHE_HIT: MetricDef = MetricDef {
    name: "negative_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of lookups that hit the negative cache",
};

pub const NEGATIVE_CACHE_MISS: MetricDef = MetricDef {
    name: "negative_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of lookups that missed the negative cache",
};

pub const RESOLVE_REQUESTS: MetricDef = MetricDef {
    name: "resolve.requests",
    metric_type: MetricType::Counter,
    description: "Resolution requests, tagged by outcome",
};

pub const SAMPLES_FOLDED: MetricDef = MetricDef {
    name: "import.samples.folded",
    metric_type: MetricType::Counter,
    description: "Raw samples folded into client groups",
};

pub const SAMPLES_UNKNOWN_SERVER: MetricDef = MetricDef {
    name: "import.samples.unknown_server",
    metric_type: MetricType::Counter,
    description: "Raw samples dropped because the server is not in the registry",
};

pub const SAMPLES_INVALID_RTT: MetricDef = MetricDef {
    name: "import.samples.invalid_rtt",
    metric_type: MetricType::Counter,
    description: "Raw samples dropped because of a negative or non-finite RTT",
};

pub const ROWS_SKIPPED: MetricDef = MetricDef {
    name: "import.rows.skipped",
    metric_type: MetricType::Counter,
    description: "Query rows that could not be parsed into samples",
};

pub const SYNC_GROUPS: MetricDef = MetricDef {
    name: "sync.groups",
    metric_type: MetricType::Counter,
    description: "Client groups processed by the synchronizer, tagged by outcome",
};

pub const SYNC_WRITE_FAILURES: MetricDef = MetricDef {
    name: "sync.write_failures",
    metric_type: MetricType::Counter,
    description: "Bulk writes that failed",
};

pub const IMPORT_DURATION: MetricDef = MetricDef {
    name: "import.duration",
    metric_type: MetricType::Histogram,
    description: "Time to import one day of RTT data in seconds",
};

pub const IMPORT_ROWS: MetricDef = MetricDef {
    name: "import.rows",
    metric_type: MetricType::Histogram,
    description: "Number of rows returned by the analytical source for one day",
};

/// Every metric above, for `shared::metrics_defs::describe_all`.
pub const ALL_METRICS: &[MetricDef] = &[
    CACHE_HIT,
    CACHE_MISS,
    NEGATIVE_CACHE_HIT,
    NEGATIVE_CACHE_MISS,
    RESOLVE_REQUESTS,
    SAMPLES_FOLDED,
    SAMPLES_UNKNOWN_SERVER,
    SAMPLES_INVALID_RTT,
    ROWS_SKIPPED,
    SYNC_GROUPS,
    SYNC_WRITE_FAILURES,
    IMPORT_DURATION,
    IMPORT_ROWS,
];
