use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Inbound request duration in seconds. Tagged with route and status.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently being processed",
};

pub const ONCALL_REQUESTS: MetricDef = MetricDef {
    name: "oncall.requests",
    metric_type: MetricType::Counter,
    description: "Requests sent to the external service. Tagged with endpoint and outcome.",
};

pub const ONCALL_REQUEST_DURATION: MetricDef = MetricDef {
    name: "oncall.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time spent waiting on the external service, in seconds. Tagged with endpoint.",
};

pub const SYNC_RUNS: MetricDef = MetricDef {
    name: "sync.runs",
    metric_type: MetricType::Counter,
    description: "Sync attempts. Tagged with outcome: pushed, unchanged, rejected, failed.",
};

pub const SYNC_DURATION: MetricDef = MetricDef {
    name: "sync.duration",
    metric_type: MetricType::Histogram,
    description: "Duration of sync runs that got past admission, in seconds",
};

pub const SYNC_SNAPSHOT_USERS: MetricDef = MetricDef {
    name: "sync.snapshot.users",
    metric_type: MetricType::Gauge,
    description: "Number of users in the most recently collected snapshot",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
    ONCALL_REQUESTS,
    ONCALL_REQUEST_DURATION,
    SYNC_RUNS,
    SYNC_DURATION,
    SYNC_SNAPSHOT_USERS,
];
