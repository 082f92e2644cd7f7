use shared::metrics_defs::{MetricDef, MetricType};

pub const HOST_REQUESTS: MetricDef = MetricDef {
    name: "directory.host.requests",
    metric_type: MetricType::Counter,
    description: "Requests sent to the host platform API. Tagged with endpoint and outcome.",
};

pub const HOST_REQUEST_DURATION: MetricDef = MetricDef {
    name: "directory.host.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time spent waiting on the host platform API, in seconds. Tagged with endpoint.",
};

pub const USER_CACHE_HITS: MetricDef = MetricDef {
    name: "directory.user_cache.hits",
    metric_type: MetricType::Counter,
    description: "Caller identities served from the enriched per-user cache",
};

pub const USER_CACHE_MISSES: MetricDef = MetricDef {
    name: "directory.user_cache.misses",
    metric_type: MetricType::Counter,
    description: "Caller identities that required enrichment against the host platform",
};

pub const DIRECTORY_REFRESHES: MetricDef = MetricDef {
    name: "directory.org_users.refreshes",
    metric_type: MetricType::Counter,
    description: "Bulk fetches of the organization user directory",
};

pub const DIRECTORY_SIZE: MetricDef = MetricDef {
    name: "directory.org_users.size",
    metric_type: MetricType::Gauge,
    description: "Number of users in the most recent directory snapshot",
};

pub const PLUGIN_SETTINGS_REFRESHES: MetricDef = MetricDef {
    name: "directory.plugin_settings.refreshes",
    metric_type: MetricType::Counter,
    description: "Refreshes of the sibling plugin settings snapshot",
};

pub const SETTINGS_RESOLUTION_FAILURES: MetricDef = MetricDef {
    name: "directory.settings.failures",
    metric_type: MetricType::Counter,
    description: "Settings resolutions that produced an error. Tagged with reason.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    HOST_REQUESTS,
    HOST_REQUEST_DURATION,
    USER_CACHE_HITS,
    USER_CACHE_MISSES,
    DIRECTORY_REFRESHES,
    DIRECTORY_SIZE,
    PLUGIN_SETTINGS_REFRESHES,
    SETTINGS_RESOLUTION_FAILURES,
];
