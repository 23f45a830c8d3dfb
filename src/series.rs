use std::collections::BTreeMap;

/* ============================= METRIC NAMES ============================= */

/// Node-level metric names published by the collectors.
pub const CPU_TOTAL_USAGE: &str = "cpu_total_usage";
pub const CPU_TOTAL_UTILIZATION: &str = "cpu_total_utilization";
pub const CPU_LOAD_1_MIN: &str = "cpu_load_1_min";
pub const CPU_LOAD_5_MIN: &str = "cpu_load_5_min";
pub const CPU_LOAD_15_MIN: &str = "cpu_load_15_min";

pub const MEMORY_TOTAL_USAGE: &str = "memory_total_usage";
pub const MEMORY_TOTAL_UTILIZATION: &str = "memory_total_utilization";

pub const DISK_READ_KIBPS: &str = "disk_read_kibps";
pub const DISK_WRITE_KIBPS: &str = "disk_write_kibps";
pub const DISK_READ_IOPS: &str = "disk_read_iops";
pub const DISK_WRITE_IOPS: &str = "disk_write_iops";
pub const DISK_UTILIZATION: &str = "disk_utilization";

pub const NETWORK_RECEIVE_KIBPS: &str = "network_receive_kibps";
pub const NETWORK_SENT_KIBPS: &str = "network_sent_kibps";
pub const NETWORK_RECEIVE_PCKPS: &str = "network_receive_pckps";
pub const NETWORK_SENT_PCKPS: &str = "network_sent_pckps";
pub const NETWORK_DROP_IN: &str = "network_drop_in";
pub const NETWORK_DROP_OUT: &str = "network_drop_out";

/// Per-container metric names, labelled with the container label set.
pub const CONTAINER_CPU_TOTAL_USAGE: &str = "container_cpu_total_usage";
pub const CONTAINER_CPU_LIMIT: &str = "container_cpu_limit";
pub const CONTAINER_CPU_QUOTA: &str = "container_cpu_quota";
pub const CONTAINER_CPU_PERIOD: &str = "container_cpu_period";
pub const CONTAINER_SCHED_RUN_QUEUE_TIME: &str = "container_sched_run_queue_time";
pub const CONTAINER_MEM_TOTAL_USAGE: &str = "container_mem_total_usage";

/// Label names carried by container series.
pub const LABEL_POD_NAME: &str = "PodName";
pub const LABEL_POD_NAMESPACE: &str = "PodNamespace";
pub const LABEL_POD_UID: &str = "PodUid";
pub const LABEL_CONTAINER_NAME: &str = "ContainerName";
pub const LABEL_CONTAINER_ID: &str = "ContainerId";

/* ============================= TYPES ============================= */

/// A name/value pair attached to a series as metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// A value observed at a point in time (unix seconds).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub timestamp: i64,
}

/// A stream of samples for one metric dimension.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeries {
    pub labels: Vec<Label>,
    pub samples: Vec<Sample>,
}

impl TimeSeries {
    /// Single-sample series with no labels.
    pub fn scalar(value: f64, timestamp: i64) -> Self {
        Self {
            labels: Vec::new(),
            samples: vec![Sample { value, timestamp }],
        }
    }

    /// Single-sample series with the given labels.
    pub fn labelled(labels: Vec<Label>, value: f64, timestamp: i64) -> Self {
        Self {
            labels,
            samples: vec![Sample { value, timestamp }],
        }
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.last().map(|s| s.value)
    }
}

/// One complete collection result: metric name to its series.
pub type MetricSeries = BTreeMap<String, Vec<TimeSeries>>;

/// Largest latest value across all series of one metric.
pub fn max_latest(series: &[TimeSeries]) -> Option<f64> {
    series
        .iter()
        .filter_map(TimeSeries::latest)
        .fold(None, |acc, v| match acc {
            Some(m) if m >= v => Some(m),
            _ => Some(v),
        })
}

/// Latest value among series whose labels contain all `matches` pairs.
pub fn max_latest_matching(series: &[TimeSeries], matches: &[(String, String)]) -> Option<f64> {
    let filtered: Vec<TimeSeries> = series
        .iter()
        .filter(|ts| {
            matches
                .iter()
                .all(|(name, value)| ts.label(name) == Some(value.as_str()))
        })
        .cloned()
        .collect();
    max_latest(&filtered)
}

/* ============================= TESTS ============================= */
