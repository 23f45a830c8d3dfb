use std::cmp::Ordering;

use k8s_openapi::api::core::v1::Pod;

use crate::quantity::parse_cpu_cores;
use crate::series::{self, MetricSeries};

/* ============================= KEYS & TYPES ============================= */

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for PodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    ThrottleDown,
    ThrottleUp,
    Evict,
}

/// One per-container reading carried into the executors.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerUsage {
    pub container_name: String,
    pub container_id: String,
    pub value: f64,
}

/// Find a container reading by id.
pub fn usage_by_id(usages: &[ContainerUsage], container_id: &str) -> Option<f64> {
    usages
        .iter()
        .find(|u| u.container_id == container_id)
        .map(|u| u.value)
}

/// Effective CPU throttle ratios attached to a victim pod.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CpuRatio {
    pub min_cpu_ratio: i64,
    pub step_cpu_ratio: i64,
}

/// Everything the executors need to know about one victim pod, built fresh
/// each tick from the pod object and the latest state snapshot.
#[derive(Debug, Clone)]
pub struct PodContext {
    pub key: PodKey,
    pub qos_class: String,
    pub priority: i32,
    pub action_type: ActionType,
    pub cpu_throttle: CpuRatio,
    pub force_gc: bool,
    pub deletion_grace_period_seconds: i64,
    pub container_cpu_usages: Vec<ContainerUsage>,
    pub container_cpu_quotas: Vec<ContainerUsage>,
    pub container_cpu_periods: Vec<ContainerUsage>,
    pub pod_cpu_usage: f64,
    pub pod_memory_usage: f64,
    pub has_been_actioned: bool,
}

impl PodContext {
    /// Assemble the context from the pod object plus the container series of
    /// the current snapshot.
    pub fn build(pod: &Pod, snapshot: Option<&MetricSeries>, action_type: ActionType) -> Self {
        let uid = pod.metadata.uid.clone().unwrap_or_default();

        let pick = |metric: &str| -> Vec<ContainerUsage> {
            let Some(snapshot) = snapshot else {
                return Vec::new();
            };
            snapshot
                .get(metric)
                .map(|all| {
                    all.iter()
                        .filter(|ts| ts.label(series::LABEL_POD_UID) == Some(uid.as_str()))
                        .map(|ts| ContainerUsage {
                            container_name: ts
                                .label(series::LABEL_CONTAINER_NAME)
                                .unwrap_or_default()
                                .to_string(),
                            container_id: ts
                                .label(series::LABEL_CONTAINER_ID)
                                .unwrap_or_default()
                                .to_string(),
                            value: ts.latest().unwrap_or_default(),
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let container_cpu_usages = pick(series::CONTAINER_CPU_TOTAL_USAGE);
        let container_cpu_quotas = pick(series::CONTAINER_CPU_QUOTA);
        let container_cpu_periods = pick(series::CONTAINER_CPU_PERIOD);
        let memory_usages = pick(series::CONTAINER_MEM_TOTAL_USAGE);

        // The pod-level cgroup entry carries an empty container id.
        let pod_level = |usages: &[ContainerUsage]| -> Option<f64> {
            usages
                .iter()
                .find(|u| u.container_id.is_empty())
                .map(|u| u.value)
        };
        let containers_sum = |usages: &[ContainerUsage]| -> f64 {
            usages
                .iter()
                .filter(|u| !u.container_id.is_empty())
                .map(|u| u.value)
                .sum()
        };

        let pod_cpu_usage =
            pod_level(&container_cpu_usages).unwrap_or_else(|| containers_sum(&container_cpu_usages));
        let pod_memory_usage =
            pod_level(&memory_usages).unwrap_or_else(|| containers_sum(&memory_usages));

        Self {
            key: PodKey::from_pod(pod),
            qos_class: pod
                .status
                .as_ref()
                .and_then(|s| s.qos_class.clone())
                .unwrap_or_default(),
            priority: pod.spec.as_ref().and_then(|s| s.priority).unwrap_or(0),
            action_type,
            cpu_throttle: CpuRatio::default(),
            force_gc: false,
            deletion_grace_period_seconds: crate::crd::DEFAULT_DELETION_GRACE_PERIOD_SECONDS,
            container_cpu_usages,
            container_cpu_quotas,
            container_cpu_periods,
            pod_cpu_usage,
            pod_memory_usage,
            has_been_actioned: false,
        }
    }

    fn qos_rank(&self) -> u8 {
        match self.qos_class.as_str() {
            "BestEffort" => 0,
            "Burstable" => 1,
            "Guaranteed" => 2,
            _ => 1,
        }
    }
}

/* ============================= ELIGIBILITY ============================= */

const SYSTEM_CRITICAL_PRIORITY: i32 = 2_000_000_000;

/// Whether a pod may be throttled or evicted at all: it must be running,
/// not a static mirror pod, and below system-critical priority.
pub fn eligible_for_avoidance(pod: &Pod) -> bool {
    let running = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        == Some("Running");
    if !running {
        return false;
    }

    if let Some(annotations) = &pod.metadata.annotations
        && annotations.contains_key("kubernetes.io/config.mirror")
    {
        return false;
    }

    pod.spec.as_ref().and_then(|s| s.priority).unwrap_or(0) < SYSTEM_CRITICAL_PRIORITY
}

/* ============================= SORTING ============================= */

/// Priority then QoS class, lowest first. The fallback when a metric has no
/// dedicated comparator.
pub fn general_sorter(pods: &mut [PodContext]) {
    pods.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.qos_rank().cmp(&b.qos_rank()))
            .then_with(|| a.key.name.cmp(&b.key.name))
    });
}

/// Biggest memory consumer first.
pub fn memory_sorter(pods: &mut [PodContext]) {
    pods.sort_by(|a, b| {
        b.pod_memory_usage
            .partial_cmp(&a.pod_memory_usage)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.key.name.cmp(&b.key.name))
    });
}

/// Biggest CPU consumer first.
pub fn cpu_sorter(pods: &mut [PodContext]) {
    pods.sort_by(|a, b| {
        b.pod_cpu_usage
            .partial_cmp(&a.pod_cpu_usage)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.key.name.cmp(&b.key.name))
    });
}

/// Index of the first pod not yet acted on this tick.
pub fn first_unactioned(pods: &[PodContext]) -> Option<usize> {
    pods.iter().position(|p| !p.has_been_actioned)
}

/// Fetch CPU request and limit in cores for a named container.
pub fn container_cpu_request_limit(pod: &Pod, container_name: &str) -> (Option<f64>, Option<f64>) {
    let Some(container) = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.iter().find(|c| c.name == container_name))
    else {
        return (None, None);
    };
    let resources = container.resources.as_ref();
    let request = resources
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("cpu"))
        .and_then(|q| parse_cpu_cores(&q.0));
    let limit = resources
        .and_then(|r| r.limits.as_ref())
        .and_then(|l| l.get("cpu"))
        .and_then(|q| parse_cpu_cores(&q.0));
    (request, limit)
}

/* ============================= TESTS ============================= */
