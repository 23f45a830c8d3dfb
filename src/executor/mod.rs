pub mod evict;
pub mod podinfo;
pub mod schedule;
pub mod throttle;
pub mod waterline;

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;

use crate::series::MetricSeries;

use waterline::MetricRegistry;

/* ============================= CONTEXT ============================= */

/// Per-tick inputs shared by every executor: the node identity, the pod set
/// and the state snapshot the plan was computed from, plus the metric
/// capability table.
pub struct ExecuteContext {
    pub node_name: String,
    pub pods: Vec<Pod>,
    pub snapshot: Option<Arc<MetricSeries>>,
    pub registry: MetricRegistry,
}

impl ExecuteContext {
    pub fn find_pod(&self, namespace: &str, name: &str) -> Option<&Pod> {
        self.pods.iter().find(|p| {
            p.metadata.namespace.as_deref() == Some(namespace)
                && p.metadata.name.as_deref() == Some(name)
        })
    }
}

/* ============================= RELEASE ACCOUNTING ============================= */

/// Resources freed by acting on one pod, used to shrink the gap maps.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReleaseResource {
    pub cpu: f64,
    pub memory: f64,
}

impl ReleaseResource {
    pub fn add(&mut self, other: ReleaseResource) {
        self.cpu += other.cpu;
        self.memory += other.memory;
    }
}

/* ============================= TESTS ============================= */
