pub mod container;
pub mod cpu;
pub mod diskio;
pub mod load;
pub mod memory;
pub mod netio;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use crate::crd::NodeQOSEnsurancePolicy;
use crate::selector::selector_matches;
use crate::series::MetricSeries;

/* ============================= TRAIT ============================= */

/// One metric source. Implementations keep previous-tick state internally;
/// the first tick after (re)creation may legitimately produce nothing.
pub trait Collector: Send {
    fn name(&self) -> &'static str;

    fn collect(&mut self) -> Result<MetricSeries>;

    /// Release background state. Only the container collector has any.
    fn stop(&mut self) {}
}

/// Provides the current set of pods on this node.
pub type PodLister = Arc<dyn Fn() -> Vec<Pod> + Send + Sync>;

/// Provides the cached policy set.
pub type PolicyLister = Arc<dyn Fn() -> Vec<NodeQOSEnsurancePolicy> + Send + Sync>;

/// Provides the local node's labels.
pub type NodeLabelsFn = Arc<dyn Fn() -> BTreeMap<String, String> + Send + Sync>;

/* ============================= STATE STORE ============================= */

/// Latest complete snapshot, swapped atomically per tick.
///
/// Readers clone the Arc and never hold the lock across computation, so a
/// reader always sees a whole tick's output or the previous one.
#[derive(Default)]
pub struct StateStore {
    inner: RwLock<Option<Arc<MetricSeries>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: MetricSeries) {
        let mut guard = self.inner.write().expect("state store lock poisoned");
        *guard = Some(Arc::new(snapshot));
    }

    pub fn load(&self) -> Option<Arc<MetricSeries>> {
        self.inner
            .read()
            .expect("state store lock poisoned")
            .clone()
    }

    /// True once the first snapshot has been published.
    pub fn is_ready(&self) -> bool {
        self.inner
            .read()
            .expect("state store lock poisoned")
            .is_some()
    }
}

/* ============================= REGISTRY ============================= */

pub const COLLECT_INTERVAL: Duration = Duration::from_secs(10);

const NODE_LOCAL_COLLECTORS: &[&str] = &[
    cpu::COLLECTOR_NAME,
    load::COLLECTOR_NAME,
    memory::COLLECTOR_NAME,
    diskio::COLLECTOR_NAME,
    netio::COLLECTOR_NAME,
    container::COLLECTOR_NAME,
];

/// Owns one collector instance per enabled source and publishes merged
/// snapshots to the state store.
pub struct StateCollector {
    ifaces: Vec<String>,
    cgroup_root: PathBuf,
    pod_lister: PodLister,
    policy_lister: PolicyLister,
    node_labels: NodeLabelsFn,
    collectors: HashMap<&'static str, Arc<Mutex<Box<dyn Collector>>>>,
    state: Arc<StateStore>,
}

impl StateCollector {
    pub fn new(
        ifaces: Vec<String>,
        cgroup_root: PathBuf,
        pod_lister: PodLister,
        policy_lister: PolicyLister,
        node_labels: NodeLabelsFn,
        state: Arc<StateStore>,
    ) -> Self {
        Self {
            ifaces,
            cgroup_root,
            pod_lister,
            policy_lister,
            node_labels,
            collectors: HashMap::new(),
            state,
        }
    }

    /// Both periodic loops: the supervisor that reconciles the collector set
    /// against the policy set, and the collect fan-out.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(COLLECT_INTERVAL);
        // First tick fires immediately; skip it so collectors see a real delta.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    self.stop_collectors();
                    info!("state_collector_stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.update_collectors();
                    self.collect_once().await;
                }
            }
        }
    }

    /// Reconcile the active collector set: the node-local bundle runs while
    /// at least one policy selecting this node asks for node-local sampling.
    pub fn update_collectors(&mut self) {
        let policies = (self.policy_lister)();
        let labels = (self.node_labels)();

        let node_local = policies.iter().any(|p| {
            p.spec.node_quality_probe.node_local_get.is_some()
                && selector_matches(p.spec.selector.as_ref(), &labels)
        });

        if node_local {
            if !self.collectors.contains_key(cpu::COLLECTOR_NAME) {
                info!("node_local_collectors_started");
                self.install_node_local_bundle();
            }
        } else if self.collectors.contains_key(cpu::COLLECTOR_NAME) {
            info!("node_local_collectors_stopped");
            self.stop_collectors();
        }
    }

    fn install_node_local_bundle(&mut self) {
        self.insert(Box::new(cpu::CpuCollector::new()));
        self.insert(Box::new(load::LoadCollector::new()));
        self.insert(Box::new(memory::MemoryCollector::new()));
        self.insert(Box::new(diskio::DiskIoCollector::new()));
        self.insert(Box::new(netio::NetIoCollector::new(self.ifaces.clone())));
        self.insert(Box::new(container::ContainerCollector::new(
            self.cgroup_root.clone(),
            self.pod_lister.clone(),
        )));
    }

    fn insert(&mut self, collector: Box<dyn Collector>) {
        self.collectors
            .insert(collector.name(), Arc::new(Mutex::new(collector)));
    }

    /// Fan collection out across every active collector, merge the results
    /// and publish the merged snapshot in one swap.
    pub async fn collect_once(&self) {
        if self.collectors.is_empty() {
            return;
        }

        let mut handles = Vec::with_capacity(self.collectors.len());
        for collector in self.collectors.values() {
            let collector = collector.clone();
            handles.push(tokio::spawn(async move {
                let mut guard = collector.lock().await;
                let name = guard.name();
                (name, guard.collect())
            }));
        }

        let mut merged = MetricSeries::new();
        for handle in handles {
            match handle.await {
                Ok((_, Ok(series))) => {
                    merged.extend(series);
                }
                Ok((name, Err(e))) => {
                    warn!(collector = name, error = %e, "collector_failed");
                }
                Err(e) => {
                    warn!(error = %e, "collector_task_panicked");
                }
            }
        }

        self.state.publish(merged);
    }

    /// Drop every collector, releasing container-collector state explicitly.
    pub fn stop_collectors(&mut self) {
        for name in NODE_LOCAL_COLLECTORS {
            if let Some(collector) = self.collectors.remove(name)
                && let Ok(mut guard) = collector.try_lock()
            {
                guard.stop();
            }
        }
    }

    #[cfg(test)]
    pub fn active_collector_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.collectors.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{NodeLocalGet, NodeQOSEnsurancePolicySpec, NodeQualityProbe};
    use crate::series::TimeSeries;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

    fn make_policy(node_local: bool, selector: Option<LabelSelector>) -> NodeQOSEnsurancePolicy {
        NodeQOSEnsurancePolicy::new(
            "p1",
            NodeQOSEnsurancePolicySpec {
                selector,
                node_quality_probe: NodeQualityProbe {
                    node_local_get: node_local.then(NodeLocalGet::default),
                    period_seconds: None,
                },
                objective_ensurances: vec![],
            },
        )
    }

    fn make_collector(policies: Vec<NodeQOSEnsurancePolicy>) -> StateCollector {
        StateCollector::new(
            vec!["eth0".to_string()],
            PathBuf::from("/sys/fs/cgroup"),
            Arc::new(Vec::new),
            Arc::new(move || policies.clone()),
            Arc::new(BTreeMap::new),
            Arc::new(StateStore::new()),
        )
    }

    #[test]
    fn test_state_store_starts_empty() {
        let store = StateStore::new();
        assert!(!store.is_ready());
        assert!(store.load().is_none());
    }

    #[test]
    fn test_state_store_publish_swaps_snapshot() {
        let store = StateStore::new();
        let mut snapshot = MetricSeries::new();
        snapshot.insert("cpu_total_usage".to_string(), vec![TimeSeries::scalar(2.0, 0)]);
        store.publish(snapshot);

        assert!(store.is_ready());
        let loaded = store.load().expect("snapshot present");
        assert_eq!(loaded["cpu_total_usage"][0].latest(), Some(2.0));

        // A second publish replaces the whole snapshot.
        store.publish(MetricSeries::new());
        assert!(store.load().expect("snapshot present").is_empty());
    }

    #[test]
    fn test_update_collectors_installs_bundle_when_needed() {
        let mut sc = make_collector(vec![make_policy(true, None)]);
        sc.update_collectors();
        assert_eq!(
            sc.active_collector_names(),
            vec!["container", "cpu", "diskio", "load", "memory", "netio"]
        );
    }

    #[test]
    fn test_update_collectors_skips_non_node_local_policies() {
        let mut sc = make_collector(vec![make_policy(false, None)]);
        sc.update_collectors();
        assert!(sc.active_collector_names().is_empty());
    }

    #[test]
    fn test_update_collectors_respects_node_selector() {
        let selector = LabelSelector {
            match_labels: Some(
                [("role".to_string(), "gpu".to_string())].into_iter().collect(),
            ),
            ..Default::default()
        };
        // Node has no labels, so the selector does not match.
        let mut sc = make_collector(vec![make_policy(true, Some(selector))]);
        sc.update_collectors();
        assert!(sc.active_collector_names().is_empty());
    }

    #[test]
    fn test_update_collectors_tears_bundle_down() {
        let mut sc = make_collector(vec![make_policy(true, None)]);
        sc.update_collectors();
        assert!(!sc.active_collector_names().is_empty());

        sc.policy_lister = Arc::new(Vec::new);
        sc.update_collectors();
        assert!(sc.active_collector_names().is_empty());
    }

    #[tokio::test]
    async fn test_collect_once_without_collectors_publishes_nothing() {
        let sc = make_collector(vec![]);
        sc.collect_once().await;
        assert!(!sc.state.is_ready());
    }

    #[tokio::test]
    async fn test_collect_once_merges_collector_outputs() {
        struct Fixed(&'static str, f64);
        impl Collector for Fixed {
            fn name(&self) -> &'static str {
                self.0
            }
            fn collect(&mut self) -> Result<MetricSeries> {
                let mut m = MetricSeries::new();
                m.insert(self.0.to_string(), vec![TimeSeries::scalar(self.1, 0)]);
                Ok(m)
            }
        }
        struct Failing;
        impl Collector for Failing {
            fn name(&self) -> &'static str {
                "failing"
            }
            fn collect(&mut self) -> Result<MetricSeries> {
                anyhow::bail!("backend unavailable")
            }
        }

        let mut sc = make_collector(vec![]);
        sc.insert(Box::new(Fixed("m1", 1.0)));
        sc.insert(Box::new(Fixed("m2", 2.0)));
        sc.insert(Box::new(Failing));

        sc.collect_once().await;

        // A single failing collector does not block the snapshot.
        let snapshot = sc.state.load().expect("snapshot published");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["m1"][0].latest(), Some(1.0));
        assert_eq!(snapshot["m2"][0].latest(), Some(2.0));
    }
}
