use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::collector::{PodLister, StateStore};
use crate::crd::AvoidanceAction;
use crate::executor::evict::{EvictExecutor, PodEvictor};
use crate::executor::podinfo::{ActionType, PodContext, eligible_for_avoidance};
use crate::executor::schedule::{self, NodeOps};
use crate::executor::throttle::ThrottleExecutor;
use crate::executor::waterline::{MetricRegistry, push_waterline};
use crate::executor::ExecuteContext;
use crate::policy::DetectionCondition;
use crate::runtime::ContainerRuntime;
use crate::series::MetricSeries;

/* ============================= PLAN ============================= */

/// QoS class and priority recorded with a schedule toggle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScheduledQosPriority {
    pub qos_class: String,
    pub priority: i32,
}

/// One tick's consolidated mitigation, consumed by the executors.
#[derive(Debug, Clone, Default)]
pub struct ActionPlan {
    pub schedule_disable: Option<ScheduledQosPriority>,
    pub schedule_restore: Option<ScheduledQosPriority>,
    pub throttle: ThrottleExecutor,
    pub evict: EvictExecutor,
}

impl ActionPlan {
    pub fn is_empty(&self) -> bool {
        self.schedule_disable.is_none()
            && self.schedule_restore.is_none()
            && self.throttle.throttle_down_pods.is_empty()
            && self.throttle.throttle_up_pods.is_empty()
            && self.evict.evict_pods.is_empty()
    }
}

/* ============================= MERGE ============================= */

fn lowest_qos_priority(pods: &[&Pod]) -> ScheduledQosPriority {
    pods.iter()
        .map(|p| ScheduledQosPriority {
            qos_class: p
                .status
                .as_ref()
                .and_then(|s| s.qos_class.clone())
                .unwrap_or_default(),
            priority: p.spec.as_ref().and_then(|s| s.priority).unwrap_or(0),
        })
        .min_by_key(|s| s.priority)
        .unwrap_or(ScheduledQosPriority {
            qos_class: "BestEffort".to_string(),
            priority: 0,
        })
}

fn cool_down_elapsed(detection: &DetectionCondition, now: DateTime<Utc>) -> bool {
    match detection.last_triggered_time {
        None => true,
        Some(last) => now - last >= Duration::seconds(detection.cool_down_seconds),
    }
}

/// Transform the tick's detections plus the avoidance-action index into one
/// ActionPlan.
///
/// Triggered detections win: while anything is triggered, the node is made
/// unschedulable and only down-actions are planned. Restores (schedule and
/// throttle-up) are planned only when nothing is triggered, and schedule
/// restore additionally waits out every restored action's cool-down.
/// Multi-policy merges are additive: pod pools union by key, the most
/// aggressive CPU ratios win, forceGC is OR-ed, the shortest eviction grace
/// wins.
pub fn merge(
    detections: &[DetectionCondition],
    actions: &HashMap<String, AvoidanceAction>,
    pods: &[Pod],
    snapshot: Option<&MetricSeries>,
    now: DateTime<Utc>,
) -> ActionPlan {
    let mut plan = ActionPlan::default();

    let active: Vec<&DetectionCondition> =
        detections.iter().filter(|d| !d.dry_run).collect();
    let triggered: Vec<&DetectionCondition> =
        active.iter().copied().filter(|d| d.triggered).collect();
    let restored: Vec<&DetectionCondition> =
        active.iter().copied().filter(|d| d.restored).collect();

    let eligible: Vec<&Pod> = pods.iter().filter(|p| eligible_for_avoidance(p)).collect();

    if !triggered.is_empty() {
        plan.schedule_disable = Some(lowest_qos_priority(&eligible));

        let mut down_pool: HashMap<String, PodContext> = HashMap::new();
        let mut evict_pool: HashMap<String, PodContext> = HashMap::new();

        for detection in &triggered {
            let Some(action) = actions.get(&detection.action_name) else {
                warn!(action = %detection.action_name, detection = %detection.key(), "avoidance_action_not_found");
                continue;
            };

            if let Some(throttle) = &action.spec.throttle {
                push_waterline(
                    &mut plan.throttle.down_waterline,
                    &detection.metric_name,
                    detection.target_value,
                );

                let cpu = throttle.cpu_throttle.as_ref();
                let force_gc = throttle
                    .memory_throttle
                    .as_ref()
                    .is_some_and(|m| m.force_gc);

                for pod in &eligible {
                    let entry = down_pool.entry(pod_key_of(pod)).or_insert_with(|| {
                        let mut context =
                            PodContext::build(pod, snapshot, ActionType::ThrottleDown);
                        // Identity for the min-merge below.
                        context.cpu_throttle.min_cpu_ratio = 100;
                        context
                    });
                    if let Some(cpu) = cpu {
                        // Most aggressive ratios win across policies: the
                        // deepest step and the lowest quota floor.
                        entry.cpu_throttle.step_cpu_ratio = entry
                            .cpu_throttle
                            .step_cpu_ratio
                            .max(cpu.step_cpu_ratio.unwrap_or(0));
                        entry.cpu_throttle.min_cpu_ratio = entry
                            .cpu_throttle
                            .min_cpu_ratio
                            .min(cpu.min_cpu_ratio.unwrap_or(100));
                    }
                    entry.force_gc |= force_gc;
                }
            }

            if action.spec.eviction.is_some() {
                push_waterline(
                    &mut plan.evict.evict_waterline,
                    &detection.metric_name,
                    detection.target_value,
                );
                let grace = action.spec.deletion_grace_period_seconds();

                for pod in &eligible {
                    let entry = evict_pool.entry(pod_key_of(pod)).or_insert_with(|| {
                        let mut context = PodContext::build(pod, snapshot, ActionType::Evict);
                        context.deletion_grace_period_seconds = grace;
                        context
                    });
                    // Shortest grace period wins across actions.
                    entry.deletion_grace_period_seconds =
                        entry.deletion_grace_period_seconds.min(grace);
                }
            }
        }

        plan.throttle.throttle_down_pods = down_pool.into_values().collect();
        plan.evict.evict_pods = evict_pool.into_values().collect();
        return plan;
    }

    if restored.is_empty() {
        return plan;
    }

    if restored.iter().all(|d| cool_down_elapsed(d, now)) {
        plan.schedule_restore = Some(lowest_qos_priority(&eligible));
    }

    let mut up_pool: HashMap<String, PodContext> = HashMap::new();
    for detection in &restored {
        let Some(action) = actions.get(&detection.action_name) else {
            warn!(action = %detection.action_name, detection = %detection.key(), "avoidance_action_not_found");
            continue;
        };
        let Some(throttle) = &action.spec.throttle else {
            continue;
        };

        push_waterline(
            &mut plan.throttle.up_waterline,
            &detection.metric_name,
            detection.target_value,
        );

        for pod in &eligible {
            let entry = up_pool.entry(pod_key_of(pod)).or_insert_with(|| {
                let mut context = PodContext::build(pod, snapshot, ActionType::ThrottleUp);
                context.cpu_throttle.min_cpu_ratio = 100;
                context
            });
            if let Some(cpu) = &throttle.cpu_throttle {
                entry.cpu_throttle.step_cpu_ratio = entry
                    .cpu_throttle
                    .step_cpu_ratio
                    .max(cpu.step_cpu_ratio.unwrap_or(0));
                entry.cpu_throttle.min_cpu_ratio = entry
                    .cpu_throttle
                    .min_cpu_ratio
                    .min(cpu.min_cpu_ratio.unwrap_or(100));
            }
        }
    }
    plan.throttle.throttle_up_pods = up_pool.into_values().collect();

    plan
}

fn pod_key_of(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

/* ============================= MANAGER ============================= */

/// Consumes plans from the analyzer channel and drives them against the
/// cluster: schedule toggle first, then eviction, then throttling.
pub struct AvoidanceManager<N, E> {
    pub node_name: String,
    pub pod_lister: PodLister,
    pub state: Arc<StateStore>,
    pub nodes: N,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub evictor: E,
}

impl<N: NodeOps, E: PodEvictor> AvoidanceManager<N, E> {
    pub async fn run(
        self,
        mut plan_rx: mpsc::Receiver<ActionPlan>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("avoidance_manager_stopped");
                    return;
                }
                plan = plan_rx.recv() => {
                    let Some(plan) = plan else {
                        info!("plan_channel_closed");
                        return;
                    };
                    self.execute_plan(plan).await;
                }
            }
        }
    }

    /// A failed phase is logged and the remaining phases still run; the
    /// next tick produces a fresh plan anyway.
    pub async fn execute_plan(&self, mut plan: ActionPlan) {
        let ctx = ExecuteContext {
            node_name: self.node_name.clone(),
            pods: (self.pod_lister)(),
            snapshot: self.state.load(),
            registry: MetricRegistry::bootstrap(),
        };

        if plan.schedule_disable.is_some() {
            if let Err(e) = schedule::avoid(&self.nodes).await {
                warn!(error = %e, "schedule_disable_failed");
            }
        } else if plan.schedule_restore.is_some() {
            if let Err(e) = schedule::restore(&self.nodes).await {
                warn!(error = %e, "schedule_restore_failed");
            }
        }

        if let Err(e) = plan.evict.avoid(&ctx, &self.evictor).await {
            warn!(error = %e, "evict_failed");
        }

        if let Err(e) = plan.throttle.avoid(&ctx, self.runtime.as_ref()) {
            warn!(error = %e, "throttle_failed");
        }
        if let Err(e) = plan.throttle.restore(&ctx, self.runtime.as_ref()) {
            warn!(error = %e, "throttle_restore_failed");
        }
    }
}

/* ============================= TESTS ============================= */
