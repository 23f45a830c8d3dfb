use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::ResourceExt;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::avoidance::{ActionPlan, merge};
use crate::collector::{NodeLabelsFn, PodLister, StateStore};
use crate::crd::{
    AvoidanceAction, DEFAULT_SCHEDULING_COOL_DOWN_SECONDS, NodeQOSEnsurancePolicy,
    ObjectiveEnsurance,
};
use crate::policy::{DetectionCache, DetectionCondition, next_detection_state};
use crate::quantity::parse_quantity;
use crate::selector::{selector_matches, selector_to_pairs};
use crate::series::{MetricSeries, max_latest, max_latest_matching};

pub const ANALYZE_INTERVAL: Duration = Duration::from_secs(10);

pub const REASON_TRIGGERED: &str = "ObjectiveEnsuranceTriggered";
pub const REASON_RESTORED: &str = "ObjectiveEnsuranceRestored";

/// Provides the current avoidance-action set.
pub type ActionLister = Arc<dyn Fn() -> Vec<AvoidanceAction> + Send + Sync>;

/// Publishes Kubernetes events on the policies that own a detection.
pub struct EventPublisher {
    client: kube::Client,
    reporter: Reporter,
}

impl EventPublisher {
    pub fn new(client: kube::Client, controller: &str, instance: String) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.to_string(),
                instance: Some(instance),
            },
        }
    }

    pub async fn publish(&self, reference: ObjectReference, event: Event) -> anyhow::Result<()> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        recorder.publish(event).await?;
        Ok(())
    }
}

/* ============================= EVALUATION ============================= */

/// Evaluate one objective against the snapshot, carrying the previous tick's
/// detection state forward.
///
/// Returns None (and leaves the cached state untouched) when the rule is
/// malformed or the metric has no value this tick; a bad objective never
/// blocks its siblings.
pub fn evaluate_objective(
    policy_namespace: &str,
    policy_name: &str,
    objective: &ObjectiveEnsurance,
    action: Option<&AvoidanceAction>,
    snapshot: &MetricSeries,
    cache: &DetectionCache,
    now: DateTime<Utc>,
) -> Option<DetectionCondition> {
    let metric_name = objective.metric_rule.metric.name.as_str();
    if metric_name.is_empty() {
        warn!(policy = policy_name, "objective_missing_metric_name");
        return None;
    }

    let Some(target) = parse_quantity(&objective.metric_rule.target.value) else {
        warn!(
            policy = policy_name,
            metric = metric_name,
            target = %objective.metric_rule.target.value,
            "objective_target_not_parsable"
        );
        return None;
    };

    let all = snapshot.get(metric_name)?;
    let value = match &objective.metric_rule.metric.selector {
        Some(selector) => max_latest_matching(all, &selector_to_pairs(selector)),
        None => max_latest(all),
    }?;

    let mut detection = DetectionCondition {
        policy_namespace: policy_namespace.to_string(),
        policy_name: policy_name.to_string(),
        action_name: objective.avoidance_action_name.clone(),
        metric_name: metric_name.to_string(),
        target_value: target,
        dry_run: objective.only_dry_run,
        cool_down_seconds: objective
            .cool_down_seconds
            .or(action.map(|a| a.spec.scheduling_cool_down()))
            .unwrap_or(DEFAULT_SCHEDULING_COOL_DOWN_SECONDS),
        ..Default::default()
    };

    let previous = cache.get(&detection.key());
    let (triggered, restored) =
        next_detection_state(previous.as_ref().is_some_and(|p| p.triggered), value, target);
    detection.triggered = triggered;
    detection.restored = restored;
    detection.last_triggered_time = if triggered {
        Some(now)
    } else {
        previous.and_then(|p| p.last_triggered_time)
    };

    debug!(
        detection = %detection.key(),
        value,
        target,
        triggered,
        restored,
        "objective_evaluated"
    );
    Some(detection)
}

/// Evaluate every objective of one policy. Used by the periodic analyzer and
/// by the per-policy probe loops.
pub fn evaluate_policy(
    policy: &NodeQOSEnsurancePolicy,
    actions: &HashMap<String, AvoidanceAction>,
    snapshot: &MetricSeries,
    cache: &DetectionCache,
    now: DateTime<Utc>,
) -> Vec<DetectionCondition> {
    let namespace = policy.namespace().unwrap_or_default();
    let name = policy.name_any();

    policy
        .spec
        .objective_ensurances
        .iter()
        .filter_map(|objective| {
            evaluate_objective(
                &namespace,
                &name,
                objective,
                actions.get(&objective.avoidance_action_name),
                snapshot,
                cache,
                now,
            )
        })
        .collect()
}

pub fn index_actions(actions: Vec<AvoidanceAction>) -> HashMap<String, AvoidanceAction> {
    actions
        .into_iter()
        .map(|a| (a.name_any(), a))
        .collect()
}

/* ============================= ANALYZER ============================= */

/// Periodic consumer of (policies, actions, state snapshot); produces
/// detection conditions and hands merged plans to the executor.
pub struct Analyzer {
    pub node_name: String,
    pub policy_lister: Arc<dyn Fn() -> Vec<NodeQOSEnsurancePolicy> + Send + Sync>,
    pub action_lister: ActionLister,
    pub pod_lister: PodLister,
    pub node_labels: NodeLabelsFn,
    pub state: Arc<StateStore>,
    pub detections: Arc<DetectionCache>,
    pub plan_tx: mpsc::Sender<ActionPlan>,
    pub events: Option<EventPublisher>,
}

impl Analyzer {
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(ANALYZE_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("analyzer_stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.analyze_once(Utc::now()).await;
                }
            }
        }
    }

    /// One full pass: evaluate, record changes, merge, notify.
    pub async fn analyze_once(&self, now: DateTime<Utc>) {
        let Some(snapshot) = self.state.load() else {
            debug!("no_state_snapshot_yet");
            return;
        };

        let labels = (self.node_labels)();
        let policies: Vec<NodeQOSEnsurancePolicy> = (self.policy_lister)()
            .into_iter()
            .filter(|p| selector_matches(p.spec.selector.as_ref(), &labels))
            .collect();
        let actions = index_actions((self.action_lister)());

        for policy in &policies {
            for detection in evaluate_policy(policy, &actions, &snapshot, &self.detections, now) {
                self.record_detection(policy, detection).await;
            }
        }

        let detections = self.detections.list();
        for detection in detections.iter().filter(|d| d.dry_run && d.triggered) {
            info!(detection = %detection.key(), "dry_run_detection_triggered");
        }

        let pods = (self.pod_lister)();
        let plan = merge(&detections, &actions, &pods, Some(&snapshot), now);
        if plan.is_empty() {
            return;
        }

        // The executor consumes one plan at a time; a busy executor simply
        // skips this tick, avoidance is idempotent.
        if let Err(e) = self.plan_tx.try_send(plan) {
            debug!(error = %e, "plan_dropped_executor_busy");
        }
    }

    async fn record_detection(&self, policy: &NodeQOSEnsurancePolicy, detection: DetectionCondition) {
        let changed = self.detections.set(detection.clone());
        if !changed {
            return;
        }

        if detection.triggered {
            info!(detection = %detection.key(), metric = %detection.metric_name, "objective_triggered");
            self.publish_event(policy, REASON_TRIGGERED, &detection).await;
        } else if detection.restored {
            info!(detection = %detection.key(), metric = %detection.metric_name, "objective_restored");
            self.publish_event(policy, REASON_RESTORED, &detection).await;
        }
    }

    async fn publish_event(
        &self,
        policy: &NodeQOSEnsurancePolicy,
        reason: &str,
        detection: &DetectionCondition,
    ) {
        let Some(events) = &self.events else {
            return;
        };

        let reference = ObjectReference {
            api_version: Some("ensurance.crane.io/v1alpha1".to_string()),
            kind: Some("NodeQOSEnsurancePolicy".to_string()),
            name: policy.metadata.name.clone(),
            namespace: policy.metadata.namespace.clone(),
            uid: policy.metadata.uid.clone(),
            ..Default::default()
        };
        let event = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(format!(
                "{}/{} on metric {}",
                detection.policy_name, detection.action_name, detection.metric_name
            )),
            action: "Analyze".to_string(),
            secondary: None,
        };
        if let Err(e) = events.publish(reference, event).await {
            warn!(error = %e, "event_publish_failed");
        }
    }
}

/* ============================= TESTS ============================= */
