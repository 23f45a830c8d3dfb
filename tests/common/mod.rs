#![allow(dead_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodStatus, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use kube_nodeqos::crd::{
    AvoidanceAction, AvoidanceActionSpec, CpuThrottleAction, EvictionAction, MetricIdentifier,
    MetricRule, MetricTarget, NodeQOSEnsurancePolicy, NodeQOSEnsurancePolicySpec, NodeLocalGet,
    NodeQualityProbe, ObjectiveEnsurance, ThrottleAction,
};
use kube_nodeqos::series::{MetricSeries, TimeSeries};

pub const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub fn make_test_pod(name: &str, cpu_request: &str, cpu_limit: &str, priority: i32) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        spec: Some(PodSpec {
            priority: Some(priority),
            containers: vec![Container {
                name: "c1".to_string(),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "cpu".to_string(),
                        Quantity(cpu_request.to_string()),
                    )])),
                    limits: Some(BTreeMap::from([(
                        "cpu".to_string(),
                        Quantity(cpu_limit.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            qos_class: Some("Burstable".to_string()),
            ..Default::default()
        }),
    }
}

pub fn make_policy(name: &str, objectives: Vec<ObjectiveEnsurance>) -> NodeQOSEnsurancePolicy {
    let mut policy = NodeQOSEnsurancePolicy::new(
        name,
        NodeQOSEnsurancePolicySpec {
            selector: None,
            node_quality_probe: NodeQualityProbe {
                node_local_get: Some(NodeLocalGet::default()),
                period_seconds: Some(10),
            },
            objective_ensurances: objectives,
        },
    );
    policy.metadata.namespace = Some("default".to_string());
    policy
}

pub fn make_objective(metric: &str, target: &str, action: &str) -> ObjectiveEnsurance {
    ObjectiveEnsurance {
        name: Some(format!("{metric}-rule")),
        metric_rule: MetricRule {
            metric: MetricIdentifier {
                name: metric.to_string(),
                selector: None,
            },
            target: MetricTarget {
                r#type: Some("Value".to_string()),
                value: target.to_string(),
            },
        },
        avoidance_action_name: action.to_string(),
        only_dry_run: false,
        cool_down_seconds: None,
    }
}

pub fn make_action(name: &str, cool_down: i64) -> AvoidanceAction {
    AvoidanceAction::new(
        name,
        AvoidanceActionSpec {
            scheduling_cool_down: Some(cool_down),
            throttle: None,
            eviction: None,
        },
    )
}

pub fn with_cpu_throttle(mut action: AvoidanceAction, min: i64, step: i64) -> AvoidanceAction {
    action.spec.throttle = Some(ThrottleAction {
        cpu_throttle: Some(CpuThrottleAction {
            min_cpu_ratio: Some(min),
            step_cpu_ratio: Some(step),
        }),
        memory_throttle: None,
    });
    action
}

pub fn with_eviction(mut action: AvoidanceAction, grace: i64) -> AvoidanceAction {
    action.spec.eviction = Some(EvictionAction {
        deletion_grace_period_seconds: Some(grace),
    });
    action
}

pub fn snapshot(entries: &[(&str, f64)]) -> MetricSeries {
    let mut out = MetricSeries::new();
    for (metric, value) in entries {
        out.insert(metric.to_string(), vec![TimeSeries::scalar(*value, 0)]);
    }
    out
}
