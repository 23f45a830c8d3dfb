use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= PROBE TYPES ============================= */

/// Marker enabling node-local metric collection for a policy.
///
/// Presence of this block (even empty) makes the agent run the node-local
/// collector bundle (cpu, load, memory, disk io, net io, containers).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeLocalGet {
    /// Seconds a locally cached sample stays valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_cache_ttl_seconds: Option<i64>,
}

/// How node quality is probed for a policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeQualityProbe {
    /// Sample node state from the local collectors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_local_get: Option<NodeLocalGet>,

    /// Probe period in seconds. Defaults to 10.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<i64>,
}

impl NodeQualityProbe {
    pub fn period_seconds(&self) -> i64 {
        self.period_seconds.unwrap_or(DEFAULT_PROBE_PERIOD_SECONDS)
    }
}

pub const DEFAULT_PROBE_PERIOD_SECONDS: i64 = 10;

/* ============================= OBJECTIVE TYPES ============================= */

/// The metric a rule observes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricIdentifier {
    /// Metric name as published by the collectors (e.g. "cpu_load_1_min").
    pub name: String,

    /// Label selector for multi-dimensional metrics (disk, net, container).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

/// Comparison target for a rule, expressed as a resource quantity string.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricTarget {
    /// Target type; only "Value" is supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,

    /// Threshold quantity (e.g. "8", "500m", "4Gi").
    pub value: String,
}

/// A (metric, target) pair.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricRule {
    pub metric: MetricIdentifier,
    pub target: MetricTarget,
}

/// One rule inside a policy: when `metricRule` exceeds its target, run the
/// named avoidance action.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectiveEnsurance {
    /// Rule name, unique within the policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub metric_rule: MetricRule,

    /// Name of the AvoidanceAction to run when triggered.
    pub avoidance_action_name: String,

    /// Detect and report only; never act.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub only_dry_run: bool,

    /// Per-rule override of the action's scheduling cool-down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cool_down_seconds: Option<i64>,
}

/* ============================= POLICY CRD ============================= */

/// NodeQOSEnsurancePolicy declares when a node is under pressure and which
/// avoidance actions mitigate it.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "ensurance.crane.io",
    version = "v1alpha1",
    kind = "NodeQOSEnsurancePolicy",
    plural = "nodeqosensurancepolicies",
    shortname = "nep",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NodeQOSEnsurancePolicySpec {
    /// Nodes this policy applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// How node quality is sampled.
    #[serde(default)]
    pub node_quality_probe: NodeQualityProbe,

    /// Ordered detection rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objective_ensurances: Vec<ObjectiveEnsurance>,
}

/* ============================= ACTION TYPES ============================= */

/// CPU throttling parameters.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CpuThrottleAction {
    /// Floor for the new quota, as a percentage of the container CPU limit
    /// (0-100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_cpu_ratio: Option<i64>,

    /// Percentage removed from (or added back to) the quota per tick (1-100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_cpu_ratio: Option<i64>,
}

/// Memory throttling parameters.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemoryThrottleAction {
    /// Force page-cache reclaim on victim containers.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force_gc: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_throttle: Option<CpuThrottleAction>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_throttle: Option<MemoryThrottleAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EvictionAction {
    /// Grace period handed to the eviction API. Defaults to 30.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_grace_period_seconds: Option<i64>,
}

/* ============================= ACTION CRD ============================= */

/// AvoidanceAction names a mitigation: throttle ratios, eviction grace and
/// the cool-down before schedule restore.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "ensurance.crane.io",
    version = "v1alpha1",
    kind = "AvoidanceAction",
    plural = "avoidanceactions"
)]
#[serde(rename_all = "camelCase")]
pub struct AvoidanceActionSpec {
    /// Seconds to wait after the last trigger before schedule restore.
    /// Defaults to 300.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_cool_down: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ThrottleAction>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction: Option<EvictionAction>,
}

pub const DEFAULT_SCHEDULING_COOL_DOWN_SECONDS: i64 = 300;
pub const DEFAULT_DELETION_GRACE_PERIOD_SECONDS: i64 = 30;

impl AvoidanceActionSpec {
    pub fn scheduling_cool_down(&self) -> i64 {
        self.scheduling_cool_down
            .unwrap_or(DEFAULT_SCHEDULING_COOL_DOWN_SECONDS)
    }

    pub fn deletion_grace_period_seconds(&self) -> i64 {
        self.eviction
            .as_ref()
            .and_then(|e| e.deletion_grace_period_seconds)
            .unwrap_or(DEFAULT_DELETION_GRACE_PERIOD_SECONDS)
    }
}

/* ============================= TESTS ============================= */
