use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, warn};

use crate::quantity::{almost_equal, parse_quantity};
use crate::runtime::{ContainerRuntime, UpdateOptions};
use crate::series;

use super::podinfo::{
    PodContext, container_cpu_request_limit, first_unactioned, general_sorter,
    usage_by_id,
};
use super::waterline::{WaterLines, build_gap_to_waterlines};
use super::{ExecuteContext, ReleaseResource};

/// Quota in cores above which a restored container with no limit is simply
/// released to an unlimited quota.
pub const MAX_UP_CORES: f64 = 60.0;

const MAX_RATIO: f64 = 100.0;

/// Pod annotation overriding the CPU limit cap during restore.
pub const EXT_CPU_ANNOTATION: &str = "ensurance.crane.io/ext-cpu";

/* ============================= EXECUTOR ============================= */

/// CPU throttling pools and the water-lines of the objectives that selected
/// them. Built fresh by the merger each tick.
#[derive(Debug, Clone, Default)]
pub struct ThrottleExecutor {
    pub throttle_down_pods: Vec<PodContext>,
    pub throttle_up_pods: Vec<PodContext>,
    pub down_waterline: WaterLines,
    pub up_waterline: WaterLines,
}

impl ThrottleExecutor {
    /// Push victim quotas down until the measured usage fits under the
    /// strictest active water-line.
    ///
    /// Falls back to throttling the whole pool when a water-line metric has
    /// no numeric usage to steer by; otherwise sorts the pool per metric and
    /// stops as soon as the gap is closed.
    pub fn avoid(&mut self, ctx: &ExecuteContext, runtime: &dyn ContainerRuntime) -> Result<()> {
        if self.throttle_down_pods.is_empty() {
            return Ok(());
        }
        debug!(pods = self.throttle_down_pods.len(), "throttle_avoid");

        let mut err_keys: Vec<String> = Vec::new();
        let mut total_released = ReleaseResource::default();

        if ctx.registry.has_unqualified(&self.down_waterline, false) {
            for index in 0..self.throttle_down_pods.len() {
                let (errs, _) = throttle_one_pod(
                    ctx,
                    runtime,
                    &self.throttle_down_pods[index],
                    &mut total_released,
                );
                err_keys.extend(errs);
            }
        } else {
            let (mut down_gaps, _, _) = build_gap_to_waterlines(
                ctx.snapshot.as_deref(),
                &ctx.registry,
                &self.down_waterline,
                &self.up_waterline,
                &WaterLines::new(),
            );

            if down_gaps.has_usage_missed_metric() {
                for index in 0..self.throttle_down_pods.len() {
                    let (errs, _) = throttle_one_pod(
                        ctx,
                        runtime,
                        &self.throttle_down_pods[index],
                        &mut total_released,
                    );
                    err_keys.extend(errs);
                }
            } else {
                for metric in ctx.registry.qualified_metrics() {
                    let throttleable = ctx
                        .registry
                        .get(metric)
                        .is_some_and(|m| m.throttleable);
                    if !throttleable {
                        continue;
                    }

                    match ctx.registry.get(metric).and_then(|m| m.sort) {
                        Some(sort) => sort(&mut self.throttle_down_pods),
                        None => general_sorter(&mut self.throttle_down_pods),
                    }

                    while !down_gaps.target_gaps_removed(metric) {
                        let Some(index) = first_unactioned(&self.throttle_down_pods) else {
                            break;
                        };
                        let (errs, released) = throttle_one_pod(
                            ctx,
                            runtime,
                            &self.throttle_down_pods[index],
                            &mut total_released,
                        );
                        err_keys.extend(errs);
                        self.throttle_down_pods[index].has_been_actioned = true;
                        down_gaps.subtract(series::CPU_TOTAL_USAGE, released.cpu);
                        down_gaps.subtract(series::MEMORY_TOTAL_USAGE, released.memory);
                    }
                }
            }
        }

        if err_keys.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("some pod throttle failed: {}", err_keys.join("; "))
        }
    }

    /// Raise victim quotas back toward their limits once pressure is gone.
    /// Pools are sorted like `avoid` and then reversed, so the least greedy
    /// pods recover first.
    pub fn restore(&mut self, ctx: &ExecuteContext, runtime: &dyn ContainerRuntime) -> Result<()> {
        if self.throttle_up_pods.is_empty() {
            return Ok(());
        }
        debug!(pods = self.throttle_up_pods.len(), "throttle_restore");

        let mut err_keys: Vec<String> = Vec::new();
        let mut total_released = ReleaseResource::default();

        if ctx.registry.has_unqualified(&self.up_waterline, false) {
            for index in 0..self.throttle_up_pods.len() {
                let (errs, _) = restore_one_pod(
                    ctx,
                    runtime,
                    &mut self.throttle_up_pods[index],
                    &mut total_released,
                );
                err_keys.extend(errs);
            }
        } else {
            let (_, mut up_gaps, _) = build_gap_to_waterlines(
                ctx.snapshot.as_deref(),
                &ctx.registry,
                &self.down_waterline,
                &self.up_waterline,
                &WaterLines::new(),
            );

            if up_gaps.has_usage_missed_metric() {
                for index in 0..self.throttle_up_pods.len() {
                    let (errs, _) = restore_one_pod(
                        ctx,
                        runtime,
                        &mut self.throttle_up_pods[index],
                        &mut total_released,
                    );
                    err_keys.extend(errs);
                }
            } else {
                for metric in ctx.registry.qualified_metrics() {
                    let throttleable = ctx
                        .registry
                        .get(metric)
                        .is_some_and(|m| m.throttleable);
                    if !throttleable {
                        continue;
                    }

                    match ctx.registry.get(metric).and_then(|m| m.sort) {
                        Some(sort) => sort(&mut self.throttle_up_pods),
                        None => general_sorter(&mut self.throttle_up_pods),
                    }
                    self.throttle_up_pods.reverse();

                    while !up_gaps.target_gaps_removed(metric) {
                        let Some(index) = first_unactioned(&self.throttle_up_pods) else {
                            break;
                        };
                        let (errs, released) = restore_one_pod(
                            ctx,
                            runtime,
                            &mut self.throttle_up_pods[index],
                            &mut total_released,
                        );
                        err_keys.extend(errs);
                        self.throttle_up_pods[index].has_been_actioned = true;
                        up_gaps.subtract(series::CPU_TOTAL_USAGE, released.cpu);
                        up_gaps.subtract(series::MEMORY_TOTAL_USAGE, released.memory);
                    }
                }
            }
        }

        if err_keys.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("some pod throttle restore failed: {}", err_keys.join("; "))
        }
    }
}

/* ============================= PER-POD ============================= */

/// New down-throttled quota in cores for one container.
///
/// Starts from quota/period (or live usage when no quota is set), removes
/// one step, then floors at the CPU request and at limit * minCPURatio.
pub fn throttled_quota_cores(
    current_usage: f64,
    quota: f64,
    period: f64,
    step_ratio: i64,
    request: Option<f64>,
    limit: Option<f64>,
    min_ratio: i64,
) -> f64 {
    let step = 1.0 - step_ratio as f64 / MAX_RATIO;
    let mut new = if almost_equal(quota, -1.0) || almost_equal(quota, 0.0) {
        current_usage * step
    } else {
        quota / period * step
    };

    if let Some(request) = request
        && request > new
    {
        new = request;
    }
    if let Some(limit) = limit {
        let floor = limit * min_ratio as f64 / MAX_RATIO;
        if floor > new {
            new = floor;
        }
    }
    new
}

fn throttle_one_pod(
    ctx: &ExecuteContext,
    runtime: &dyn ContainerRuntime,
    pod_ctx: &PodContext,
    total_released: &mut ReleaseResource,
) -> (Vec<String>, ReleaseResource) {
    let mut err_keys = Vec::new();
    let mut released = ReleaseResource::default();

    let Some(pod) = ctx.find_pod(&pod_ctx.key.namespace, &pod_ctx.key.name) else {
        return (vec![format!("pod {} not found", pod_ctx.key)], released);
    };

    for usage in &pod_ctx.container_cpu_usages {
        // The pod-level cgroup entry carries no container name; skip it.
        if usage.container_name.is_empty() {
            continue;
        }

        let Some(quota) = usage_by_id(&pod_ctx.container_cpu_quotas, &usage.container_id) else {
            err_keys.push(format!("no cpu quota for {}/{}", pod_ctx.key, usage.container_name));
            continue;
        };
        let Some(period) = usage_by_id(&pod_ctx.container_cpu_periods, &usage.container_id) else {
            err_keys.push(format!("no cpu period for {}/{}", pod_ctx.key, usage.container_name));
            continue;
        };

        let (request, limit) = container_cpu_request_limit(pod, &usage.container_name);
        let new = throttled_quota_cores(
            usage.value,
            quota,
            period,
            pod_ctx.cpu_throttle.step_cpu_ratio,
            request,
            limit,
            pod_ctx.cpu_throttle.min_cpu_ratio,
        );

        if !almost_equal(new * period, quota) {
            let result = runtime.update_container_resources(
                &usage.container_id,
                UpdateOptions {
                    cpu_quota: (new * period).round() as i64,
                    cpu_period: period as i64,
                    ..Default::default()
                },
            );
            if let Err(e) = result {
                warn!(pod = %pod_ctx.key, container = %usage.container_name, error = %e, "throttle_update_failed");
                err_keys.push(format!("failed to update {}/{}: {e}", pod_ctx.key, usage.container_name));
                continue;
            }
            debug!(pod = %pod_ctx.key, container = %usage.container_name, quota_cores = new, "container_throttled");
        }

        released.cpu += (usage.value - new).max(0.0);
    }

    total_released.add(released);
    (err_keys, released)
}

/// New up-restored quota in cores; None means leave the container alone,
/// -1.0 means release the quota entirely.
pub fn restored_quota_cores(
    quota: f64,
    period: f64,
    step_ratio: i64,
    limit: Option<f64>,
    ext_cpu: Option<f64>,
) -> Option<f64> {
    if almost_equal(quota, -1.0) || almost_equal(quota, 0.0) {
        return None;
    }
    let mut new = quota / period * (1.0 + step_ratio as f64 / MAX_RATIO);

    match limit {
        Some(limit) if new > limit => new = limit,
        Some(_) => {}
        None => {
            if let Some(ext) = ext_cpu {
                new = ext;
            } else if new > MAX_UP_CORES {
                new = -1.0;
            }
        }
    }
    Some(new)
}

fn restore_one_pod(
    ctx: &ExecuteContext,
    runtime: &dyn ContainerRuntime,
    pod_ctx: &mut PodContext,
    total_released: &mut ReleaseResource,
) -> (Vec<String>, ReleaseResource) {
    let mut err_keys = Vec::new();
    let mut released = ReleaseResource::default();

    let Some(pod) = ctx.find_pod(&pod_ctx.key.namespace, &pod_ctx.key.name) else {
        return (vec![format!("pod {} not found", pod_ctx.key)], released);
    };
    let ext_cpu = ext_cpu_override(pod);

    for usage in &pod_ctx.container_cpu_usages {
        if usage.container_name.is_empty() {
            continue;
        }

        let Some(quota) = usage_by_id(&pod_ctx.container_cpu_quotas, &usage.container_id) else {
            err_keys.push(format!("no cpu quota for {}/{}", pod_ctx.key, usage.container_name));
            continue;
        };
        let Some(period) = usage_by_id(&pod_ctx.container_cpu_periods, &usage.container_id) else {
            err_keys.push(format!("no cpu period for {}/{}", pod_ctx.key, usage.container_name));
            continue;
        };

        let (_, limit) = container_cpu_request_limit(pod, &usage.container_name);
        let Some(new) = restored_quota_cores(
            quota,
            period,
            pod_ctx.cpu_throttle.step_cpu_ratio,
            limit,
            ext_cpu,
        ) else {
            continue;
        };

        if !almost_equal(new * period, quota) {
            let quota_usec = if almost_equal(new, -1.0) {
                -1
            } else {
                (new * period).round() as i64
            };
            let result = runtime.update_container_resources(
                &usage.container_id,
                UpdateOptions {
                    cpu_quota: quota_usec,
                    cpu_period: period as i64,
                    ..Default::default()
                },
            );
            if let Err(e) = result {
                warn!(pod = %pod_ctx.key, container = %usage.container_name, error = %e, "restore_update_failed");
                err_keys.push(format!("failed to update {}/{}: {e}", pod_ctx.key, usage.container_name));
                continue;
            }
            debug!(pod = %pod_ctx.key, container = %usage.container_name, quota_cores = new, "container_restored");
        }

        if new > 0.0 {
            released.cpu += (new - quota / period).max(0.0);
        }
        pod_ctx.has_been_actioned = true;
    }

    total_released.add(released);
    (err_keys, released)
}

fn ext_cpu_override(pod: &Pod) -> Option<f64> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(EXT_CPU_ANNOTATION))
        .and_then(|v| parse_quantity(v))
}

/* ============================= TESTS ============================= */
