use anyhow::Result;
use kube::api::{Api, DeleteParams, EvictParams};
use tracing::{info, warn};

use crate::series;

use super::podinfo::{PodContext, PodKey, first_unactioned, general_sorter};
use super::waterline::{WaterLines, build_gap_to_waterlines};
use super::{ExecuteContext, ReleaseResource};

/* ============================= EVICTOR ============================= */

/// Pod eviction boundary; tests inject a recording fake.
#[allow(async_fn_in_trait)]
pub trait PodEvictor: Send + Sync {
    async fn evict(&self, key: &PodKey, grace_period_seconds: i64) -> Result<()>;
}

/// Real implementation through the pod eviction subresource.
pub struct KubeEvictor {
    client: kube::Client,
}

impl KubeEvictor {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

impl PodEvictor for KubeEvictor {
    async fn evict(&self, key: &PodKey, grace_period_seconds: i64) -> Result<()> {
        let pods: Api<k8s_openapi::api::core::v1::Pod> =
            Api::namespaced(self.client.clone(), &key.namespace);
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: Some(grace_period_seconds as u32),
                ..Default::default()
            }),
            ..Default::default()
        };
        pods.evict(&key.name, &params).await?;
        Ok(())
    }
}

/* ============================= EXECUTOR ============================= */

/// Eviction pool and the water-lines of the objectives that selected it.
#[derive(Debug, Clone, Default)]
pub struct EvictExecutor {
    pub evict_pods: Vec<PodContext>,
    pub evict_waterline: WaterLines,
}

impl EvictExecutor {
    /// Evict victims until measured usage fits under the strictest active
    /// water-line, memory before cpu. When usage cannot be measured, every
    /// pod in the pool is evicted. Failed evictions are collected and the
    /// loop continues.
    pub async fn avoid<E: PodEvictor>(
        &mut self,
        ctx: &ExecuteContext,
        evictor: &E,
    ) -> Result<()> {
        if self.evict_pods.is_empty() {
            return Ok(());
        }
        info!(pods = self.evict_pods.len(), "evict_avoid");

        let mut err_keys: Vec<String> = Vec::new();
        let mut total_released = ReleaseResource::default();

        let precise = !ctx.registry.has_unqualified(&self.evict_waterline, true);

        if precise {
            let (_, _, mut evict_gaps) = build_gap_to_waterlines(
                ctx.snapshot.as_deref(),
                &ctx.registry,
                &WaterLines::new(),
                &WaterLines::new(),
                &self.evict_waterline,
            );

            if evict_gaps.has_usage_missed_metric() {
                self.evict_all(evictor, &mut err_keys, &mut total_released).await;
            } else {
                for metric in ctx.registry.qualified_metrics() {
                    let evictable = ctx.registry.get(metric).is_some_and(|m| m.evictable);
                    if !evictable {
                        continue;
                    }

                    match ctx.registry.get(metric).and_then(|m| m.sort) {
                        Some(sort) => sort(&mut self.evict_pods),
                        None => general_sorter(&mut self.evict_pods),
                    }

                    while !evict_gaps.target_gaps_removed(metric) {
                        let Some(index) = first_unactioned(&self.evict_pods) else {
                            break;
                        };
                        let released =
                            evict_one_pod(evictor, &mut self.evict_pods[index], &mut err_keys)
                                .await;
                        total_released.add(released);
                        evict_gaps.subtract(series::MEMORY_TOTAL_USAGE, released.memory);
                        evict_gaps.subtract(series::CPU_TOTAL_USAGE, released.cpu);
                    }
                }
            }
        } else {
            self.evict_all(evictor, &mut err_keys, &mut total_released).await;
        }

        if err_keys.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("some pod evict failed: {}", err_keys.join("; "))
        }
    }

    async fn evict_all<E: PodEvictor>(
        &mut self,
        evictor: &E,
        err_keys: &mut Vec<String>,
        total_released: &mut ReleaseResource,
    ) {
        for index in 0..self.evict_pods.len() {
            let released = evict_one_pod(evictor, &mut self.evict_pods[index], err_keys).await;
            total_released.add(released);
        }
    }
}

async fn evict_one_pod<E: PodEvictor>(
    evictor: &E,
    pod: &mut PodContext,
    err_keys: &mut Vec<String>,
) -> ReleaseResource {
    pod.has_been_actioned = true;

    match evictor.evict(&pod.key, pod.deletion_grace_period_seconds).await {
        Ok(()) => {
            info!(pod = %pod.key, grace = pod.deletion_grace_period_seconds, "pod_evicted");
            ReleaseResource {
                cpu: pod.pod_cpu_usage,
                memory: pod.pod_memory_usage,
            }
        }
        Err(e) => {
            warn!(pod = %pod.key, error = %e, "pod_evict_failed");
            err_keys.push(format!("evict {} failed: {e}", pod.key));
            ReleaseResource::default()
        }
    }
}

/* ============================= TESTS ============================= */
