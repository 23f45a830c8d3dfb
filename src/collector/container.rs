use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use crate::series::{self, Label, MetricSeries, TimeSeries};

use super::{Collector, PodLister};

pub const COLLECTOR_NAME: &str = "container";

const CGROUP_KUBEPODS: &str = "kubepods";
const CGROUP_POD_PREFIX: &str = "pod";

/* ============================= CGROUP PATHS ============================= */

/// Pod identity needed to locate its cgroup subtree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CgroupRef {
    pub pod_name: String,
    pub pod_namespace: String,
    pub pod_uid: String,
    pub qos_class: String,
}

impl CgroupRef {
    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            pod_name: pod.metadata.name.clone().unwrap_or_default(),
            pod_namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            pod_uid: pod.metadata.uid.clone().unwrap_or_default(),
            qos_class: pod
                .status
                .as_ref()
                .and_then(|s| s.qos_class.clone())
                .unwrap_or_default(),
        }
    }

    /// Relative cgroup path: kubepods[/burstable|/besteffort]/pod<uid>.
    pub fn cgroup_path(&self) -> Option<PathBuf> {
        let mut path = PathBuf::from(CGROUP_KUBEPODS);
        match self.qos_class.as_str() {
            "Guaranteed" => {}
            "Burstable" => path.push("burstable"),
            "BestEffort" => path.push("besteffort"),
            _ => return None,
        }
        path.push(format!("{CGROUP_POD_PREFIX}{}", self.pod_uid));
        Some(path)
    }

    fn labels(&self, container_name: &str, container_id: &str) -> Vec<Label> {
        vec![
            Label::new(series::LABEL_POD_NAME, &self.pod_name),
            Label::new(series::LABEL_POD_NAMESPACE, &self.pod_namespace),
            Label::new(series::LABEL_POD_UID, &self.pod_uid),
            Label::new(series::LABEL_CONTAINER_NAME, container_name),
            Label::new(series::LABEL_CONTAINER_ID, container_id),
        ]
    }
}

/// Resolve a container id (cgroup directory name) to the container name via
/// the pod's container statuses. Status ids look like
/// "containerd://<id>"; only the trailing id is compared.
pub fn container_name_from_pod(pod: &Pod, container_id: &str) -> String {
    if container_id.is_empty() {
        return String::new();
    }
    let Some(statuses) = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
    else {
        return String::new();
    };
    for status in statuses {
        if let Some(id) = &status.container_id
            && id.rsplit("//").next() == Some(container_id)
        {
            return status.name.clone();
        }
    }
    String::new()
}

/* ============================= CGROUP FILES ============================= */

/// usage_usec out of cgroup v2 cpu.stat.
pub fn parse_cpu_stat_usage(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|l| l.strip_prefix("usage_usec "))
        .and_then(|v| v.trim().parse().ok())
}

/// (quota_usec, period_usec) out of cgroup v2 cpu.max; quota is -1 when "max".
pub fn parse_cpu_max(content: &str) -> Option<(i64, i64)> {
    let mut fields = content.split_whitespace();
    let quota = fields.next()?;
    let period: i64 = fields.next().unwrap_or("100000").parse().ok()?;
    let quota: i64 = if quota == "max" { -1 } else { quota.parse().ok()? };
    Some((quota, period))
}

/// "some total" microseconds out of cgroup v2 cpu.pressure.
pub fn parse_cpu_pressure_some_total(content: &str) -> Option<u64> {
    let line = content.lines().find(|l| l.starts_with("some"))?;
    line.split_whitespace()
        .find_map(|f| f.strip_prefix("total="))
        .and_then(|v| v.parse().ok())
}

/// Bytes out of cgroup v2 memory.current.
pub fn parse_memory_current(content: &str) -> Option<u64> {
    content.trim().parse().ok()
}

#[derive(Debug, Clone, Copy)]
struct CgroupState {
    usage_usec: u64,
    pressure_total_usec: u64,
    at_usec: i64,
}

/* ============================= COLLECTOR ============================= */

/// Per-container CPU accounting from the cgroup v2 hierarchy.
///
/// For each running pod the collector reads the pod cgroup and every child
/// container cgroup: CPU usage as delta usage over wall time (cores),
/// runqueue pressure as milliseconds waited per second (PSI some total),
/// plus the current quota/period from cpu.max.
pub struct ContainerCollector {
    cgroup_root: PathBuf,
    pod_lister: PodLister,
    states: HashMap<String, CgroupState>,
}

impl ContainerCollector {
    pub fn new(cgroup_root: PathBuf, pod_lister: PodLister) -> Self {
        Self {
            cgroup_root,
            pod_lister,
            states: HashMap::new(),
        }
    }

    fn read_cgroup(&self, dir: &Path, now_usec: i64) -> Option<(CgroupState, i64, i64, f64)> {
        let usage = parse_cpu_stat_usage(&fs::read_to_string(dir.join("cpu.stat")).ok()?)?;
        let pressure = fs::read_to_string(dir.join("cpu.pressure"))
            .ok()
            .and_then(|c| parse_cpu_pressure_some_total(&c))
            .unwrap_or(0);
        let (quota, period) = fs::read_to_string(dir.join("cpu.max"))
            .ok()
            .and_then(|c| parse_cpu_max(&c))
            .unwrap_or((-1, 100_000));
        let memory = fs::read_to_string(dir.join("memory.current"))
            .ok()
            .and_then(|c| parse_memory_current(&c))
            .unwrap_or(0);
        Some((
            CgroupState {
                usage_usec: usage,
                pressure_total_usec: pressure,
                at_usec: now_usec,
            },
            quota,
            period,
            memory as f64,
        ))
    }
}

impl Collector for ContainerCollector {
    fn name(&self) -> &'static str {
        COLLECTOR_NAME
    }

    fn collect(&mut self) -> Result<MetricSeries> {
        let now = Utc::now();
        let now_sec = now.timestamp();
        let now_usec = now.timestamp_micros();

        let mut cpu_usage = Vec::new();
        let mut runqueue = Vec::new();
        let mut cpu_limit = Vec::new();
        let mut cpu_quota = Vec::new();
        let mut cpu_period = Vec::new();
        let mut mem_usage = Vec::new();

        let mut next_states = HashMap::new();

        for pod in (self.pod_lister)() {
            let running = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                == Some("Running");
            if !running {
                continue;
            }

            let cgroup_ref = CgroupRef::from_pod(&pod);
            let Some(rel) = cgroup_ref.cgroup_path() else {
                continue;
            };
            let pod_dir = self.cgroup_root.join(&rel);
            if !pod_dir.is_dir() {
                debug!(pod = %cgroup_ref.pod_name, path = %pod_dir.display(), "pod_cgroup_missing");
                continue;
            }

            // The pod cgroup itself plus each child container cgroup.
            let mut dirs: Vec<(String, PathBuf)> = vec![(String::new(), pod_dir.clone())];
            if let Ok(entries) = fs::read_dir(&pod_dir) {
                for entry in entries.flatten() {
                    if entry.path().is_dir() {
                        dirs.push((
                            entry.file_name().to_string_lossy().into_owned(),
                            entry.path(),
                        ));
                    }
                }
            }

            for (container_id, dir) in dirs {
                let key = dir.to_string_lossy().into_owned();
                let Some((state, quota, period, memory)) = self.read_cgroup(&dir, now_usec)
                else {
                    continue;
                };

                if let Some(prev) = self.states.get(&key) {
                    let wall_usec = (state.at_usec - prev.at_usec).max(1) as f64;
                    let usage_delta =
                        state.usage_usec.saturating_sub(prev.usage_usec) as f64;
                    let pressure_delta =
                        state.pressure_total_usec.saturating_sub(prev.pressure_total_usec) as f64;

                    let usage_cores = usage_delta / wall_usec;
                    // us waited per us of wall time, scaled to ms per second.
                    let runqueue_ms = pressure_delta / wall_usec * 1000.0;
                    let limit_cores = if quota > 0 {
                        quota as f64 / period as f64
                    } else {
                        -1.0
                    };

                    let container_name = container_name_from_pod(&pod, &container_id);
                    let labels = cgroup_ref.labels(&container_name, &container_id);

                    cpu_usage.push(TimeSeries::labelled(labels.clone(), usage_cores, now_sec));
                    runqueue.push(TimeSeries::labelled(labels.clone(), runqueue_ms, now_sec));
                    cpu_limit.push(TimeSeries::labelled(labels.clone(), limit_cores, now_sec));
                    cpu_quota.push(TimeSeries::labelled(labels.clone(), quota as f64, now_sec));
                    cpu_period.push(TimeSeries::labelled(labels.clone(), period as f64, now_sec));
                    mem_usage.push(TimeSeries::labelled(labels, memory, now_sec));
                }

                next_states.insert(key, state);
            }
        }

        self.states = next_states;

        let mut out = MetricSeries::new();
        out.insert(series::CONTAINER_CPU_TOTAL_USAGE.to_string(), cpu_usage);
        out.insert(series::CONTAINER_SCHED_RUN_QUEUE_TIME.to_string(), runqueue);
        out.insert(series::CONTAINER_CPU_LIMIT.to_string(), cpu_limit);
        out.insert(series::CONTAINER_CPU_QUOTA.to_string(), cpu_quota);
        out.insert(series::CONTAINER_CPU_PERIOD.to_string(), cpu_period);
        out.insert(series::CONTAINER_MEM_TOTAL_USAGE.to_string(), mem_usage);
        Ok(out)
    }

    fn stop(&mut self) {
        self.states.clear();
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Arc;

    fn make_pod(uid: &str, qos: &str, container_id: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("default".to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                qos_class: Some(qos.to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "app".to_string(),
                    container_id: Some(format!("containerd://{container_id}")),
                    restart_count: 0,
                    ready: true,
                    image: "img:1.0".to_string(),
                    image_id: String::new(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    fn write_cgroup(dir: &Path, usage_usec: u64, pressure_usec: u64, cpu_max: &str) {
        std::fs::create_dir_all(dir).expect("mkdir cgroup");
        std::fs::write(
            dir.join("cpu.stat"),
            format!("usage_usec {usage_usec}\nuser_usec 0\nsystem_usec 0\n"),
        )
        .expect("write cpu.stat");
        std::fs::write(
            dir.join("cpu.pressure"),
            format!("some avg10=0.00 avg60=0.00 avg300=0.00 total={pressure_usec}\n"),
        )
        .expect("write cpu.pressure");
        std::fs::write(dir.join("cpu.max"), cpu_max).expect("write cpu.max");
    }

    #[test]
    fn test_cgroup_path_by_qos_class() {
        let mut r = CgroupRef {
            pod_uid: "abc".to_string(),
            qos_class: "Guaranteed".to_string(),
            ..Default::default()
        };
        assert_eq!(r.cgroup_path(), Some(PathBuf::from("kubepods/podabc")));

        r.qos_class = "Burstable".to_string();
        assert_eq!(
            r.cgroup_path(),
            Some(PathBuf::from("kubepods/burstable/podabc"))
        );

        r.qos_class = "BestEffort".to_string();
        assert_eq!(
            r.cgroup_path(),
            Some(PathBuf::from("kubepods/besteffort/podabc"))
        );

        r.qos_class = String::new();
        assert_eq!(r.cgroup_path(), None);
    }

    #[test]
    fn test_parse_cpu_stat_usage() {
        assert_eq!(
            parse_cpu_stat_usage("usage_usec 123456\nuser_usec 100\n"),
            Some(123456)
        );
        assert_eq!(parse_cpu_stat_usage("user_usec 100\n"), None);
    }

    #[test]
    fn test_parse_cpu_max() {
        assert_eq!(parse_cpu_max("max 100000\n"), Some((-1, 100_000)));
        assert_eq!(parse_cpu_max("200000 100000\n"), Some((200_000, 100_000)));
    }

    #[test]
    fn test_parse_cpu_pressure() {
        let content = "some avg10=1.00 avg60=0.50 avg300=0.10 total=987654\nfull avg10=0.00 avg60=0.00 avg300=0.00 total=123\n";
        assert_eq!(parse_cpu_pressure_some_total(content), Some(987654));
    }

    #[test]
    fn test_container_name_resolution() {
        let pod = make_pod("u1", "Burstable", "cid123");
        assert_eq!(container_name_from_pod(&pod, "cid123"), "app");
        assert_eq!(container_name_from_pod(&pod, "other"), "");
        assert_eq!(container_name_from_pod(&pod, ""), "");
    }

    #[test]
    fn test_collect_reports_container_series_on_second_tick() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        let pod_dir = root.join("kubepods/burstable/podu1");
        let container_dir = pod_dir.join("cid123");
        write_cgroup(&pod_dir, 0, 0, "max 100000\n");
        write_cgroup(&container_dir, 0, 0, "200000 100000\n");

        let pod = make_pod("u1", "Burstable", "cid123");
        let lister: PodLister = Arc::new(move || vec![pod.clone()]);
        let mut collector = ContainerCollector::new(root, lister);

        let first = collector.collect().expect("first collect");
        assert!(first[series::CONTAINER_CPU_TOTAL_USAGE].is_empty());

        write_cgroup(&pod_dir, 5_000_000, 100_000, "max 100000\n");
        write_cgroup(&container_dir, 5_000_000, 100_000, "200000 100000\n");
        let second = collector.collect().expect("second collect");

        let usage = &second[series::CONTAINER_CPU_TOTAL_USAGE];
        // Pod-level entry (empty container id) plus the container entry.
        assert_eq!(usage.len(), 2);
        let container_series = usage
            .iter()
            .find(|ts| ts.label(series::LABEL_CONTAINER_ID) == Some("cid123"))
            .expect("container series present");
        assert_eq!(
            container_series.label(series::LABEL_CONTAINER_NAME),
            Some("app")
        );
        assert_eq!(
            container_series.label(series::LABEL_POD_NAME),
            Some("web-0")
        );

        let quota_series = &second[series::CONTAINER_CPU_QUOTA];
        let container_quota = quota_series
            .iter()
            .find(|ts| ts.label(series::LABEL_CONTAINER_ID) == Some("cid123"))
            .expect("quota series present");
        assert_eq!(container_quota.latest(), Some(200_000.0));
    }

    #[test]
    fn test_non_running_pod_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut pod = make_pod("u1", "Burstable", "cid123");
        pod.status.as_mut().unwrap().phase = Some("Pending".to_string());

        let lister: PodLister = Arc::new(move || vec![pod.clone()]);
        let mut collector = ContainerCollector::new(dir.path().to_path_buf(), lister);
        let out = collector.collect().expect("collect");
        assert!(out[series::CONTAINER_CPU_TOTAL_USAGE].is_empty());
    }

    #[test]
    fn test_stop_clears_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pod_dir = dir.path().join("kubepods/burstable/podu1");
        write_cgroup(&pod_dir, 1000, 0, "max 100000\n");

        let pod = make_pod("u1", "Burstable", "cid123");
        let lister: PodLister = Arc::new(move || vec![pod.clone()]);
        let mut collector = ContainerCollector::new(dir.path().to_path_buf(), lister);
        collector.collect().expect("collect");
        assert!(!collector.states.is_empty());
        collector.stop();
        assert!(collector.states.is_empty());
    }
}
