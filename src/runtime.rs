use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::debug;

/* ============================= OPTIONS ============================= */

/// Container resource fields the runtime can rewrite; mirrors the CRI
/// LinuxContainerResources message. Zero means "leave unchanged" except for
/// `cpu_quota`, where -1 means unlimited.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOptions {
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub cpu_shares: i64,
    pub memory_limit_in_bytes: i64,
    pub oom_score_adj: i64,
    pub cpuset_cpus: String,
    pub cpuset_mems: String,
}

/* ============================= TRAIT ============================= */

/// Boundary to the container runtime. The production CRI gRPC client lives
/// behind this trait; tests inject a recording fake.
pub trait ContainerRuntime: Send + Sync {
    fn update_container_resources(&self, container_id: &str, opts: UpdateOptions) -> Result<()>;
}

/* ============================= CGROUP IMPLEMENTATION ============================= */

/// Applies CPU quota updates by writing the container's cgroup v2 `cpu.max`.
///
/// The container's cgroup directory is located by walking the kubepods
/// hierarchy for a directory named after the container id.
pub struct CgroupRuntime {
    cgroup_root: PathBuf,
}

impl CgroupRuntime {
    pub fn new(cgroup_root: PathBuf) -> Self {
        Self { cgroup_root }
    }

    fn find_container_dir(&self, container_id: &str) -> Option<PathBuf> {
        let kubepods = self.cgroup_root.join("kubepods");
        find_dir_named(&kubepods, container_id, 3)
    }
}

fn find_dir_named(root: &Path, name: &str, depth: usize) -> Option<PathBuf> {
    if depth == 0 {
        return None;
    }
    let entries = fs::read_dir(root).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy() == name {
            return Some(path);
        }
        if let Some(found) = find_dir_named(&path, name, depth - 1) {
            return Some(found);
        }
    }
    None
}

/// Render a cgroup v2 cpu.max line: "max <period>" for unlimited quota.
pub fn format_cpu_max(quota: i64, period: i64) -> String {
    if quota < 0 {
        format!("max {period}\n")
    } else {
        format!("{quota} {period}\n")
    }
}

impl ContainerRuntime for CgroupRuntime {
    fn update_container_resources(&self, container_id: &str, opts: UpdateOptions) -> Result<()> {
        if container_id.is_empty() {
            bail!("container id cannot be empty");
        }

        let dir = self
            .find_container_dir(container_id)
            .with_context(|| format!("container cgroup not found for {container_id}"))?;

        if opts.cpu_quota != 0 {
            let period = if opts.cpu_period > 0 {
                opts.cpu_period
            } else {
                100_000
            };
            let line = format_cpu_max(opts.cpu_quota, period);
            fs::write(dir.join("cpu.max"), &line)
                .with_context(|| format!("writing cpu.max for {container_id}"))?;
            debug!(container = container_id, cpu_max = line.trim(), "container_quota_updated");
        }

        if opts.memory_limit_in_bytes > 0 {
            fs::write(dir.join("memory.max"), format!("{}\n", opts.memory_limit_in_bytes))
                .with_context(|| format!("writing memory.max for {container_id}"))?;
        }

        Ok(())
    }
}

/* ============================= TEST FAKE ============================= */

/// Recording runtime used across the executor tests.
#[derive(Default)]
pub struct FakeRuntime {
    pub calls: std::sync::Mutex<Vec<(String, UpdateOptions)>>,
    pub fail_for: Option<String>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<(String, UpdateOptions)> {
        self.calls.lock().expect("fake runtime lock").clone()
    }
}

impl ContainerRuntime for FakeRuntime {
    fn update_container_resources(&self, container_id: &str, opts: UpdateOptions) -> Result<()> {
        if self.fail_for.as_deref() == Some(container_id) {
            bail!("runtime rpc failed for {container_id}");
        }
        self.calls
            .lock()
            .expect("fake runtime lock")
            .push((container_id.to_string(), opts));
        Ok(())
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_cpu_max() {
        assert_eq!(format_cpu_max(160_000, 100_000), "160000 100000\n");
        assert_eq!(format_cpu_max(-1, 100_000), "max 100000\n");
    }

    #[test]
    fn test_update_writes_cpu_max() {
        let dir = tempfile::tempdir().expect("tempdir");
        let container = dir
            .path()
            .join("kubepods/burstable/podu1/cid123");
        std::fs::create_dir_all(&container).expect("mkdir");

        let runtime = CgroupRuntime::new(dir.path().to_path_buf());
        runtime
            .update_container_resources(
                "cid123",
                UpdateOptions {
                    cpu_quota: 160_000,
                    cpu_period: 100_000,
                    ..Default::default()
                },
            )
            .expect("update should succeed");

        let written = std::fs::read_to_string(container.join("cpu.max")).expect("cpu.max");
        assert_eq!(written, "160000 100000\n");
    }

    #[test]
    fn test_update_unlimited_quota() {
        let dir = tempfile::tempdir().expect("tempdir");
        let container = dir.path().join("kubepods/podu2/cid9");
        std::fs::create_dir_all(&container).expect("mkdir");

        let runtime = CgroupRuntime::new(dir.path().to_path_buf());
        runtime
            .update_container_resources(
                "cid9",
                UpdateOptions {
                    cpu_quota: -1,
                    cpu_period: 100_000,
                    ..Default::default()
                },
            )
            .expect("update should succeed");

        let written = std::fs::read_to_string(container.join("cpu.max")).expect("cpu.max");
        assert_eq!(written, "max 100000\n");
    }

    #[test]
    fn test_unknown_container_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("kubepods")).expect("mkdir");
        let runtime = CgroupRuntime::new(dir.path().to_path_buf());
        let err = runtime
            .update_container_resources("missing", UpdateOptions::default())
            .expect_err("should fail");
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_empty_container_id_rejected() {
        let runtime = CgroupRuntime::new(PathBuf::from("/sys/fs/cgroup"));
        assert!(
            runtime
                .update_container_resources("", UpdateOptions::default())
                .is_err()
        );
    }

    #[test]
    fn test_fake_runtime_records_calls() {
        let fake = FakeRuntime::new();
        fake.update_container_resources(
            "cid1",
            UpdateOptions {
                cpu_quota: 100_000,
                ..Default::default()
            },
        )
        .expect("fake should record");
        let calls = fake.recorded();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "cid1");
        assert_eq!(calls[0].1.cpu_quota, 100_000);
    }
}
