use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use sysinfo::System;

use crate::series::{self, MetricSeries, TimeSeries};

use super::Collector;

pub const COLLECTOR_NAME: &str = "cpu";

/* ============================= /proc/stat ============================= */

/// Aggregate CPU jiffies from the first line of /proc/stat.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    fn busy(&self) -> u64 {
        self.user + self.nice + self.system + self.iowait + self.irq + self.softirq + self.steal
    }

    fn total(&self) -> u64 {
        self.busy() + self.idle
    }
}

/// Parse the aggregate "cpu " line of /proc/stat.
pub fn parse_proc_stat(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 8 {
        return None;
    }
    Some(CpuTimes {
        user: fields[0],
        nice: fields[1],
        system: fields[2],
        idle: fields[3],
        iowait: fields[4],
        irq: fields[5],
        softirq: fields[6],
        steal: fields[7],
    })
}

/// Busy fraction (0-100) between two readings.
pub fn calculate_busy(prev: CpuTimes, cur: CpuTimes) -> f64 {
    let (prev_total, prev_busy) = (prev.total(), prev.busy());
    let (cur_total, cur_busy) = (cur.total(), cur.busy());

    if cur_busy <= prev_busy {
        return 0.0;
    }
    if cur_total <= prev_total {
        return 100.0;
    }
    let pct = (cur_busy - prev_busy) as f64 / (cur_total - prev_total) as f64 * 100.0;
    pct.clamp(0.0, 100.0)
}

/* ============================= COLLECTOR ============================= */

/// Reports node CPU usage in cores and utilization in percent from
/// consecutive /proc/stat readings. The first tick only primes state.
pub struct CpuCollector {
    proc_root: PathBuf,
    prev: Option<CpuTimes>,
    core_count: f64,
}

impl CpuCollector {
    pub fn new() -> Self {
        Self::with_proc_root(PathBuf::from("/proc"))
    }

    pub fn with_proc_root(proc_root: PathBuf) -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        Self {
            proc_root,
            prev: None,
            core_count: sys.cpus().len().max(1) as f64,
        }
    }
}

impl Default for CpuCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for CpuCollector {
    fn name(&self) -> &'static str {
        COLLECTOR_NAME
    }

    fn collect(&mut self) -> Result<MetricSeries> {
        let path = self.proc_root.join("stat");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let current = parse_proc_stat(&content).context("malformed /proc/stat")?;

        let Some(prev) = self.prev.replace(current) else {
            // No previous reading yet.
            return Ok(MetricSeries::new());
        };

        let now = Utc::now().timestamp();
        let utilization = calculate_busy(prev, current);
        let usage_cores = utilization / 100.0 * self.core_count;

        let mut out = MetricSeries::new();
        out.insert(
            series::CPU_TOTAL_USAGE.to_string(),
            vec![TimeSeries::scalar(usage_cores, now)],
        );
        out.insert(
            series::CPU_TOTAL_UTILIZATION.to_string(),
            vec![TimeSeries::scalar(utilization, now)],
        );
        Ok(out)
    }
}

/* ============================= TESTS ============================= */
