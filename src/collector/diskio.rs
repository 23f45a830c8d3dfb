use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::series::{self, Label, MetricSeries, TimeSeries};

use super::Collector;

pub const COLLECTOR_NAME: &str = "diskio";

const SECTOR_SIZE: f64 = 512.0;

/* ============================= /proc/diskstats ============================= */

/// Raw per-device counters from /proc/diskstats.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiskCounters {
    pub reads_completed: u64,
    pub sectors_read: u64,
    pub writes_completed: u64,
    pub sectors_written: u64,
    pub io_time_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct DiskState {
    counters: DiskCounters,
    timestamp: i64,
}

/// Parse /proc/diskstats, keeping only the named devices.
pub fn parse_diskstats(content: &str, devices: &[String]) -> HashMap<String, DiskCounters> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 13 {
            continue;
        }
        let name = fields[2];
        if !devices.iter().any(|d| d == name) {
            continue;
        }
        let parse = |i: usize| fields[i].parse::<u64>().unwrap_or(0);
        out.insert(
            name.to_string(),
            DiskCounters {
                reads_completed: parse(3),
                sectors_read: parse(5),
                writes_completed: parse(7),
                sectors_written: parse(9),
                io_time_ms: parse(12),
            },
        );
    }
    out
}

/// Per-device rates between two readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskIoUsage {
    pub read_kibps: f64,
    pub write_kibps: f64,
    pub read_iops: f64,
    pub write_iops: f64,
    pub utilization: f64,
}

pub fn calculate_disk_io(prev: DiskCounters, cur: DiskCounters, seconds: f64) -> DiskIoUsage {
    DiskIoUsage {
        read_kibps: cur.sectors_read.saturating_sub(prev.sectors_read) as f64 * SECTOR_SIZE
            / 1024.0
            / seconds,
        write_kibps: cur.sectors_written.saturating_sub(prev.sectors_written) as f64 * SECTOR_SIZE
            / 1024.0
            / seconds,
        read_iops: cur.reads_completed.saturating_sub(prev.reads_completed) as f64 / seconds,
        write_iops: cur.writes_completed.saturating_sub(prev.writes_completed) as f64 / seconds,
        utilization: cur.io_time_ms.saturating_sub(prev.io_time_ms) as f64 / 1000.0 / seconds
            * 100.0,
    }
}

/* ============================= COLLECTOR ============================= */

/// Reports per-device throughput, IOPS and utilization for every device
/// under /sys/block. First tick per device only primes state.
pub struct DiskIoCollector {
    proc_root: PathBuf,
    sys_block: PathBuf,
    states: HashMap<String, DiskState>,
}

impl DiskIoCollector {
    pub fn new() -> Self {
        Self::with_roots(PathBuf::from("/proc"), PathBuf::from("/sys/block"))
    }

    pub fn with_roots(proc_root: PathBuf, sys_block: PathBuf) -> Self {
        Self {
            proc_root,
            sys_block,
            states: HashMap::new(),
        }
    }

    fn block_devices(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.sys_block)
            .with_context(|| format!("reading {}", self.sys_block.display()))?;
        let mut devices = Vec::new();
        for entry in entries.flatten() {
            devices.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(devices)
    }
}

impl Default for DiskIoCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for DiskIoCollector {
    fn name(&self) -> &'static str {
        COLLECTOR_NAME
    }

    fn collect(&mut self) -> Result<MetricSeries> {
        let now = Utc::now().timestamp();
        let devices = self.block_devices()?;

        let path = self.proc_root.join("diskstats");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let counters = parse_diskstats(&content, &devices);

        let mut read_kibps = Vec::new();
        let mut write_kibps = Vec::new();
        let mut read_iops = Vec::new();
        let mut write_iops = Vec::new();
        let mut utilization = Vec::new();

        let mut next_states = HashMap::new();
        for (device, current) in counters {
            let state = DiskState {
                counters: current,
                timestamp: now,
            };
            if let Some(prev) = self.states.get(&device) {
                let seconds = (now - prev.timestamp).max(1) as f64;
                let usage = calculate_disk_io(prev.counters, current, seconds);
                let labels = vec![Label::new("diskName", &device)];
                read_kibps.push(TimeSeries::labelled(labels.clone(), usage.read_kibps, now));
                write_kibps.push(TimeSeries::labelled(labels.clone(), usage.write_kibps, now));
                read_iops.push(TimeSeries::labelled(labels.clone(), usage.read_iops, now));
                write_iops.push(TimeSeries::labelled(labels.clone(), usage.write_iops, now));
                utilization.push(TimeSeries::labelled(labels, usage.utilization, now));
            }
            next_states.insert(device, state);
        }
        self.states = next_states;

        let mut out = MetricSeries::new();
        out.insert(series::DISK_READ_KIBPS.to_string(), read_kibps);
        out.insert(series::DISK_WRITE_KIBPS.to_string(), write_kibps);
        out.insert(series::DISK_READ_IOPS.to_string(), read_iops);
        out.insert(series::DISK_WRITE_IOPS.to_string(), write_iops);
        out.insert(series::DISK_UTILIZATION.to_string(), utilization);
        Ok(out)
    }
}

/* ============================= TESTS ============================= */
