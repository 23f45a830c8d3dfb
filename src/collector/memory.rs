use anyhow::Result;
use chrono::Utc;
use sysinfo::System;

use crate::series::{self, MetricSeries, TimeSeries};

use super::Collector;

pub const COLLECTOR_NAME: &str = "memory";

/// Reports used bytes and used percent of node memory.
pub struct MemoryCollector {
    sys: System,
    read_memory: Option<fn() -> (u64, u64)>,
}

impl MemoryCollector {
    pub fn new() -> Self {
        Self {
            sys: System::new(),
            read_memory: None,
        }
    }

    fn usage(&mut self) -> (u64, u64) {
        if let Some(read) = self.read_memory {
            return read();
        }
        self.sys.refresh_memory();
        (self.sys.used_memory(), self.sys.total_memory())
    }
}

impl Default for MemoryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for MemoryCollector {
    fn name(&self) -> &'static str {
        COLLECTOR_NAME
    }

    fn collect(&mut self) -> Result<MetricSeries> {
        let now = Utc::now().timestamp();
        let (used, total) = self.usage();
        let utilization = if total == 0 {
            0.0
        } else {
            used as f64 / total as f64 * 100.0
        };

        let mut out = MetricSeries::new();
        out.insert(
            series::MEMORY_TOTAL_USAGE.to_string(),
            vec![TimeSeries::scalar(used as f64, now)],
        );
        out.insert(
            series::MEMORY_TOTAL_UTILIZATION.to_string(),
            vec![TimeSeries::scalar(utilization, now)],
        );
        Ok(out)
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_reports_usage_and_utilization() {
        let mut collector = MemoryCollector {
            sys: System::new(),
            read_memory: Some(|| (4 * 1024 * 1024 * 1024, 16 * 1024 * 1024 * 1024)),
        };
        let out = collector.collect().expect("collect");
        assert_eq!(
            out[series::MEMORY_TOTAL_USAGE][0].latest(),
            Some(4.0 * 1024.0 * 1024.0 * 1024.0)
        );
        assert_eq!(out[series::MEMORY_TOTAL_UTILIZATION][0].latest(), Some(25.0));
    }

    #[test]
    fn test_zero_total_does_not_divide() {
        let mut collector = MemoryCollector {
            sys: System::new(),
            read_memory: Some(|| (0, 0)),
        };
        let out = collector.collect().expect("collect");
        assert_eq!(out[series::MEMORY_TOTAL_UTILIZATION][0].latest(), Some(0.0));
    }
}
