use anyhow::Result;
use chrono::Utc;
use sysinfo::System;

use crate::series::{self, MetricSeries, TimeSeries};

use super::Collector;

pub const COLLECTOR_NAME: &str = "load";

/// Reports the 1/5/15-minute load averages.
pub struct LoadCollector {
    read_load: fn() -> (f64, f64, f64),
}

fn system_load() -> (f64, f64, f64) {
    let avg = System::load_average();
    (avg.one, avg.five, avg.fifteen)
}

impl LoadCollector {
    pub fn new() -> Self {
        Self {
            read_load: system_load,
        }
    }
}

impl Default for LoadCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for LoadCollector {
    fn name(&self) -> &'static str {
        COLLECTOR_NAME
    }

    fn collect(&mut self) -> Result<MetricSeries> {
        let now = Utc::now().timestamp();
        let (one, five, fifteen) = (self.read_load)();

        let mut out = MetricSeries::new();
        out.insert(
            series::CPU_LOAD_1_MIN.to_string(),
            vec![TimeSeries::scalar(one, now)],
        );
        out.insert(
            series::CPU_LOAD_5_MIN.to_string(),
            vec![TimeSeries::scalar(five, now)],
        );
        out.insert(
            series::CPU_LOAD_15_MIN.to_string(),
            vec![TimeSeries::scalar(fifteen, now)],
        );
        Ok(out)
    }
}

/* ============================= TESTS ============================= */
