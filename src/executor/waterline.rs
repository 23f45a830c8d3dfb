use std::collections::BTreeMap;

use tracing::warn;

use crate::series::{self, MetricSeries, max_latest};

use super::podinfo::PodContext;

/// Sentinel gap for a qualified metric whose usage is missing from the
/// snapshot: the executors cannot act precisely and fall back to acting on
/// every pod in the pool.
pub const MISSED_CURRENT_USAGE: f64 = f64::INFINITY;

/* ============================= WATER-LINE ============================= */

/// Thresholds of every currently active objective for one metric. Rebuilt
/// from scratch each tick; the smallest entry is the active strictness.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaterLine(Vec<f64>);

impl WaterLine {
    pub fn push(&mut self, value: f64) {
        self.0.push(value);
    }

    pub fn smallest(&self) -> Option<f64> {
        self.0.iter().copied().min_by(f64::total_cmp)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Metric name to its water-line.
pub type WaterLines = BTreeMap<String, WaterLine>;

/// Push a threshold onto the named metric's water-line.
pub fn push_waterline(lines: &mut WaterLines, metric: &str, value: f64) {
    lines.entry(metric.to_string()).or_default().push(value);
}

/* ============================= METRIC REGISTRY ============================= */

type SortFn = fn(&mut [PodContext]);

/// Capabilities of one metric on the action side.
#[derive(Debug, Clone, Copy)]
pub struct MetricInfo {
    pub name: &'static str,
    /// A pod comparator exists for this metric.
    pub sort: Option<SortFn>,
    pub throttleable: bool,
    /// Numeric node usage exists so throttling can be driven by a gap.
    pub throttle_qualified: bool,
    pub evictable: bool,
    pub evict_qualified: bool,
}

/// Explicit metric capability table, built once at bootstrap and passed into
/// the executors. Trigger direction is uniform: a rule fires when the
/// measured value exceeds its target.
#[derive(Debug, Clone, Default)]
pub struct MetricRegistry {
    metrics: BTreeMap<&'static str, MetricInfo>,
}

impl MetricRegistry {
    pub fn bootstrap() -> Self {
        let mut registry = Self::default();
        registry.register(MetricInfo {
            name: series::CPU_TOTAL_USAGE,
            sort: Some(super::podinfo::cpu_sorter),
            throttleable: true,
            throttle_qualified: true,
            evictable: true,
            evict_qualified: true,
        });
        registry.register(MetricInfo {
            name: series::MEMORY_TOTAL_USAGE,
            sort: Some(super::podinfo::memory_sorter),
            throttleable: false,
            throttle_qualified: false,
            evictable: true,
            evict_qualified: true,
        });
        registry
    }

    fn register(&mut self, info: MetricInfo) {
        self.metrics.insert(info.name, info);
    }

    pub fn get(&self, name: &str) -> Option<&MetricInfo> {
        self.metrics.get(name)
    }

    /// Metrics with numeric node usage, memory first so the incompressible
    /// resource is handled before cpu.
    pub fn qualified_metrics(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .metrics
            .values()
            .filter(|m| m.throttle_qualified || m.evict_qualified)
            .map(|m| m.name)
            .collect();
        names.sort_by_key(|n| if *n == series::MEMORY_TOTAL_USAGE { 0 } else { 1 });
        names
    }

    /// Whether a water-line references a metric the registry cannot qualify
    /// for the given action; such plans fall back to acting on every pod.
    pub fn has_unqualified(&self, lines: &WaterLines, for_evict: bool) -> bool {
        lines.keys().any(|metric| {
            self.get(metric).is_none_or(|m| {
                if for_evict {
                    !m.evict_qualified
                } else {
                    !m.throttle_qualified
                }
            })
        })
    }
}

/* ============================= GAP MAP ============================= */

/// Signed distance from current usage to the strictest active water-line,
/// per metric. Driving a gap to zero is the executors' stop condition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GapToWaterLines(BTreeMap<String, f64>);

impl GapToWaterLines {
    pub fn get(&self, metric: &str) -> Option<f64> {
        self.0.get(metric).copied()
    }

    pub fn subtract(&mut self, metric: &str, released: f64) {
        if let Some(gap) = self.0.get_mut(metric) {
            *gap -= released;
        }
    }

    /// The metric's gap is closed (or the metric is absent entirely).
    pub fn target_gaps_removed(&self, metric: &str) -> bool {
        match self.0.get(metric) {
            None => true,
            Some(gap) => *gap <= 0.0,
        }
    }

    pub fn gaps_all_removed(&self) -> bool {
        self.0.values().all(|gap| *gap <= 0.0)
    }

    pub fn has_usage_missed_metric(&self) -> bool {
        self.0.values().any(|gap| *gap == MISSED_CURRENT_USAGE)
    }

    #[cfg(test)]
    pub fn insert(&mut self, metric: &str, gap: f64) {
        self.0.insert(metric.to_string(), gap);
    }
}

/// Compute the three gap maps from the snapshot and the plan's water-lines.
///
/// Only registry-qualified metrics produce gaps. A qualified metric missing
/// from the snapshot poisons all three maps with the missed-usage sentinel.
/// Throttle-up gaps run in the opposite direction: usage has to climb back
/// toward the threshold.
pub fn build_gap_to_waterlines(
    snapshot: Option<&MetricSeries>,
    registry: &MetricRegistry,
    throttle_down: &WaterLines,
    throttle_up: &WaterLines,
    evict: &WaterLines,
) -> (GapToWaterLines, GapToWaterLines, GapToWaterLines) {
    let mut down_gaps = GapToWaterLines::default();
    let mut up_gaps = GapToWaterLines::default();
    let mut evict_gaps = GapToWaterLines::default();

    for metric in registry.qualified_metrics() {
        let usage = snapshot
            .and_then(|s| s.get(metric))
            .and_then(|all| max_latest(all));

        let Some(usage) = usage else {
            warn!(metric, "usage_missing_from_snapshot");
            down_gaps.0.insert(metric.to_string(), MISSED_CURRENT_USAGE);
            up_gaps.0.insert(metric.to_string(), MISSED_CURRENT_USAGE);
            evict_gaps.0.insert(metric.to_string(), MISSED_CURRENT_USAGE);
            continue;
        };

        if let Some(line) = throttle_down.get(metric)
            && let Some(smallest) = line.smallest()
        {
            down_gaps.0.insert(metric.to_string(), usage - smallest);
        }
        if let Some(line) = throttle_up.get(metric)
            && let Some(smallest) = line.smallest()
        {
            up_gaps.0.insert(metric.to_string(), smallest - usage);
        }
        if let Some(line) = evict.get(metric)
            && let Some(smallest) = line.smallest()
        {
            evict_gaps.0.insert(metric.to_string(), usage - smallest);
        }
    }

    (down_gaps, up_gaps, evict_gaps)
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::TimeSeries;

    fn snapshot_with(metric: &str, value: f64) -> MetricSeries {
        let mut snapshot = MetricSeries::new();
        snapshot.insert(metric.to_string(), vec![TimeSeries::scalar(value, 0)]);
        snapshot
    }

    #[test]
    fn test_waterline_smallest() {
        let mut line = WaterLine::default();
        assert_eq!(line.smallest(), None);
        line.push(8.0);
        line.push(4.0);
        line.push(6.0);
        assert_eq!(line.smallest(), Some(4.0));
        assert_eq!(line.len(), 3);
    }

    #[test]
    fn test_registry_bootstrap_capabilities() {
        let registry = MetricRegistry::bootstrap();
        let cpu = registry.get(series::CPU_TOTAL_USAGE).expect("cpu registered");
        assert!(cpu.throttleable && cpu.evictable);
        assert!(cpu.sort.is_some());

        let mem = registry
            .get(series::MEMORY_TOTAL_USAGE)
            .expect("memory registered");
        assert!(!mem.throttleable);
        assert!(mem.evictable && mem.evict_qualified);

        assert!(registry.get("cpu_load_1_min").is_none());
    }

    #[test]
    fn test_qualified_metrics_memory_first() {
        let registry = MetricRegistry::bootstrap();
        assert_eq!(
            registry.qualified_metrics(),
            vec![series::MEMORY_TOTAL_USAGE, series::CPU_TOTAL_USAGE]
        );
    }

    #[test]
    fn test_has_unqualified_detects_unknown_metric() {
        let registry = MetricRegistry::bootstrap();
        let mut lines = WaterLines::new();
        push_waterline(&mut lines, series::CPU_TOTAL_USAGE, 6.0);
        assert!(!registry.has_unqualified(&lines, false));

        push_waterline(&mut lines, series::CPU_LOAD_1_MIN, 8.0);
        assert!(registry.has_unqualified(&lines, false));
    }

    #[test]
    fn test_memory_is_unqualified_for_throttle_but_not_evict() {
        let registry = MetricRegistry::bootstrap();
        let mut lines = WaterLines::new();
        push_waterline(&mut lines, series::MEMORY_TOTAL_USAGE, 8.0e9);
        assert!(registry.has_unqualified(&lines, false));
        assert!(!registry.has_unqualified(&lines, true));
    }

    #[test]
    fn test_gap_computed_against_smallest_waterline() {
        let registry = MetricRegistry::bootstrap();
        let snapshot = snapshot_with(series::CPU_TOTAL_USAGE, 4.0);

        let mut down = WaterLines::new();
        push_waterline(&mut down, series::CPU_TOTAL_USAGE, 3.6);
        push_waterline(&mut down, series::CPU_TOTAL_USAGE, 5.0);

        let (down_gaps, up_gaps, evict_gaps) = build_gap_to_waterlines(
            Some(&snapshot),
            &registry,
            &down,
            &WaterLines::new(),
            &WaterLines::new(),
        );

        let gap = down_gaps.get(series::CPU_TOTAL_USAGE).expect("gap present");
        assert!((gap - 0.4).abs() < 1e-9);
        assert_eq!(up_gaps.get(series::CPU_TOTAL_USAGE), None);
        assert_eq!(evict_gaps.get(series::CPU_TOTAL_USAGE), None);
    }

    #[test]
    fn test_throttle_up_gap_is_reversed() {
        let registry = MetricRegistry::bootstrap();
        let snapshot = snapshot_with(series::CPU_TOTAL_USAGE, 2.0);

        let mut up = WaterLines::new();
        push_waterline(&mut up, series::CPU_TOTAL_USAGE, 5.0);

        let (_, up_gaps, _) = build_gap_to_waterlines(
            Some(&snapshot),
            &registry,
            &WaterLines::new(),
            &up,
            &WaterLines::new(),
        );
        assert_eq!(up_gaps.get(series::CPU_TOTAL_USAGE), Some(3.0));
    }

    #[test]
    fn test_missing_usage_poisons_all_maps() {
        let registry = MetricRegistry::bootstrap();
        // Snapshot has cpu but no memory series at all.
        let snapshot = snapshot_with(series::CPU_TOTAL_USAGE, 2.0);

        let mut evict = WaterLines::new();
        push_waterline(&mut evict, series::MEMORY_TOTAL_USAGE, 8.0e9);

        let (down_gaps, _, evict_gaps) = build_gap_to_waterlines(
            Some(&snapshot),
            &registry,
            &WaterLines::new(),
            &WaterLines::new(),
            &evict,
        );
        assert!(evict_gaps.has_usage_missed_metric());
        assert!(down_gaps.has_usage_missed_metric());
        assert_eq!(
            evict_gaps.get(series::MEMORY_TOTAL_USAGE),
            Some(MISSED_CURRENT_USAGE)
        );
    }

    #[test]
    fn test_target_gaps_removed() {
        let mut gaps = GapToWaterLines::default();
        assert!(gaps.target_gaps_removed(series::CPU_TOTAL_USAGE));

        gaps.insert(series::CPU_TOTAL_USAGE, 0.4);
        assert!(!gaps.target_gaps_removed(series::CPU_TOTAL_USAGE));

        gaps.subtract(series::CPU_TOTAL_USAGE, 0.5);
        assert!(gaps.target_gaps_removed(series::CPU_TOTAL_USAGE));
        assert!(gaps.gaps_all_removed());
    }

    #[test]
    fn test_empty_series_counts_as_missing() {
        let registry = MetricRegistry::bootstrap();
        let mut snapshot = MetricSeries::new();
        snapshot.insert(series::CPU_TOTAL_USAGE.to_string(), vec![]);

        let (down_gaps, _, _) = build_gap_to_waterlines(
            Some(&snapshot),
            &registry,
            &WaterLines::new(),
            &WaterLines::new(),
            &WaterLines::new(),
        );
        assert_eq!(
            down_gaps.get(series::CPU_TOTAL_USAGE),
            Some(MISSED_CURRENT_USAGE)
        );
    }
}
