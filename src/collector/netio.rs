use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::series::{self, Label, MetricSeries, TimeSeries};

use super::Collector;

pub const COLLECTOR_NAME: &str = "netio";

/* ============================= /proc/net/dev ============================= */

/// Raw per-interface counters from /proc/net/dev.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetCounters {
    pub bytes_recv: u64,
    pub packets_recv: u64,
    pub drop_in: u64,
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub drop_out: u64,
}

#[derive(Debug, Clone, Copy)]
struct NetState {
    counters: NetCounters,
    timestamp: i64,
}

/// Parse /proc/net/dev, keeping only the named interfaces.
pub fn parse_net_dev(content: &str, ifaces: &[String]) -> HashMap<String, NetCounters> {
    let mut out = HashMap::new();
    for line in content.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() || !ifaces.iter().any(|i| i == name) {
            continue;
        }
        let fields: Vec<u64> = rest
            .split_whitespace()
            .map(|f| f.parse().unwrap_or(0))
            .collect();
        if fields.len() < 12 {
            continue;
        }
        out.insert(
            name.to_string(),
            NetCounters {
                bytes_recv: fields[0],
                packets_recv: fields[1],
                drop_in: fields[3],
                bytes_sent: fields[8],
                packets_sent: fields[9],
                drop_out: fields[11],
            },
        );
    }
    out
}

/// Per-interface rates between two readings. Byte rates are kilobits/s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetIoUsage {
    pub receive_kibps: f64,
    pub sent_kibps: f64,
    pub receive_pckps: f64,
    pub sent_pckps: f64,
    pub drop_in: f64,
    pub drop_out: f64,
}

pub fn calculate_net_io(prev: NetCounters, cur: NetCounters, seconds: f64) -> NetIoUsage {
    NetIoUsage {
        receive_kibps: cur.bytes_recv.saturating_sub(prev.bytes_recv) as f64 * 8.0
            / 1000.0
            / seconds,
        sent_kibps: cur.bytes_sent.saturating_sub(prev.bytes_sent) as f64 * 8.0 / 1000.0 / seconds,
        receive_pckps: cur.packets_recv.saturating_sub(prev.packets_recv) as f64 / seconds,
        sent_pckps: cur.packets_sent.saturating_sub(prev.packets_sent) as f64 / seconds,
        drop_in: cur.drop_in.saturating_sub(prev.drop_in) as f64 / seconds,
        drop_out: cur.drop_out.saturating_sub(prev.drop_out) as f64 / seconds,
    }
}

/* ============================= COLLECTOR ============================= */

/// Reports throughput, packet and drop rates for the configured interfaces.
/// First tick per interface only primes state.
pub struct NetIoCollector {
    proc_root: PathBuf,
    ifaces: Vec<String>,
    states: HashMap<String, NetState>,
}

impl NetIoCollector {
    pub fn new(ifaces: Vec<String>) -> Self {
        Self::with_proc_root(PathBuf::from("/proc"), ifaces)
    }

    pub fn with_proc_root(proc_root: PathBuf, ifaces: Vec<String>) -> Self {
        Self {
            proc_root,
            ifaces,
            states: HashMap::new(),
        }
    }
}

impl Collector for NetIoCollector {
    fn name(&self) -> &'static str {
        COLLECTOR_NAME
    }

    fn collect(&mut self) -> Result<MetricSeries> {
        let now = Utc::now().timestamp();
        let path = self.proc_root.join("net/dev");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let counters = parse_net_dev(&content, &self.ifaces);

        let mut receive_kibps = Vec::new();
        let mut sent_kibps = Vec::new();
        let mut receive_pckps = Vec::new();
        let mut sent_pckps = Vec::new();
        let mut drop_in = Vec::new();
        let mut drop_out = Vec::new();

        let mut next_states = HashMap::new();
        for (iface, current) in counters {
            let state = NetState {
                counters: current,
                timestamp: now,
            };
            if let Some(prev) = self.states.get(&iface) {
                let seconds = (now - prev.timestamp).max(1) as f64;
                let usage = calculate_net_io(prev.counters, current, seconds);
                let labels = vec![Label::new("NetInterface", &iface)];
                receive_kibps.push(TimeSeries::labelled(labels.clone(), usage.receive_kibps, now));
                sent_kibps.push(TimeSeries::labelled(labels.clone(), usage.sent_kibps, now));
                receive_pckps.push(TimeSeries::labelled(labels.clone(), usage.receive_pckps, now));
                sent_pckps.push(TimeSeries::labelled(labels.clone(), usage.sent_pckps, now));
                drop_in.push(TimeSeries::labelled(labels.clone(), usage.drop_in, now));
                drop_out.push(TimeSeries::labelled(labels, usage.drop_out, now));
            }
            next_states.insert(iface, state);
        }
        self.states = next_states;

        let mut out = MetricSeries::new();
        out.insert(series::NETWORK_RECEIVE_KIBPS.to_string(), receive_kibps);
        out.insert(series::NETWORK_SENT_KIBPS.to_string(), sent_kibps);
        out.insert(series::NETWORK_RECEIVE_PCKPS.to_string(), receive_pckps);
        out.insert(series::NETWORK_SENT_PCKPS.to_string(), sent_pckps);
        out.insert(series::NETWORK_DROP_IN.to_string(), drop_in);
        out.insert(series::NETWORK_DROP_OUT.to_string(), drop_out);
        Ok(out)
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    const NET_DEV_T0: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
  eth0: 1000000    1000    0   10    0     0          0         0  2000000    2000    0   20    0    0    0          0
    lo:  500000     500    0    0    0     0          0         0   500000     500    0    0    0    0    0          0
";
    const NET_DEV_T1: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
  eth0: 2000000    2000    0   30    0     0          0         0  4000000    4000    0   40    0    0    0          0
";

    fn eth0() -> Vec<String> {
        vec!["eth0".to_string()]
    }

    #[test]
    fn test_parse_net_dev_filters_interfaces() {
        let counters = parse_net_dev(NET_DEV_T0, &eth0());
        assert_eq!(counters.len(), 1);
        let c = counters["eth0"];
        assert_eq!(c.bytes_recv, 1_000_000);
        assert_eq!(c.packets_recv, 1000);
        assert_eq!(c.drop_in, 10);
        assert_eq!(c.bytes_sent, 2_000_000);
        assert_eq!(c.packets_sent, 2000);
        assert_eq!(c.drop_out, 20);
    }

    #[test]
    fn test_calculate_net_io_rates() {
        let prev = parse_net_dev(NET_DEV_T0, &eth0())["eth0"];
        let cur = parse_net_dev(NET_DEV_T1, &eth0())["eth0"];
        let usage = calculate_net_io(prev, cur, 10.0);

        // 1 MB received over 10 s = 800 kilobits/s
        assert!((usage.receive_kibps - 800.0).abs() < 1e-9);
        assert!((usage.sent_kibps - 1600.0).abs() < 1e-9);
        assert!((usage.receive_pckps - 100.0).abs() < 1e-9);
        assert!((usage.sent_pckps - 200.0).abs() < 1e-9);
        assert!((usage.drop_in - 2.0).abs() < 1e-9);
        assert!((usage.drop_out - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_first_tick_yields_empty_series() {
        let dir = tempfile::tempdir().expect("tempdir");
        let net_dir = dir.path().join("net");
        std::fs::create_dir_all(&net_dir).expect("mkdir net");
        std::fs::write(net_dir.join("dev"), NET_DEV_T0).expect("write net/dev");

        let mut collector = NetIoCollector::with_proc_root(dir.path().to_path_buf(), eth0());
        let first = collector.collect().expect("first collect");
        assert!(first[series::NETWORK_RECEIVE_KIBPS].is_empty());

        std::fs::write(net_dir.join("dev"), NET_DEV_T1).expect("rewrite net/dev");
        let second = collector.collect().expect("second collect");
        assert_eq!(second[series::NETWORK_RECEIVE_KIBPS].len(), 1);
        assert_eq!(
            second[series::NETWORK_RECEIVE_KIBPS][0].label("NetInterface"),
            Some("eth0")
        );
    }

    #[test]
    fn test_unlisted_interface_is_ignored() {
        let counters = parse_net_dev(NET_DEV_T0, &["lo".to_string()]);
        assert!(counters.contains_key("lo"));
        assert!(!counters.contains_key("eth0"));
    }
}
