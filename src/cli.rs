use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kube-nodeqos")]
#[command(about = "Per-node QoS ensurance agent")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// Run the node QoS agent
    Agent(AgentArgs),

    /// Manage the ensurance CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRDs into the connected cluster
    Install,
}

#[derive(clap::Args, Clone, Debug)]
pub struct AgentArgs {
    /// Node name used to filter watches; defaults to the OS hostname
    #[arg(long, default_value = "")]
    pub hostname_override: String,

    /// Container runtime endpoint
    #[arg(long, default_value = "unix:///var/run/dockershim.sock")]
    pub runtime_endpoint: String,

    /// Network interfaces to sample, comma separated
    #[arg(long, value_delimiter = ',', default_value = "eth0")]
    pub ifaces: Vec<String>,

    /// cgroup v2 mount point
    #[arg(long, default_value = "/sys/fs/cgroup")]
    pub cgroup_root: String,

    /// Prometheus metrics listen address
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_bind_address: String,

    /// Health probe listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub health_probe_bind_address: String,

    /// Webhook serving port (reserved; the agent hosts no webhook)
    #[arg(long, default_value_t = 9443)]
    pub webhook_port: u16,

    /// Webhook serving host (reserved; the agent hosts no webhook)
    #[arg(long, default_value = "")]
    pub webhook_host: String,
}

impl AgentArgs {
    /// Resolved node name: the override, else the OS hostname.
    pub fn node_name(&self) -> anyhow::Result<String> {
        if !self.hostname_override.is_empty() {
            return Ok(self.hostname_override.clone());
        }
        std::env::var("HOSTNAME")
            .or_else(|_| {
                hostname_from_proc().ok_or_else(|| std::env::VarError::NotPresent)
            })
            .map_err(|_| anyhow::anyhow!("cannot determine node name, use --hostname-override"))
    }
}

fn hostname_from_proc() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_agent_defaults() {
        let cli = Cli::try_parse_from(["kube-nodeqos", "agent"]).expect("should parse");
        let Commands::Agent(args) = cli.command else {
            panic!("expected agent command");
        };
        assert_eq!(args.runtime_endpoint, "unix:///var/run/dockershim.sock");
        assert_eq!(args.ifaces, vec!["eth0"]);
        assert_eq!(args.metrics_bind_address, "0.0.0.0:9090");
        assert_eq!(args.cgroup_root, "/sys/fs/cgroup");
    }

    #[test]
    fn test_agent_ifaces_comma_separated() {
        let cli = Cli::try_parse_from(["kube-nodeqos", "agent", "--ifaces", "eth0,eth1"])
            .expect("should parse");
        let Commands::Agent(args) = cli.command else {
            panic!("expected agent command");
        };
        assert_eq!(args.ifaces, vec!["eth0", "eth1"]);
    }

    #[test]
    fn test_hostname_override_wins() {
        let args = AgentArgs {
            hostname_override: "node-7".to_string(),
            runtime_endpoint: String::new(),
            ifaces: vec![],
            cgroup_root: String::new(),
            metrics_bind_address: String::new(),
            health_probe_bind_address: String::new(),
            webhook_port: 9443,
            webhook_host: String::new(),
        };
        assert_eq!(args.node_name().expect("name"), "node-7");
    }
}
