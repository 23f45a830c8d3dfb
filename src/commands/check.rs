use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::ListParams;
use kube::{Api, Client};

use kube_nodeqos::crd::{AvoidanceAction, NodeQOSEnsurancePolicy};

fn report(name: &str, outcome: Result<String, String>) -> bool {
    match outcome {
        Ok(detail) if detail.is_empty() => {
            println!("  [ ok ] {name}");
            true
        }
        Ok(detail) => {
            println!("  [ ok ] {name}: {detail}");
            true
        }
        Err(reason) => {
            println!("  [fail] {name}: {reason}");
            false
        }
    }
}

/// Preflight for the agent: client configuration, API reachability, the
/// reads the control loop depends on, and the ensurance CRDs.
pub async fn run() -> anyhow::Result<()> {
    println!("kube-nodeqos preflight\n");

    let client = match Client::try_default().await {
        Ok(client) => {
            report("client config", Ok(String::new()));
            client
        }
        Err(e) => {
            report("client config", Err(e.to_string()));
            anyhow::bail!("no usable kubeconfig or in-cluster config");
        }
    };

    match client.apiserver_version().await {
        Ok(v) => {
            report("api server", Ok(format!("v{}.{}", v.major, v.minor)));
        }
        Err(e) => {
            report("api server", Err(e.to_string()));
            println!("\nThe cluster is unreachable; the remaining checks need a live API server.");
            return Ok(());
        }
    }

    // The agent watches nodes and the pods scheduled onto one of them.
    let nodes: Api<Node> = Api::all(client.clone());
    let node_count = nodes.list(&ListParams::default()).await;
    report(
        "node read",
        node_count
            .as_ref()
            .map(|l| format!("{} node(s)", l.items.len()))
            .map_err(|e| e.to_string()),
    );

    let pods: Api<Pod> = Api::all(client.clone());
    let pod_probe = pods.list(&ListParams::default().limit(1)).await;
    report(
        "pod read",
        pod_probe.map(|_| String::new()).map_err(|e| e.to_string()),
    );

    // Both custom resources must be installed before policies can be served.
    let policies: Api<NodeQOSEnsurancePolicy> = Api::all(client.clone());
    let policy_probe = policies.list(&ListParams::default().limit(1)).await;
    let policies_ok = report(
        "NodeQOSEnsurancePolicy CRD",
        policy_probe.map(|_| String::new()).map_err(|e| e.to_string()),
    );

    let actions: Api<AvoidanceAction> = Api::all(client.clone());
    let action_probe = actions.list(&ListParams::default().limit(1)).await;
    let actions_ok = report(
        "AvoidanceAction CRD",
        action_probe.map(|_| String::new()).map_err(|e| e.to_string()),
    );

    if !policies_ok || !actions_ok {
        println!("\nInstall the missing custom resources with: kube-nodeqos crd install");
    }

    println!("\nPreflight finished.");
    Ok(())
}
