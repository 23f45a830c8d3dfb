use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::reflector;
use kube::runtime::watcher::{self, Event, watcher};
use kube::{Api, Client, ResourceExt};
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Registry, TextEncoder};
use tokio::sync::{broadcast, mpsc};
use tokio::{signal, time::sleep};
use tracing::{info, warn};

use kube_nodeqos::analyzer::{Analyzer, EventPublisher, evaluate_policy, index_actions};
use kube_nodeqos::avoidance::AvoidanceManager;
use kube_nodeqos::collector::{StateCollector, StateStore};
use kube_nodeqos::crd::{AvoidanceAction, NodeQOSEnsurancePolicy};
use kube_nodeqos::executor::evict::KubeEvictor;
use kube_nodeqos::executor::schedule::KubeNodeOps;
use kube_nodeqos::policy::{DetectionCache, PolicyCache, policy_key};
use kube_nodeqos::runtime::CgroupRuntime;
use kube_nodeqos::selector::selector_matches;

use crate::cli::AgentArgs;

/* ============================= CONFIG ============================= */

const POLICY_WATCH_BACKOFF: Duration = Duration::from_secs(5);

/// Marker for configuration errors so main can exit 255 instead of 1.
#[derive(Debug)]
pub struct InvalidConfig(pub String);

impl std::fmt::Display for InvalidConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl std::error::Error for InvalidConfig {}

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static POLICY_UPDATES: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "nodeqos_policy_updates_total",
        "Total NodeQOSEnsurancePolicy watch updates processed",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static POLICY_DELETES: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "nodeqos_policy_deletes_total",
        "Total NodeQOSEnsurancePolicy deletions processed",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static PODS_TRACKED: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "nodeqos_pods_tracked",
        "Pods on this node currently tracked by the agent",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

static DETECTIONS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("nodeqos_detections", "Detections by state"),
        &["state"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

/* ============================= ENTRY ============================= */

pub async fn run(args: AgentArgs) -> Result<()> {
    let node_name = args
        .node_name()
        .map_err(|e| InvalidConfig(e.to_string()))?;
    let metrics_addr: SocketAddr = args
        .metrics_bind_address
        .parse()
        .map_err(|_| InvalidConfig(format!("bad metrics address {}", args.metrics_bind_address)))?;
    let health_addr: SocketAddr = args
        .health_probe_bind_address
        .parse()
        .map_err(|_| {
            InvalidConfig(format!(
                "bad health probe address {}",
                args.health_probe_bind_address
            ))
        })?;
    if args.ifaces.is_empty() {
        return Err(InvalidConfig("at least one interface required".to_string()).into());
    }

    println!("Starting node QoS agent...\n");
    info!(node = %node_name, "agent_starting");

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    print!("  Node object ................. ");
    let nodes_api: Api<Node> = Api::all(client.clone());
    let node = match nodes_api.get(&node_name).await {
        Ok(n) => {
            println!("OK ({node_name})");
            n
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Node {} not found: {}", node_name, e);
        }
    };

    LazyLock::force(&POLICY_UPDATES);
    LazyLock::force(&POLICY_DELETES);
    LazyLock::force(&PODS_TRACKED);
    LazyLock::force(&DETECTIONS);

    println!("  Runtime endpoint ............ {}", args.runtime_endpoint);
    println!("  cgroup root ................. {}", args.cgroup_root);
    println!("  Interfaces .................. {}", args.ifaces.join(", "));
    println!("  Webhook ..................... {}:{} (unused)", args.webhook_host, args.webhook_port);
    println!("  Metrics server .............. http://{metrics_addr}/metrics");
    println!("  Health probes ............... http://{health_addr}/healthz /readyz");
    println!();
    println!("Agent running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    /* ---------- shared state ---------- */

    let state = Arc::new(StateStore::new());
    let policy_cache = Arc::new(PolicyCache::new());
    let detections = Arc::new(DetectionCache::new());

    let node_labels = Arc::new(RwLock::new(node.labels().clone()));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (plan_tx, plan_rx) = mpsc::channel(1);

    /* ---------- pod / action reflectors ---------- */

    let (pod_reader, pod_writer) = reflector::store::<Pod>();
    {
        let pods_api: Api<Pod> = Api::all(client.clone());
        let config = watcher::Config::default().fields(&format!("spec.nodeName={node_name}"));
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let stream = reflector::reflector(pod_writer, watcher(pods_api, config));
            let mut stream = std::pin::pin!(stream);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    event = stream.next() => {
                        if let Some(Err(e)) = event {
                            warn!(error = %e, "pod_watch_error");
                            sleep(POLICY_WATCH_BACKOFF).await;
                        }
                    }
                }
            }
        });
    }

    let (action_reader, action_writer) = reflector::store::<AvoidanceAction>();
    {
        let actions_api: Api<AvoidanceAction> = Api::all(client.clone());
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let stream = reflector::reflector(action_writer, watcher(actions_api, watcher::Config::default()));
            let mut stream = std::pin::pin!(stream);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    event = stream.next() => {
                        if let Some(Err(e)) = event {
                            warn!(error = %e, "action_watch_error");
                            sleep(POLICY_WATCH_BACKOFF).await;
                        }
                    }
                }
            }
        });
    }

    /* ---------- node label refresh ---------- */

    {
        let nodes_api = nodes_api.clone();
        let node_name = node_name.clone();
        let node_labels = node_labels.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = ticker.tick() => {
                        match nodes_api.get(&node_name).await {
                            Ok(node) => {
                                *node_labels.write().expect("node labels lock") = node.labels().clone();
                            }
                            Err(e) => warn!(error = %e, "node_refresh_failed"),
                        }
                    }
                }
            }
        });
    }

    /* ---------- shared listers ---------- */

    let pod_lister: kube_nodeqos::collector::PodLister = {
        let pod_reader = pod_reader.clone();
        Arc::new(move || pod_reader.state().iter().map(|p| (**p).clone()).collect())
    };
    let policy_lister: kube_nodeqos::collector::PolicyLister = {
        let policy_cache = policy_cache.clone();
        Arc::new(move || policy_cache.list())
    };
    let action_lister: kube_nodeqos::analyzer::ActionLister = {
        let action_reader = action_reader.clone();
        Arc::new(move || action_reader.state().iter().map(|a| (**a).clone()).collect())
    };
    let labels_fn: kube_nodeqos::collector::NodeLabelsFn = {
        let node_labels = node_labels.clone();
        Arc::new(move || node_labels.read().expect("node labels lock").clone())
    };

    /* ---------- policy watcher + per-policy probes ---------- */

    {
        let policies_api: Api<NodeQOSEnsurancePolicy> = Api::all(client.clone());
        let policy_cache = policy_cache.clone();
        let detections = detections.clone();
        let state = state.clone();
        let action_lister = action_lister.clone();
        let labels_fn = labels_fn.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let stream = watcher(policies_api, watcher::Config::default());
            let mut stream = std::pin::pin!(stream);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    event = stream.next() => {
                        match event {
                            Some(Ok(Event::Applied(policy))) => {
                                POLICY_UPDATES.inc();
                                reconcile_policy(
                                    policy,
                                    &policy_cache,
                                    &detections,
                                    &state,
                                    &action_lister,
                                    &labels_fn,
                                );
                            }
                            Some(Ok(Event::Deleted(policy))) => {
                                POLICY_DELETES.inc();
                                let key = policy_key(&policy);
                                policy_cache.delete(&key);
                                detections.remove_policy(
                                    policy.namespace().unwrap_or_default().as_str(),
                                    &policy.name_any(),
                                );
                                info!(policy = %key, "policy_deleted");
                            }
                            Some(Ok(Event::Restarted(policies))) => {
                                for policy in policies {
                                    POLICY_UPDATES.inc();
                                    reconcile_policy(
                                        policy,
                                        &policy_cache,
                                        &detections,
                                        &state,
                                        &action_lister,
                                        &labels_fn,
                                    );
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "policy_watch_error");
                                sleep(POLICY_WATCH_BACKOFF).await;
                            }
                            None => return,
                        }
                    }
                }
            }
        });
    }

    /* ---------- collectors ---------- */

    let collector = StateCollector::new(
        args.ifaces.clone(),
        PathBuf::from(&args.cgroup_root),
        pod_lister.clone(),
        policy_lister.clone(),
        labels_fn.clone(),
        state.clone(),
    );
    let collector_handle = tokio::spawn(collector.run(shutdown_tx.subscribe()));

    /* ---------- analyzer ---------- */

    let analyzer = Analyzer {
        node_name: node_name.clone(),
        policy_lister: policy_lister.clone(),
        action_lister: action_lister.clone(),
        pod_lister: pod_lister.clone(),
        node_labels: labels_fn.clone(),
        state: state.clone(),
        detections: detections.clone(),
        plan_tx,
        events: Some(EventPublisher::new(
            client.clone(),
            "kube-nodeqos-agent",
            node_name.clone(),
        )),
    };
    let analyzer_handle = tokio::spawn(analyzer.run(shutdown_tx.subscribe()));

    /* ---------- executor ---------- */

    let manager = AvoidanceManager {
        node_name: node_name.clone(),
        pod_lister: pod_lister.clone(),
        state: state.clone(),
        nodes: KubeNodeOps::new(client.clone(), node_name.clone()),
        runtime: Arc::new(CgroupRuntime::new(PathBuf::from(&args.cgroup_root))),
        evictor: KubeEvictor::new(client.clone()),
    };
    let executor_handle = tokio::spawn(manager.run(plan_rx, shutdown_tx.subscribe()));

    /* ---------- status gauges ---------- */

    {
        let pod_lister = pod_lister.clone();
        let detections = detections.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = ticker.tick() => {
                        PODS_TRACKED.set(pod_lister().len() as i64);
                        let all = detections.list();
                        let triggered = all.iter().filter(|d| d.triggered).count() as i64;
                        let restored = all.iter().filter(|d| d.restored).count() as i64;
                        DETECTIONS.with_label_values(&["triggered"]).set(triggered);
                        DETECTIONS.with_label_values(&["restored"]).set(restored);
                    }
                }
            }
        });
    }

    /* ---------- http ---------- */

    let health_handle = tokio::spawn(serve(
        build_health_router(state.clone()),
        health_addr,
        shutdown_tx.subscribe(),
    ));
    let metrics_handle = tokio::spawn(serve(
        build_metrics_router(),
        metrics_addr,
        shutdown_tx.subscribe(),
    ));

    signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping agent...");

    let _ = shutdown_tx.send(());

    let _ = collector_handle.await;
    let _ = analyzer_handle.await;
    let _ = executor_handle.await;
    let _ = health_handle.await;
    let _ = metrics_handle.await;

    info!("agent_stopped");
    println!("Agent stopped.");
    Ok(())
}

/* ============================= POLICY RECONCILE ============================= */

/// First sighting of a policy spawns its detection probe loop at the
/// policy's own period; the loop re-reads the cached policy every tick so
/// spec updates take effect, and exits when the policy is deleted.
fn reconcile_policy(
    policy: NodeQOSEnsurancePolicy,
    policy_cache: &Arc<PolicyCache>,
    detections: &Arc<DetectionCache>,
    state: &Arc<StateStore>,
    action_lister: &kube_nodeqos::analyzer::ActionLister,
    labels_fn: &kube_nodeqos::collector::NodeLabelsFn,
) {
    let key = policy_key(&policy);
    let period = policy.spec.node_quality_probe.period_seconds().max(1) as u64;

    let Some(mut stop) = policy_cache.get_or_create(&policy) else {
        return;
    };
    info!(policy = %key, period, "detection_loop_started");

    let policy_cache = policy_cache.clone();
    let detections = detections.clone();
    let state = state.clone();
    let action_lister = action_lister.clone();
    let labels_fn = labels_fn.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(period));
        loop {
            tokio::select! {
                _ = stop.recv() => {
                    info!(policy = %key, "detection_loop_stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let Some(snapshot) = state.load() else {
                        continue;
                    };
                    let Some(policy) = policy_cache
                        .list()
                        .into_iter()
                        .find(|p| policy_key(p) == key)
                    else {
                        return;
                    };
                    if !selector_matches(policy.spec.selector.as_ref(), &(labels_fn)()) {
                        continue;
                    }
                    let actions = index_actions((action_lister)());
                    for detection in
                        evaluate_policy(&policy, &actions, &snapshot, &detections, chrono::Utc::now())
                    {
                        detections.set(detection);
                    }
                }
            }
        }
    });
}

/* ============================= HTTP ============================= */

pub(crate) fn build_health_router(state: Arc<StateStore>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get(move || {
                let state = state.clone();
                async move {
                    if state.is_ready() {
                        (StatusCode::OK, "READY")
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
                    }
                }
            }),
        )
}

pub(crate) fn build_metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

async fn serve(app: Router, addr: SocketAddr, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, "http_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn ready_state() -> Arc<StateStore> {
        let state = Arc::new(StateStore::new());
        state.publish(kube_nodeqos::series::MetricSeries::new());
        state
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let app = build_health_router(Arc::new(StateStore::new()));
        let req = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_readyz_before_first_snapshot() {
        let app = build_health_router(Arc::new(StateStore::new()));
        let req = Request::builder()
            .uri("/readyz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_after_first_snapshot() {
        let app = build_health_router(ready_state());
        let req = Request::builder()
            .uri("/readyz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"READY");
    }

    #[tokio::test]
    async fn test_metrics_returns_ok() {
        let app = build_metrics_router();
        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn test_pods_tracked_metric_registered() {
        LazyLock::force(&PODS_TRACKED);
        let families = REGISTRY.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"nodeqos_pods_tracked"));
    }

    #[test]
    fn test_invalid_config_display() {
        let err = InvalidConfig("bad address".to_string());
        assert!(err.to_string().contains("bad address"));
    }
}
