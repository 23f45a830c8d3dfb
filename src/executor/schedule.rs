use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, NodeCondition, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, PostParams};
use tracing::{info, warn};

pub const ANALYZED_PRESSURE_CONDITION: &str = "analyzed-pressure";
pub const ANALYZED_PRESSURE_TAINT_KEY: &str = "ensurance.crane.io/analyzed-pressure";
pub const ANALYZED_PRESSURE_TAINT_EFFECT: &str = "PreferNoSchedule";

const CONFLICT_RETRIES: usize = 3;

/* ============================= NODE OPS ============================= */

/// Node read/write boundary so the executor is testable without a cluster.
#[allow(async_fn_in_trait)]
pub trait NodeOps: Send + Sync {
    async fn get(&self) -> Result<Node, kube::Error>;
    async fn replace(&self, node: &Node) -> Result<(), kube::Error>;
    async fn replace_status(&self, node: &Node) -> Result<(), kube::Error>;
}

/// Real implementation against the local Node object.
pub struct KubeNodeOps {
    api: Api<Node>,
    node_name: String,
}

impl KubeNodeOps {
    pub fn new(client: kube::Client, node_name: String) -> Self {
        Self {
            api: Api::all(client),
            node_name,
        }
    }
}

impl NodeOps for KubeNodeOps {
    async fn get(&self) -> Result<Node, kube::Error> {
        self.api.get(&self.node_name).await
    }

    async fn replace(&self, node: &Node) -> Result<(), kube::Error> {
        self.api
            .replace(&self.node_name, &PostParams::default(), node)
            .await
            .map(|_| ())
    }

    async fn replace_status(&self, node: &Node) -> Result<(), kube::Error> {
        let data = serde_json::to_vec(node).map_err(kube::Error::SerdeError)?;
        self.api
            .replace_status(&self.node_name, &PostParams::default(), data)
            .await
            .map(|_| ())
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/* ============================= PURE UPDATES ============================= */

/// Set (or insert) a node condition; returns whether anything changed.
pub fn update_node_conditions(node: &Node, condition: NodeCondition) -> (Node, bool) {
    let mut updated = node.clone();
    let status = updated.status.get_or_insert_with(Default::default);
    let conditions = status.conditions.get_or_insert_with(Vec::new);

    for existing in conditions.iter_mut() {
        if existing.type_ == condition.type_ {
            if existing.status == condition.status {
                return (updated, false);
            }
            *existing = condition;
            return (updated, true);
        }
    }

    conditions.push(condition);
    (updated, true)
}

/// Insert or replace the pressure taint; returns whether anything changed.
pub fn upsert_node_taint(node: &Node, taint: Taint) -> (Node, bool) {
    let mut updated = node.clone();
    let spec = updated.spec.get_or_insert_with(Default::default);
    let taints = spec.taints.get_or_insert_with(Vec::new);

    for existing in taints.iter_mut() {
        if existing.key == taint.key {
            if existing.effect == taint.effect && existing.value == taint.value {
                return (updated, false);
            }
            *existing = taint;
            return (updated, true);
        }
    }

    taints.push(taint);
    (updated, true)
}

/// Remove the pressure taint; returns whether anything changed.
pub fn remove_node_taint(node: &Node, key: &str) -> (Node, bool) {
    let mut updated = node.clone();
    let Some(taints) = updated.spec.as_mut().and_then(|s| s.taints.as_mut()) else {
        return (updated, false);
    };
    let before = taints.len();
    taints.retain(|t| t.key != key);
    let changed = taints.len() != before;
    (updated, changed)
}

fn pressure_condition(active: bool) -> NodeCondition {
    NodeCondition {
        type_: ANALYZED_PRESSURE_CONDITION.to_string(),
        status: if active { "True" } else { "False" }.to_string(),
        last_transition_time: Some(Time(Utc::now())),
        ..Default::default()
    }
}

fn pressure_taint() -> Taint {
    Taint {
        key: ANALYZED_PRESSURE_TAINT_KEY.to_string(),
        effect: ANALYZED_PRESSURE_TAINT_EFFECT.to_string(),
        time_added: Some(Time(Utc::now())),
        ..Default::default()
    }
}

/* ============================= EXECUTOR ============================= */

/// Mark the node unschedulable for new work: condition True plus the
/// PreferNoSchedule taint. Writes are skipped when the node already has the
/// desired state; conflicts retry up to 3 times.
pub async fn avoid<N: NodeOps>(nodes: &N) -> anyhow::Result<()> {
    write_with_retry(nodes, true).await
}

/// Reverse of `avoid`: condition False, taint removed.
pub async fn restore<N: NodeOps>(nodes: &N) -> anyhow::Result<()> {
    write_with_retry(nodes, false).await
}

async fn write_with_retry<N: NodeOps>(nodes: &N, active: bool) -> anyhow::Result<()> {
    let mut last_err = None;

    for attempt in 0..CONFLICT_RETRIES {
        let node = nodes.get().await?;

        let (node, condition_changed) = update_node_conditions(&node, pressure_condition(active));
        if condition_changed {
            if let Err(e) = nodes.replace_status(&node).await {
                if is_conflict(&e) {
                    warn!(attempt, "node_status_update_conflict");
                    last_err = Some(e);
                    continue;
                }
                return Err(e.into());
            }
        }

        let (node, taint_changed) = if active {
            upsert_node_taint(&node, pressure_taint())
        } else {
            remove_node_taint(&node, ANALYZED_PRESSURE_TAINT_KEY)
        };
        if taint_changed {
            if let Err(e) = nodes.replace(&node).await {
                if is_conflict(&e) {
                    warn!(attempt, "node_update_conflict");
                    last_err = Some(e);
                    continue;
                }
                return Err(e.into());
            }
        }

        if condition_changed || taint_changed {
            info!(active, "schedule_state_updated");
        }
        return Ok(());
    }

    Err(anyhow::anyhow!(
        "node update failed, conflicted too many times: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn conflict_error() -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        })
    }

    /// In-memory node with an injectable number of write conflicts.
    struct FakeNodeOps {
        node: Mutex<Node>,
        conflicts_remaining: AtomicUsize,
        writes: AtomicUsize,
    }

    impl FakeNodeOps {
        fn new(node: Node, conflicts: usize) -> Self {
            Self {
                node: Mutex::new(node),
                conflicts_remaining: AtomicUsize::new(conflicts),
                writes: AtomicUsize::new(0),
            }
        }

        fn take_conflict(&self) -> bool {
            self.conflicts_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }

        fn current(&self) -> Node {
            self.node.lock().expect("node lock").clone()
        }
    }

    impl NodeOps for FakeNodeOps {
        async fn get(&self) -> Result<Node, kube::Error> {
            Ok(self.current())
        }

        async fn replace(&self, node: &Node) -> Result<(), kube::Error> {
            if self.take_conflict() {
                return Err(conflict_error());
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            *self.node.lock().expect("node lock") = node.clone();
            Ok(())
        }

        async fn replace_status(&self, node: &Node) -> Result<(), kube::Error> {
            if self.take_conflict() {
                return Err(conflict_error());
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            *self.node.lock().expect("node lock") = node.clone();
            Ok(())
        }
    }

    fn condition_status(node: &Node) -> Option<String> {
        node.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|c| c.iter().find(|c| c.type_ == ANALYZED_PRESSURE_CONDITION))
            .map(|c| c.status.clone())
    }

    fn has_taint(node: &Node) -> bool {
        node.spec
            .as_ref()
            .and_then(|s| s.taints.as_ref())
            .is_some_and(|t| t.iter().any(|t| t.key == ANALYZED_PRESSURE_TAINT_KEY))
    }

    // ── pure updates ──

    #[test]
    fn test_update_node_conditions_inserts() {
        let (node, changed) = update_node_conditions(&Node::default(), pressure_condition(true));
        assert!(changed);
        assert_eq!(condition_status(&node).as_deref(), Some("True"));
    }

    #[test]
    fn test_update_node_conditions_idempotent() {
        let (node, _) = update_node_conditions(&Node::default(), pressure_condition(true));
        let (_, changed) = update_node_conditions(&node, pressure_condition(true));
        assert!(!changed);
    }

    #[test]
    fn test_update_node_conditions_flips() {
        let (node, _) = update_node_conditions(&Node::default(), pressure_condition(true));
        let (node, changed) = update_node_conditions(&node, pressure_condition(false));
        assert!(changed);
        assert_eq!(condition_status(&node).as_deref(), Some("False"));
    }

    #[test]
    fn test_taint_upsert_and_remove() {
        let (node, added) = upsert_node_taint(&Node::default(), pressure_taint());
        assert!(added);
        assert!(has_taint(&node));

        let (node, added_again) = upsert_node_taint(&node, pressure_taint());
        assert!(!added_again);

        let (node, removed) = remove_node_taint(&node, ANALYZED_PRESSURE_TAINT_KEY);
        assert!(removed);
        assert!(!has_taint(&node));

        let (_, removed_again) = remove_node_taint(&node, ANALYZED_PRESSURE_TAINT_KEY);
        assert!(!removed_again);
    }

    // ── executor ──

    #[tokio::test]
    async fn test_avoid_sets_condition_and_taint() {
        let fake = FakeNodeOps::new(Node::default(), 0);
        avoid(&fake).await.expect("avoid should succeed");

        let node = fake.current();
        assert_eq!(condition_status(&node).as_deref(), Some("True"));
        assert!(has_taint(&node));
    }

    #[tokio::test]
    async fn test_restore_clears_condition_and_taint() {
        let fake = FakeNodeOps::new(Node::default(), 0);
        avoid(&fake).await.expect("avoid");
        restore(&fake).await.expect("restore should succeed");

        let node = fake.current();
        assert_eq!(condition_status(&node).as_deref(), Some("False"));
        assert!(!has_taint(&node));
    }

    #[tokio::test]
    async fn test_avoid_is_idempotent() {
        let fake = FakeNodeOps::new(Node::default(), 0);
        avoid(&fake).await.expect("first avoid");
        let writes_after_first = fake.writes.load(Ordering::SeqCst);

        avoid(&fake).await.expect("second avoid");
        // Desired state already present: no further writes.
        assert_eq!(fake.writes.load(Ordering::SeqCst), writes_after_first);
    }

    #[tokio::test]
    async fn test_avoid_retries_conflicts() {
        let fake = FakeNodeOps::new(Node::default(), 2);
        avoid(&fake).await.expect("avoid should retry through conflicts");
        let node = fake.current();
        assert_eq!(condition_status(&node).as_deref(), Some("True"));
        assert!(has_taint(&node));
    }

    #[tokio::test]
    async fn test_avoid_gives_up_after_three_conflicts() {
        let fake = FakeNodeOps::new(Node::default(), 10);
        let err = avoid(&fake).await.expect_err("should give up");
        assert!(err.to_string().contains("conflicted too many times"));
    }
}
