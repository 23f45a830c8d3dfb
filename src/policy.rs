use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tokio::sync::broadcast;

use crate::crd::{DEFAULT_SCHEDULING_COOL_DOWN_SECONDS, NodeQOSEnsurancePolicy};

/* ============================= DETECTION ============================= */

/// Live state of one (policy, objective) rule.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionCondition {
    pub policy_namespace: String,
    pub policy_name: String,
    /// The objective's avoidance action name; part of the detection key.
    pub action_name: String,
    pub metric_name: String,
    /// Parsed objective target, pushed onto the metric's water-line while
    /// this detection is active.
    pub target_value: f64,
    pub dry_run: bool,
    pub triggered: bool,
    pub restored: bool,
    pub last_triggered_time: Option<DateTime<Utc>>,
    pub cool_down_seconds: i64,
}

impl DetectionCondition {
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.policy_namespace, self.policy_name, self.action_name
        )
    }
}

impl Default for DetectionCondition {
    fn default() -> Self {
        Self {
            policy_namespace: String::new(),
            policy_name: String::new(),
            action_name: String::new(),
            metric_name: String::new(),
            target_value: 0.0,
            dry_run: false,
            triggered: false,
            restored: false,
            last_triggered_time: None,
            cool_down_seconds: DEFAULT_SCHEDULING_COOL_DOWN_SECONDS,
        }
    }
}

/// One step of the per-objective state machine.
///
/// `restored` is true only on the tick a previously triggered rule falls
/// back under its target; afterwards both flags are false.
pub fn next_detection_state(previous_triggered: bool, value: f64, target: f64) -> (bool, bool) {
    let triggered = value > target;
    let restored = previous_triggered && !triggered;
    (triggered, restored)
}

/* ============================= DETECTION CACHE ============================= */

/// Last-known detection per key. `set` is idempotent on the
/// (triggered, restored) pair so unchanged ticks cost nothing downstream.
#[derive(Default)]
pub struct DetectionCache {
    inner: Mutex<HashMap<String, DetectionCondition>>,
}

impl DetectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a detection. Returns true when the stored state changed.
    /// A re-triggered rule refreshes its last-triggered timestamp even
    /// though the flags are unchanged.
    pub fn set(&self, detection: DetectionCondition) -> bool {
        let mut inner = self.inner.lock().expect("detection cache lock poisoned");
        let key = detection.key();
        match inner.get_mut(&key) {
            Some(existing)
                if existing.triggered == detection.triggered
                    && existing.restored == detection.restored =>
            {
                if detection.triggered {
                    existing.last_triggered_time = detection.last_triggered_time;
                }
                false
            }
            _ => {
                inner.insert(key, detection);
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<DetectionCondition> {
        self.inner
            .lock()
            .expect("detection cache lock poisoned")
            .get(key)
            .cloned()
    }

    /// Copy every detection out; callers never compute under the lock.
    pub fn list(&self) -> Vec<DetectionCondition> {
        let inner = self.inner.lock().expect("detection cache lock poisoned");
        inner.values().cloned().collect()
    }

    /// Drop all detections owned by a deleted policy.
    pub fn remove_policy(&self, namespace: &str, name: &str) {
        let prefix = format!("{namespace}/{name}/");
        self.inner
            .lock()
            .expect("detection cache lock poisoned")
            .retain(|k, _| !k.starts_with(&prefix));
    }
}

/* ============================= POLICY CACHE ============================= */

pub struct CachedPolicy {
    pub policy: NodeQOSEnsurancePolicy,
    /// Set until the first reconciliation spawns the detection loop.
    pub needs_start_detection: bool,
    stop: broadcast::Sender<()>,
}

/// Ordered mapping from policy key to its cached object, detection-loop
/// state and cancellation handle.
#[derive(Default)]
pub struct PolicyCache {
    inner: Mutex<HashMap<String, CachedPolicy>>,
}

pub fn policy_key(policy: &NodeQOSEnsurancePolicy) -> String {
    format!(
        "{}/{}",
        policy.namespace().unwrap_or_default(),
        policy.name_any()
    )
}

impl PolicyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a policy. Returns a stop receiver when this is the
    /// first reconciliation and the caller must spawn the detection loop.
    pub fn get_or_create(&self, policy: &NodeQOSEnsurancePolicy) -> Option<broadcast::Receiver<()>> {
        let mut inner = self.inner.lock().expect("policy cache lock poisoned");
        let key = policy_key(policy);
        let cached = inner.entry(key).or_insert_with(|| {
            let (stop, _) = broadcast::channel(1);
            CachedPolicy {
                policy: policy.clone(),
                needs_start_detection: true,
                stop,
            }
        });
        cached.policy = policy.clone();
        if cached.needs_start_detection {
            cached.needs_start_detection = false;
            Some(cached.stop.subscribe())
        } else {
            None
        }
    }

    /// Remove a policy, cancelling its detection loop. Returns the removed
    /// policy when it was cached.
    pub fn delete(&self, key: &str) -> Option<NodeQOSEnsurancePolicy> {
        let mut inner = self.inner.lock().expect("policy cache lock poisoned");
        inner.remove(key).map(|cached| {
            let _ = cached.stop.send(());
            cached.policy
        })
    }

    pub fn exists(&self, key: &str) -> bool {
        self.inner
            .lock()
            .expect("policy cache lock poisoned")
            .contains_key(key)
    }

    pub fn list(&self) -> Vec<NodeQOSEnsurancePolicy> {
        let inner = self.inner.lock().expect("policy cache lock poisoned");
        inner.values().map(|c| c.policy.clone()).collect()
    }
}

/* ============================= TESTS ============================= */
