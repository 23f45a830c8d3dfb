use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

/// Whether a label set satisfies a Kubernetes label selector.
///
/// An absent or empty selector matches everything. Unknown operators fail
/// the match rather than erroring out.
pub fn selector_matches(selector: Option<&LabelSelector>, labels: &BTreeMap<String, String>) -> bool {
    let Some(selector) = selector else {
        return true;
    };

    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let value = labels.get(&expr.key);
            let values = expr.values.clone().unwrap_or_default();
            let ok = match expr.operator.as_str() {
                "In" => value.is_some_and(|v| values.contains(v)),
                "NotIn" => !value.is_some_and(|v| values.contains(v)),
                "Exists" => value.is_some(),
                "DoesNotExist" => value.is_none(),
                _ => false,
            };
            if !ok {
                return false;
            }
        }
    }

    true
}

/// Selector match over plain label pairs, used for metric series whose
/// labels are not a Kubernetes object's labels.
pub fn selector_to_pairs(selector: &LabelSelector) -> Vec<(String, String)> {
    selector
        .match_labels
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect()
}

/* ============================= TESTS ============================= */
