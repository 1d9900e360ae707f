//! JSON merge patches (RFC 7386).
//!
//! Status writes never send whole objects: both actors diff what they last
//! observed against what they want and send only the difference. Because the
//! diff is computed leaf by leaf, a replica that only touched its own
//! metrics entry produces a patch that only touches that entry.

use serde_json::{Map, Value};

use crate::error::{ClusterError, ClusterResult};
use crate::types::StepStatus;

/// Compute the merge patch that turns `from` into `to`.
///
/// Returns `None` when the two documents are equal. Keys missing from `to`
/// are emitted as `null` (removal).
pub fn merge_diff(from: &Value, to: &Value) -> Option<Value> {
    if from == to {
        return None;
    }
    match (from, to) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, value) in new {
                match old.get(key) {
                    Some(previous) => {
                        if let Some(diff) = merge_diff(previous, value) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Some(Value::Object(patch))
        }
        _ => Some(to.clone()),
    }
}

/// Apply a merge patch to `target` in place.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in entries {
            if value.is_null() {
                map.remove(key);
            } else {
                apply_merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Build a `{"status": ...}` merge patch from two typed statuses.
///
/// Returns `None` when nothing changed.
pub fn status_patch(from: &StepStatus, to: &StepStatus) -> ClusterResult<Option<Value>> {
    let old = serde_json::to_value(from).map_err(|e| ClusterError::Serialize(e.to_string()))?;
    let new = serde_json::to_value(to).map_err(|e| ClusterError::Serialize(e.to_string()))?;
    Ok(merge_diff(&old, &new).map(|diff| {
        let mut patch = Map::new();
        patch.insert("status".to_string(), diff);
        Value::Object(patch)
    }))
}
