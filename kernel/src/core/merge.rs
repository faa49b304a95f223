//! Safe merge of selector-proposed input patches into tool inputs.

use serde_json::{Map, Value};

/// Prefixes reserved for control-plane fields.
pub const DEFAULT_BLOCKED_PREFIXES: [&str; 3] = ["_system", "_queue", "_meta"];

#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub merged: Map<String, Value>,
    /// Patch keys that were discarded, in patch order.
    pub dropped_keys: Vec<String>,
}

/// Shallow-merge `patch_json` over `base`, dropping keys that start with a
/// blocked prefix. A patch that is not a JSON object is ignored entirely.
pub fn safe_merge(
    base: &Map<String, Value>,
    patch_json: Option<&str>,
    blocked_prefixes: &[String],
) -> MergeResult {
    let mut merged = base.clone();
    let mut dropped_keys = Vec::new();
    let patch = match patch_json.map(serde_json::from_str::<Value>) {
        Some(Ok(Value::Object(map))) => map,
        _ => {
            return MergeResult {
                merged,
                dropped_keys,
            };
        }
    };
    for (key, value) in patch {
        if blocked_prefixes.iter().any(|p| key.starts_with(p.as_str())) {
            dropped_keys.push(key);
            continue;
        }
        merged.insert(key, value);
    }
    MergeResult {
        merged,
        dropped_keys,
    }
}

pub fn default_blocked_prefixes() -> Vec<String> {
    DEFAULT_BLOCKED_PREFIXES
        .iter()
        .map(|p| (*p).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Map<String, Value> {
        match json!({"note": "base", "path": "/tmp/x"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn merges_allowed_keys_over_base() {
        let result = safe_merge(
            &base(),
            Some(r#"{"note":"patched","extra":1}"#),
            &default_blocked_prefixes(),
        );
        assert_eq!(result.merged["note"], json!("patched"));
        assert_eq!(result.merged["extra"], json!(1));
        assert_eq!(result.merged["path"], json!("/tmp/x"));
        assert!(result.dropped_keys.is_empty());
    }

    #[test]
    fn drops_reserved_prefixes() {
        let result = safe_merge(
            &base(),
            Some(r#"{"_system":{"sudo":true},"_queue_priority":9,"_metadata":1,"ok":true}"#),
            &default_blocked_prefixes(),
        );
        assert!(!result.merged.contains_key("_system"));
        assert!(!result.merged.contains_key("_queue_priority"));
        assert!(!result.merged.contains_key("_metadata"));
        assert_eq!(result.merged["ok"], json!(true));
        assert_eq!(result.dropped_keys.len(), 3);
    }

    #[test]
    fn missing_or_non_object_patch_keeps_base() {
        let prefixes = default_blocked_prefixes();
        assert_eq!(safe_merge(&base(), None, &prefixes).merged, base());
        assert_eq!(safe_merge(&base(), Some("[1]"), &prefixes).merged, base());
        assert_eq!(safe_merge(&base(), Some("{oops"), &prefixes).merged, base());
    }
}
