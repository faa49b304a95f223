//! Canonical JSON: object keys sorted recursively, arrays in order, compact.
//!
//! The writer does its own key ordering so the bytes do not depend on which
//! map representation `serde_json` was built with.

use serde_json::Value;

/// Serialize `value` canonically.
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    canonical_string(value).into_bytes()
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_value(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        primitive => out.push_str(&primitive.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_recursively_and_keeps_array_order() {
        let value = json!({"b": 1, "a": {"z": [3, {"y": 1, "x": 2}], "m": null}});
        assert_eq!(
            canonical_string(&value),
            r#"{"a":{"m":null,"z":[3,{"x":2,"y":1}]},"b":1}"#
        );
    }

    #[test]
    fn semantically_equal_documents_share_bytes() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": "two"}"#).expect("parse");
        let b: Value = serde_json::from_str(r#"{ "y":"two","x":1 }"#).expect("parse");
        assert_eq!(canonical_bytes(&a), canonical_bytes(&b));
    }

    #[test]
    fn escapes_strings_like_json() {
        let value = json!({"k\"ey": "line\nbreak"});
        assert_eq!(canonical_string(&value), r#"{"k\"ey":"line\nbreak"}"#);
    }

    #[test]
    fn reparsing_canonical_output_is_stable() {
        let value = json!({"f": 1.5, "n": -3, "s": "é", "t": true});
        let once = canonical_string(&value);
        let reparsed: Value = serde_json::from_str(&once).expect("parse");
        assert_eq!(canonical_string(&reparsed), once);
    }
}
