use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Largest integer representable losslessly in a double: 2^53 - 1.
///
/// Values outside ±this range (and any float) are rejected before hashing or
/// signing, so that every implementation reproduces the same bytes.
pub const MAX_CANONICAL_INT: i64 = (1 << 53) - 1;

/// Errors from canonical JSON encoding.
#[derive(Debug, thiserror::Error)]
pub enum CanonicalJsonError {
    #[error("JSON serialization failed: {0}")]
    SerializationError(String),

    #[error("Non-integer number {0} is not permitted in canonical JSON")]
    FloatNotPermitted(String),

    #[error("Integer {0} is outside the canonical range of +/- 2^53 - 1")]
    IntegerOutOfRange(i64),
}

/// Encode a JSON value as Matrix canonical JSON.
///
/// Canonical JSON requirements:
/// - Object keys sorted lexicographically
/// - Compact representation (no insignificant whitespace)
/// - UTF-8 encoded
/// - Integers bounded to +/- (2^53 - 1); floats, NaN and Infinity rejected
///
/// This is the byte-reproducible form used for signature verification and
/// hash calculation, so the exact output matters for interoperability.
pub fn canonical_json(value: &Value) -> Result<String, CanonicalJsonError> {
    let canonical_value = canonicalize_value(value)?;
    serde_json::to_string(&canonical_value)
        .map_err(|e| CanonicalJsonError::SerializationError(e.to_string()))
}

fn canonicalize_value(value: &Value) -> Result<Value, CanonicalJsonError> {
    match value {
        Value::Object(obj) => {
            // BTreeMap gives the lexicographic key ordering
            let mut canonical_obj = BTreeMap::new();
            for (key, val) in obj {
                canonical_obj.insert(key.clone(), canonicalize_value(val)?);
            }

            let mut map = Map::new();
            for (key, val) in canonical_obj {
                map.insert(key, val);
            }
            Ok(Value::Object(map))
        },
        Value::Array(arr) => {
            let mut canonical_arr = Vec::with_capacity(arr.len());
            for item in arr {
                canonical_arr.push(canonicalize_value(item)?);
            }
            Ok(Value::Array(canonical_arr))
        },
        Value::Number(n) => {
            let int = n
                .as_i64()
                .ok_or_else(|| CanonicalJsonError::FloatNotPermitted(n.to_string()))?;
            // unsigned_abs: i64::MIN has no i64 absolute value.
            if int.unsigned_abs() > MAX_CANONICAL_INT as u64 {
                return Err(CanonicalJsonError::IntegerOutOfRange(int));
            }
            Ok(value.clone())
        },
        Value::String(_) | Value::Bool(_) | Value::Null => Ok(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_and_compacts() {
        let data = json!({
            "z_key": "last",
            "a_key": "first",
            "nested": {"b": 2, "a": 1},
            "boolean": true,
            "null_value": null
        });

        let canonical = canonical_json(&data).unwrap();
        assert_eq!(
            canonical,
            r#"{"a_key":"first","boolean":true,"nested":{"a":1,"b":2},"null_value":null,"z_key":"last"}"#
        );
    }

    #[test]
    fn rejects_floats() {
        let data = json!({"bad": 1.5});
        assert!(matches!(
            canonical_json(&data),
            Err(CanonicalJsonError::FloatNotPermitted(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_integers() {
        let data = json!({"big": 9_007_199_254_740_992i64});
        assert!(matches!(
            canonical_json(&data),
            Err(CanonicalJsonError::IntegerOutOfRange(_))
        ));

        let edge = json!({"edge": MAX_CANONICAL_INT});
        assert!(canonical_json(&edge).is_ok());

        // The most negative i64 must error, not panic on negation.
        let extreme = json!({"min": i64::MIN});
        assert!(matches!(
            canonical_json(&extreme),
            Err(CanonicalJsonError::IntegerOutOfRange(i64::MIN))
        ));
        let negative_edge = json!({"edge": -MAX_CANONICAL_INT});
        assert!(canonical_json(&negative_edge).is_ok());
    }

    #[test]
    fn arrays_preserve_order() {
        let data = json!({"list": [3, 1, 2]});
        assert_eq!(canonical_json(&data).unwrap(), r#"{"list":[3,1,2]}"#);
    }
}
