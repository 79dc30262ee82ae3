//! Shallow schema validation
//!
//! A region's schema is a flat map of top-level key -> type tag. Only the
//! top level is checked: nested structures and undeclared keys pass
//! untouched. Downstream readers depend on this loose check, so it must
//! not be tightened into full structural validation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ShmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        };
        f.write_str(tag)
    }
}

/// Flat top-level schema: key name -> expected type tag.
pub type Schema = BTreeMap<String, FieldType>;

/// Check declared keys that are present in the payload. The payload must
/// be a JSON object when a schema is declared.
pub fn validate(schema: &Schema, value: &Value) -> Result<(), ShmError> {
    let Some(object) = value.as_object() else {
        return Err(ShmError::SchemaValidation(
            "schema declared but payload is not an object".to_string(),
        ));
    };

    for (key, expected) in schema {
        if let Some(actual) = object.get(key) {
            if !expected.matches(actual) {
                return Err(ShmError::SchemaValidation(format!(
                    "key '{key}' expected {expected}"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(pairs: &[(&str, FieldType)]) -> Schema {
        pairs
            .iter()
            .map(|(k, t)| (k.to_string(), *t))
            .collect()
    }

    #[test]
    fn accepts_matching_top_level_types() {
        let s = schema(&[
            ("pair", FieldType::String),
            ("spread", FieldType::Number),
            ("live", FieldType::Boolean),
            ("legs", FieldType::Array),
        ]);
        let v = json!({
            "pair": "WETH/USDC",
            "spread": 0.0042,
            "live": true,
            "legs": ["uniswap", "sushi"],
        });
        assert!(validate(&s, &v).is_ok());
    }

    #[test]
    fn rejects_wrong_top_level_type() {
        let s = schema(&[("spread", FieldType::Number)]);
        let v = json!({ "spread": "wide" });
        let err = validate(&s, &v).unwrap_err();
        assert!(matches!(err, ShmError::SchemaValidation(_)));
    }

    #[test]
    fn nested_mismatches_pass_the_shallow_check() {
        // Only the top level is inspected; nested shapes are not.
        let s = schema(&[("quote", FieldType::Object)]);
        let v = json!({ "quote": { "price": "not-a-number-and-still-fine" } });
        assert!(validate(&s, &v).is_ok());
    }

    #[test]
    fn missing_and_extra_keys_pass() {
        let s = schema(&[("pair", FieldType::String)]);
        let v = json!({ "other": 1 });
        assert!(validate(&s, &v).is_ok());
    }

    #[test]
    fn non_object_payload_fails_when_schema_declared() {
        let s = schema(&[("pair", FieldType::String)]);
        assert!(validate(&s, &json!([1, 2, 3])).is_err());
    }
}
