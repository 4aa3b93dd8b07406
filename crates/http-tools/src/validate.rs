//! Shape-compatibility checks for tool arguments.
//!
//! This is deliberately not a JSON Schema validator: it only checks that required arguments are
//! present and that each supplied value has the top-level JSON type its field declares.

use crate::error::ValidationError;
use crate::tool::{InputSchema, ParamLocation};
use serde_json::{Map, Value};

/// Validate `arguments` against `schema` and return them as an object.
///
/// `null` (or absent) arguments are treated as an empty object. Unknown keys are kept but
/// never bound to the request. Explicit `null` values count as absent.
///
/// # Errors
///
/// Returns the first problem found: non-object arguments, a missing required field, or a value
/// whose JSON type does not match the field schema.
pub fn validate_arguments(
    schema: &InputSchema,
    arguments: &Value,
) -> Result<Map<String, Value>, ValidationError> {
    let args = match arguments {
        Value::Null => Map::new(),
        Value::Object(m) => m.clone(),
        other => return Err(ValidationError::NotAnObject(json_type_name(other))),
    };

    for field in schema.fields() {
        let value = args.get(&field.name).filter(|v| !v.is_null());
        let Some(value) = value else {
            if field.required {
                return Err(ValidationError::Missing(field.name.clone()));
            }
            continue;
        };

        let allowed = declared_types(&field.schema);
        if !allowed.is_empty() && !allowed.iter().any(|t| type_matches(t, value)) {
            return Err(ValidationError::WrongType {
                field: field.name.clone(),
                expected: allowed.join("|"),
                found: json_type_name(value),
            });
        }

        // `.` and `..` would be normalized away as dot segments once substituted.
        if matches!(field.location, ParamLocation::Path) && matches!(value.as_str(), Some("." | "..")) {
            return Err(ValidationError::InvalidRequest(format!(
                "path argument '{}' cannot be '{}'",
                field.name,
                value.as_str().unwrap_or_default()
            )));
        }
    }

    Ok(args)
}

fn declared_types(schema: &Value) -> Vec<String> {
    match schema.get("type") {
        Some(Value::String(t)) => vec![t.clone()],
        Some(Value::Array(ts)) => ts
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|f| f.is_finite() && f.fract() == 0.0)
        }
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown type keywords are not ours to reject.
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::InputField;
    use serde_json::json;

    fn schema() -> InputSchema {
        InputSchema::new(vec![
            InputField {
                name: "id".to_string(),
                location: ParamLocation::Path,
                source_name: "id".to_string(),
                required: true,
                schema: json!({"type": "integer"}),
                whole_body: false,
            },
            InputField {
                name: "tags".to_string(),
                location: ParamLocation::Query,
                source_name: "tags".to_string(),
                required: false,
                schema: json!({"type": ["array", "string"]}),
                whole_body: false,
            },
            InputField {
                name: "extra".to_string(),
                location: ParamLocation::Body,
                source_name: "extra".to_string(),
                required: false,
                schema: json!({"description": "anything"}),
                whole_body: false,
            },
        ])
    }

    #[test]
    fn dot_segments_are_rejected_in_path_arguments() {
        let schema = InputSchema::new(vec![InputField {
            name: "name".to_string(),
            location: ParamLocation::Path,
            source_name: "name".to_string(),
            required: true,
            schema: json!({"type": "string"}),
            whole_body: false,
        }]);
        for dots in [".", ".."] {
            let err = validate_arguments(&schema, &json!({ "name": dots })).unwrap_err();
            assert!(matches!(err, ValidationError::InvalidRequest(_)), "{dots}");
        }
        assert!(validate_arguments(&schema, &json!({"name": "..."})).is_ok());
        assert!(validate_arguments(&schema, &json!({"name": "a.b"})).is_ok());
    }

    #[test]
    fn accepts_valid_arguments() {
        let args = validate_arguments(&schema(), &json!({"id": 7, "tags": "a"})).unwrap();
        assert_eq!(args.get("id"), Some(&json!(7)));
    }

    #[test]
    fn null_arguments_are_empty_object() {
        let err = validate_arguments(&schema(), &Value::Null).unwrap_err();
        assert_eq!(err, ValidationError::Missing("id".to_string()));
    }

    #[test]
    fn rejects_non_object() {
        let err = validate_arguments(&schema(), &json!([1])).unwrap_err();
        assert_eq!(err, ValidationError::NotAnObject("array"));
    }

    #[test]
    fn explicit_null_counts_as_missing() {
        let err = validate_arguments(&schema(), &json!({"id": null})).unwrap_err();
        assert_eq!(err, ValidationError::Missing("id".to_string()));
    }

    #[test]
    fn integer_accepts_integral_floats_only() {
        assert!(validate_arguments(&schema(), &json!({"id": 3.0})).is_ok());
        let err = validate_arguments(&schema(), &json!({"id": 3.5})).unwrap_err();
        assert!(matches!(err, ValidationError::WrongType { .. }));
    }

    #[test]
    fn union_types_and_untyped_fields() {
        assert!(validate_arguments(&schema(), &json!({"id": 1, "tags": ["x"]})).is_ok());
        assert!(validate_arguments(&schema(), &json!({"id": 1, "extra": {"k": 1}})).is_ok());
        let err = validate_arguments(&schema(), &json!({"id": 1, "tags": 5})).unwrap_err();
        assert_eq!(
            err,
            ValidationError::WrongType {
                field: "tags".to_string(),
                expected: "array|string".to_string(),
                found: "number",
            }
        );
    }
}
