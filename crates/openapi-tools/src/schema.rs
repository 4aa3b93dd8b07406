use openapiv3::{ReferenceOr, Schema, SchemaKind, Type};
use serde_json::{Value, json};

/// Convert an `OpenAPI` schema to a JSON Schema value.
///
/// Nested `$ref`s are kept as `{"$ref": ...}`; callers resolve the top level themselves.
#[must_use]
pub fn schema_to_json(schema: &Schema) -> Value {
    let mut result = json!({});

    if let Some(desc) = &schema.schema_data.description {
        result["description"] = json!(desc);
    }
    if let Some(default) = &schema.schema_data.default {
        result["default"] = default.clone();
    }

    match &schema.schema_kind {
        SchemaKind::Type(t) => match t {
            Type::String(s) => {
                result["type"] = json!("string");
                if !s.enumeration.is_empty() {
                    let enum_values: Vec<_> = s.enumeration.iter().filter_map(Clone::clone).collect();
                    result["enum"] = json!(enum_values);
                }
            }
            Type::Number(_) => {
                result["type"] = json!("number");
            }
            Type::Integer(_) => {
                result["type"] = json!("integer");
            }
            Type::Boolean(_) => {
                result["type"] = json!("boolean");
            }
            Type::Array(a) => {
                result["type"] = json!("array");
                if let Some(items) = &a.items {
                    result["items"] = boxed_ref_to_json(items);
                }
            }
            Type::Object(o) => {
                result["type"] = json!("object");
                let mut properties = json!({});
                for (name, prop) in &o.properties {
                    properties[name] = boxed_ref_to_json(prop);
                }
                if !o.properties.is_empty() {
                    result["properties"] = properties;
                }
                if !o.required.is_empty() {
                    result["required"] = json!(o.required);
                }
            }
        },
        SchemaKind::OneOf { one_of } => result["oneOf"] = refs_to_json(one_of),
        SchemaKind::AnyOf { any_of } => result["anyOf"] = refs_to_json(any_of),
        SchemaKind::AllOf { all_of } => result["allOf"] = refs_to_json(all_of),
        // `not` and free-form schemas place no type constraint.
        SchemaKind::Not { .. } | SchemaKind::Any(_) => {}
    }

    if schema.schema_data.nullable
        && let Some(Value::String(t)) = result.get("type").cloned()
    {
        result["type"] = json!([t, "null"]);
    }

    result
}

/// JSON form of a possibly-referenced schema without resolving it.
#[must_use]
pub fn ref_to_json(schema: &ReferenceOr<Schema>) -> Value {
    match schema {
        ReferenceOr::Item(s) => schema_to_json(s),
        ReferenceOr::Reference { reference } => json!({ "$ref": reference }),
    }
}

fn boxed_ref_to_json(schema: &ReferenceOr<Box<Schema>>) -> Value {
    match schema {
        ReferenceOr::Item(s) => schema_to_json(s),
        ReferenceOr::Reference { reference } => json!({ "$ref": reference }),
    }
}

fn refs_to_json(schemas: &[ReferenceOr<Schema>]) -> Value {
    Value::Array(schemas.iter().map(ref_to_json).collect())
}
