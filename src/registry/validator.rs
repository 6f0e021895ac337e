//! Argument validation against tool input schemas.
//!
//! The registry depends only on the [`SchemaValidator`] trait. The bundled
//! [`BasicSchemaValidator`] understands the subset of JSON Schema that tool
//! input schemas use in practice: `type`, `properties`, `required`,
//! `additionalProperties: false`, `items`, `enum`, `minimum` and `maximum`.
//! Unknown keywords are ignored.

use serde_json::{Map, Value};

use crate::error::FieldError;

/// Checks a value against a schema.
pub trait SchemaValidator: Send + Sync {
    /// Validates `value` against `schema`.
    ///
    /// # Errors
    ///
    /// Returns every violation found, with a JSON pointer to its location.
    fn validate(&self, schema: &Value, value: &Value) -> Result<(), Vec<FieldError>>;
}

/// Validator for the commonly used subset of JSON Schema.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicSchemaValidator;

impl SchemaValidator for BasicSchemaValidator {
    fn validate(&self, schema: &Value, value: &Value) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        check(schema, value, "", &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Describes a JSON value's type the way a schema would name it.
fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        other => type_name(value) == other,
    }
}

fn push(errors: &mut Vec<FieldError>, path: &str, expected: impl Into<String>, received: String) {
    errors.push(FieldError {
        path: path.to_string(),
        expected: expected.into(),
        received,
    });
}

fn check(schema: &Value, value: &Value, path: &str, errors: &mut Vec<FieldError>) {
    let Some(schema) = schema.as_object() else {
        // `true` / `{}` schemas accept anything; `false` accepts nothing.
        if schema == &Value::Bool(false) {
            push(errors, path, "nothing", type_name(value).to_string());
        }
        return;
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| matches_type(t, value)) {
            push(errors, path, allowed.join(" | "), type_name(value).to_string());
            return;
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(value) {
            push(
                errors,
                path,
                format!("one of {}", Value::Array(options.clone())),
                value.to_string(),
            );
        }
    }

    if let Some(number) = value.as_f64() {
        check_bounds(schema, number, path, errors);
    }

    match value {
        Value::Object(fields) => check_object(schema, fields, path, errors),
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (index, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{path}/{index}"), errors);
                }
            }
        }
        _ => {}
    }
}

fn check_bounds(schema: &Map<String, Value>, number: f64, path: &str, errors: &mut Vec<FieldError>) {
    if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
        if number < min {
            push(errors, path, format!(">= {min}"), number.to_string());
        }
    }
    if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
        if number > max {
            push(errors, path, format!("<= {max}"), number.to_string());
        }
    }
}

fn check_object(
    schema: &Map<String, Value>,
    fields: &Map<String, Value>,
    path: &str,
    errors: &mut Vec<FieldError>,
) {
    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(Value::Array(required)) = schema.get("required") {
        for name in required.iter().filter_map(Value::as_str) {
            if !fields.contains_key(name) {
                let expected = properties
                    .and_then(|p| p.get(name))
                    .and_then(|s| s.get("type"))
                    .map_or_else(|| "a value".to_string(), |t| match t {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                push(errors, &format!("{path}/{name}"), expected, "nothing".to_string());
            }
        }
    }

    for (name, field) in fields {
        let field_path = format!("{path}/{name}");
        match properties.and_then(|p| p.get(name)) {
            Some(field_schema) => check(field_schema, field, &field_path, errors),
            None => match schema.get("additionalProperties") {
                Some(Value::Bool(false)) => {
                    push(errors, &field_path, "no such property", type_name(field).to_string());
                }
                Some(extra @ Value::Object(_)) => check(extra, field, &field_path, errors),
                _ => {}
            },
        }
    }
}
