//! Argument validation against a tool's declared input schema.
//!
//! The schema dialect is the JSON-Schema subset providers actually use:
//! `type`, `properties`, `required`, `items`, `enum`, and numeric
//! bounds. Anything outside the subset is accepted rather than
//! rejected, so a provider with a richer schema still works.
//!
//! Models and kernels often hand numbers over as strings; top-level
//! string arguments are coerced to numbers when the schema declares a
//! numeric type, before validation runs.

use serde_json::{Map, Value};

/// Validate (and lightly coerce) `args` against `schema`.
///
/// Returns a human-readable description of the first mismatch.
pub fn validate_args(schema: &Map<String, Value>, args: &mut Value) -> Result<(), String> {
    if schema.is_empty() {
        return Ok(());
    }

    coerce_arg_types(args, schema);

    let schema = Value::Object(schema.clone());
    validate_value(&schema, args, "args")
}

/// Coerce top-level string arguments to numbers where the schema
/// declares `number` or `integer`.
fn coerce_arg_types(args: &mut Value, schema: &Map<String, Value>) {
    let Some(props) = schema.get("properties").and_then(Value::as_object) else {
        return;
    };
    let Some(args_map) = args.as_object_mut() else {
        return;
    };

    for (key, val) in args_map.iter_mut() {
        let should_be_number = props
            .get(key)
            .and_then(|s| s.get("type"))
            .and_then(Value::as_str)
            .is_some_and(|t| matches!(t, "number" | "integer"));

        if should_be_number {
            if let Some(s) = val.as_str() {
                if let Ok(num) = s.parse::<i64>() {
                    *val = serde_json::json!(num);
                } else if let Ok(num) = s.parse::<f64>() {
                    *val = serde_json::json!(num);
                }
            }
        }
    }
}

fn validate_value(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!(
                "{path}: value {value} is not one of the allowed values"
            ));
        }
        return Ok(());
    }

    // Union schemas: accept if any branch accepts.
    for key in ["oneOf", "anyOf"] {
        if let Some(branches) = schema.get(key).and_then(Value::as_array) {
            if branches
                .iter()
                .any(|branch| validate_value(branch, value, path).is_ok())
            {
                return Ok(());
            }
            return Err(format!("{path}: value matches no schema variant"));
        }
    }

    let Some(kind) = schema.get("type").and_then(Value::as_str) else {
        return Ok(());
    };

    match kind {
        "object" => {
            let Some(map) = value.as_object() else {
                return Err(format!("{path}: expected object"));
            };

            if let Some(required) = schema.get("required").and_then(Value::as_array) {
                for field in required.iter().filter_map(Value::as_str) {
                    if !map.contains_key(field) {
                        return Err(format!("{path}: missing required field '{field}'"));
                    }
                }
            }

            if let Some(props) = schema.get("properties").and_then(Value::as_object) {
                for (field, field_schema) in props {
                    if let Some(field_value) = map.get(field) {
                        if field_value.is_null() && !is_required(schema, field) {
                            continue;
                        }
                        validate_value(field_schema, field_value, &format!("{path}.{field}"))?;
                    }
                }
            }
            Ok(())
        }
        "array" => {
            let Some(items) = value.as_array() else {
                return Err(format!("{path}: expected array"));
            };
            if let Some(item_schema) = schema.get("items") {
                if item_schema.is_object() {
                    for (index, item) in items.iter().enumerate() {
                        validate_value(item_schema, item, &format!("{path}[{index}]"))?;
                    }
                }
            }
            Ok(())
        }
        "string" => {
            if !value.is_string() {
                return Err(format!("{path}: expected string"));
            }
            Ok(())
        }
        "boolean" => {
            if !value.is_boolean() {
                return Err(format!("{path}: expected boolean"));
            }
            Ok(())
        }
        "integer" => {
            let is_integral = value.as_i64().is_some()
                || value.as_u64().is_some()
                || value.as_f64().is_some_and(|n| n.fract() == 0.0);
            if !is_integral {
                return Err(format!("{path}: expected integer"));
            }
            check_bounds(schema, value, path)
        }
        "number" => {
            if !value.is_number() {
                return Err(format!("{path}: expected number"));
            }
            check_bounds(schema, value, path)
        }
        "null" => {
            if !value.is_null() {
                return Err(format!("{path}: expected null"));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn is_required(schema: &Map<String, Value>, field: &str) -> bool {
    schema
        .get("required")
        .and_then(Value::as_array)
        .is_some_and(|required| required.iter().any(|f| f.as_str() == Some(field)))
}

fn check_bounds(schema: &Map<String, Value>, value: &Value, path: &str) -> Result<(), String> {
    let Some(num) = value.as_f64() else {
        return Ok(());
    };
    if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
        if num < min {
            return Err(format!("{path}: {num} is below the minimum {min}"));
        }
    }
    if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
        if num > max {
            return Err(format!("{path}: {num} is above the maximum {max}"));
        }
    }
    Ok(())
}
