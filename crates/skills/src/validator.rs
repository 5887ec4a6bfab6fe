//! Structural validation of tool inputs against a JSON-schema subset.
//!
//! Supported schema keywords: `properties` (per-field `type`, `enum`,
//! `minimum`/`maximum`, `minItems`/`maxItems`, `maxLength`, `items`) and
//! `required`. Unknown fields pass through untouched so clients written
//! against a newer schema aren't wedged. Strings carry a hard cap of
//! [`DEFAULT_MAX_STRING_LEN`] when the schema gives no `maxLength`.

use serde_json::Value;

/// Hard cap applied to string fields without an explicit `maxLength`.
pub const DEFAULT_MAX_STRING_LEN: usize = 10_000;

/// Validate `input` against `schema`.
///
/// Returns the sanitized input (structurally unchanged — validation
/// accepts or rejects, it does not coerce) or the collected list of
/// human-readable problems naming the offending fields.
pub fn validate(input: &Value, schema: &Value) -> Result<Value, Vec<String>> {
    let mut errors = Vec::new();

    let obj = match input.as_object() {
        Some(o) => o,
        None => return Err(vec!["input must be a JSON object".into()]),
    };

    let properties = schema.get("properties").and_then(|p| p.as_object());

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for name in required.iter().filter_map(|v| v.as_str()) {
            if !obj.contains_key(name) {
                errors.push(format!("missing required field \"{name}\""));
            }
        }
    }

    if let Some(props) = properties {
        for (name, field_schema) in props {
            if let Some(value) = obj.get(name) {
                check_field(name, value, field_schema, &mut errors);
            }
        }
    }

    if errors.is_empty() {
        Ok(input.clone())
    } else {
        Err(errors)
    }
}

fn check_field(name: &str, value: &Value, schema: &Value, errors: &mut Vec<String>) {
    let declared = schema.get("type").and_then(|t| t.as_str());

    if let Some(type_name) = declared {
        if !type_matches(value, type_name) {
            errors.push(format!(
                "field \"{name}\" must be of type {type_name}, got {}",
                value_type_name(value)
            ));
            return; // further checks assume the right shape
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(value) {
            let options: Vec<String> = allowed.iter().map(value_to_display).collect();
            errors.push(format!(
                "field \"{name}\" must be one of [{}]",
                options.join(", ")
            ));
        }
    }

    match value {
        Value::String(s) => {
            let cap = schema
                .get("maxLength")
                .and_then(|m| m.as_u64())
                .map(|m| m as usize)
                .unwrap_or(DEFAULT_MAX_STRING_LEN);
            if s.chars().count() > cap {
                errors.push(format!(
                    "field \"{name}\" exceeds maximum length of {cap} characters"
                ));
            }
        }
        Value::Number(n) => {
            if let (Some(min), Some(v)) = (schema.get("minimum").and_then(|m| m.as_f64()), n.as_f64())
            {
                if v < min {
                    errors.push(format!("field \"{name}\" must be >= {min}"));
                }
            }
            if let (Some(max), Some(v)) = (schema.get("maximum").and_then(|m| m.as_f64()), n.as_f64())
            {
                if v > max {
                    errors.push(format!("field \"{name}\" must be <= {max}"));
                }
            }
        }
        Value::Array(items) => {
            if let Some(min) = schema.get("minItems").and_then(|m| m.as_u64()) {
                if (items.len() as u64) < min {
                    errors.push(format!("field \"{name}\" must have at least {min} items"));
                }
            }
            if let Some(max) = schema.get("maxItems").and_then(|m| m.as_u64()) {
                if (items.len() as u64) > max {
                    errors.push(format!("field \"{name}\" must have at most {max} items"));
                }
            }
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check_field(&format!("{name}[{i}]"), item, item_schema, errors);
                }
            }
        }
        _ => {}
    }
}

fn type_matches(value: &Value, type_name: &str) -> bool {
    match type_name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        // Unknown declared type: accept rather than reject (permissive).
        _ => true,
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn value_to_display(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{s}\""),
        other => other.to_string(),
    }
}
