//! Normalization of CDP `Runtime.RemoteObject` payloads into plain JSON.
//!
//! Console arguments arrive as remote objects: primitives carry a `value`,
//! special numbers an `unserializableValue`, and composite objects only a
//! bounded `preview`. The normalized form keeps log lines self-contained
//! without holding object handles open in the page.

use serde_json::{Map, Value};

/// Maps one remote object to the JSON value written into `console.*` args.
pub fn normalize_remote_object(obj: &Value) -> Value {
    // NaN, Infinity, -Infinity, -0, bigints: the protocol's string form.
    if let Some(unserializable) = obj.get("unserializableValue").and_then(Value::as_str) {
        if !unserializable.is_empty() {
            return Value::String(unserializable.to_string());
        }
    }

    // Primitives (including JS null, which arrives as value: null).
    if let Some(value) = obj.get("value") {
        return value.clone();
    }

    if obj.get("type").and_then(Value::as_str) == Some("undefined") {
        return Value::String("undefined".to_string());
    }

    if obj.get("subtype").and_then(Value::as_str) == Some("null") {
        return Value::Null;
    }

    if let Some(preview) = obj.get("preview") {
        return normalize_preview(preview);
    }

    // e.g. "[object Object]", "function foo()"
    if let Some(description) = obj.get("description").and_then(Value::as_str) {
        if !description.is_empty() {
            return Value::String(description.to_string());
        }
    }

    Value::String(
        obj.get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    )
}

fn normalize_preview(preview: &Value) -> Value {
    let properties = preview
        .get("properties")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let overflow = preview
        .get("overflow")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if preview.get("subtype").and_then(Value::as_str) == Some("array") {
        let mut items: Vec<Value> = properties.iter().map(normalize_property).collect();
        if overflow {
            items.push(Value::String("...".to_string()));
        }
        return Value::Array(items);
    }

    let mut map = Map::new();
    for prop in &properties {
        let name = prop
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        map.insert(name, normalize_property(prop));
    }
    if overflow {
        map.insert("...".to_string(), Value::String("(truncated)".to_string()));
    }
    Value::Object(map)
}

fn normalize_property(prop: &Value) -> Value {
    let value = prop.get("value").and_then(Value::as_str).unwrap_or_default();
    if value == "undefined" {
        return Value::String("undefined".to_string());
    }
    if value == "null" {
        return Value::Null;
    }

    match prop.get("type").and_then(Value::as_str) {
        Some("number") => value
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(value.to_string())),
        Some("boolean") => Value::Bool(value == "true"),
        Some("string") => Value::String(value.to_string()),
        Some("object") => {
            if prop.get("subtype").and_then(Value::as_str) == Some("null") {
                Value::Null
            } else {
                // Nested previews bottom out at a label: "Object", "Array(3)".
                Value::String(value.to_string())
            }
        }
        _ => Value::String(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn primitives_pass_through() {
        assert_eq!(
            normalize_remote_object(&json!({"type": "number", "value": 42})),
            json!(42)
        );
        assert_eq!(
            normalize_remote_object(&json!({"type": "string", "value": "hi"})),
            json!("hi")
        );
        assert_eq!(
            normalize_remote_object(&json!({"type": "boolean", "value": false})),
            json!(false)
        );
    }

    #[test]
    fn undefined_becomes_the_string_undefined() {
        assert_eq!(
            normalize_remote_object(&json!({"type": "undefined"})),
            json!("undefined")
        );
    }

    #[test]
    fn js_null_becomes_json_null() {
        assert_eq!(
            normalize_remote_object(&json!({"type": "object", "subtype": "null", "value": null})),
            Value::Null
        );
        assert_eq!(
            normalize_remote_object(&json!({"type": "object", "subtype": "null"})),
            Value::Null
        );
    }

    #[test]
    fn unserializable_values_keep_the_protocol_string() {
        assert_eq!(
            normalize_remote_object(&json!({"type": "number", "unserializableValue": "NaN"})),
            json!("NaN")
        );
        assert_eq!(
            normalize_remote_object(&json!({"type": "number", "unserializableValue": "Infinity"})),
            json!("Infinity")
        );
    }

    #[test]
    fn array_previews_expand_with_overflow_marker() {
        let obj = json!({
            "type": "object",
            "subtype": "array",
            "preview": {
                "subtype": "array",
                "overflow": true,
                "properties": [
                    {"name": "0", "type": "number", "value": "1"},
                    {"name": "1", "type": "string", "value": "two"}
                ]
            }
        });
        assert_eq!(normalize_remote_object(&obj), json!([1.0, "two", "..."]));
    }

    #[test]
    fn object_previews_expand_with_truncation_key() {
        let obj = json!({
            "type": "object",
            "preview": {
                "overflow": true,
                "properties": [
                    {"name": "ok", "type": "boolean", "value": "true"},
                    {"name": "nested", "type": "object", "value": "Object"}
                ]
            }
        });
        assert_eq!(
            normalize_remote_object(&obj),
            json!({"ok": true, "nested": "Object", "...": "(truncated)"})
        );
    }

    #[test]
    fn plain_objects_fall_back_to_description() {
        assert_eq!(
            normalize_remote_object(&json!({"type": "object", "description": "[object Object]"})),
            json!("[object Object]")
        );
        assert_eq!(
            normalize_remote_object(&json!({"type": "function"})),
            json!("function")
        );
    }
}
