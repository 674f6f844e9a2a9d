//! Argument-shape normalization at the registry boundary.
//!
//! Models emit tool arguments in four shapes: a plain object, a positional
//! array, a nested array with a leading operation string, or meta-level keys
//! flattened onto the action (the parser promotes those before dispatch).
//! Everything converges on one canonical object here; tools then deserialize
//! their own `deny_unknown_fields` structs so unknown fields come back as a
//! message the model can act on.

use serde_json::{json, Map, Value};

/// Convert any accepted argument shape into a canonical JSON object.
pub fn normalize(raw: &Value, positional_keys: &[&str]) -> Value {
    match raw {
        Value::Object(_) => raw.clone(),
        Value::Array(items) => normalize_array(items, positional_keys),
        Value::Null => Value::Object(Map::new()),
        scalar => {
            // A bare scalar maps onto the tool's first positional key.
            match positional_keys.first() {
                Some(key) => json!({ *key: scalar.clone() }),
                None => json!({ "value": scalar.clone() }),
            }
        }
    }
}

fn normalize_array(items: &[Value], positional_keys: &[&str]) -> Value {
    // [op, {..}]: leading operation string wrapping an argument object.
    if items.len() == 2 {
        if let (Some(op), Value::Object(rest)) = (items[0].as_str(), &items[1]) {
            let mut map = rest.clone();
            map.entry("op".to_string()).or_insert_with(|| json!(op));
            return Value::Object(map);
        }
    }

    // Positional: zip onto the declared key names.
    let mut map = Map::new();
    let mut overflow = Vec::new();
    for (i, item) in items.iter().enumerate() {
        match positional_keys.get(i) {
            Some(key) => {
                map.insert((*key).to_string(), item.clone());
            }
            None => overflow.push(item.clone()),
        }
    }
    if !overflow.is_empty() {
        map.insert("args".to_string(), Value::Array(overflow));
    }
    Value::Object(map)
}

/// Promote unrecognized meta-level action keys under `arguments`. The
/// envelope keys themselves (`type`, `tool`, `arguments`, `reasoning`) stay
/// where they are.
pub fn promote_flattened_keys(action: &mut Value) {
    let Some(obj) = action.as_object_mut() else {
        return;
    };
    let extra: Vec<String> = obj
        .keys()
        .filter(|k| !matches!(k.as_str(), "type" | "tool" | "arguments" | "reasoning"))
        .cloned()
        .collect();
    if extra.is_empty() {
        return;
    }

    let mut promoted: Vec<(String, Value)> = Vec::new();
    for key in extra {
        if let Some(value) = obj.remove(&key) {
            promoted.push((key, value));
        }
    }

    let arguments = obj
        .entry("arguments".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !arguments.is_object() {
        *arguments = Value::Object(Map::new());
    }
    let args_map = arguments.as_object_mut().unwrap();
    for (key, value) in promoted {
        args_map.entry(key).or_insert(value);
    }
}
