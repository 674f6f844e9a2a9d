//! Non-destructive deep-merge for skill data.
//!
//! The LLM wire format overloads JSON `null` as a deletion marker; patches are
//! decoded into an explicit tagged form before application so the merge logic
//! never has to reason about null twice.

use serde_json::{Map, Value};

/// A decoded patch node. `Set` replaces (scalars and arrays always replace),
/// `Delete` removes the field, `Merge` recurses into an object.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldPatch {
    Set(Value),
    Delete,
    Merge(Vec<(String, FieldPatch)>),
}

impl FieldPatch {
    /// Decode a raw JSON patch value. `null` means delete; objects merge
    /// recursively; everything else (strings, numbers, arrays, booleans)
    /// replaces the target wholesale.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => FieldPatch::Delete,
            Value::Object(map) => FieldPatch::Merge(
                map.into_iter()
                    .map(|(k, v)| (k, FieldPatch::from_value(v)))
                    .collect(),
            ),
            other => FieldPatch::Set(other),
        }
    }

    /// Apply this patch to `target` in place. `target` is coerced to an
    /// object when a `Merge` lands on a non-object.
    pub fn apply(self, target: &mut Value) {
        match self {
            FieldPatch::Set(value) => *target = value,
            FieldPatch::Delete => *target = Value::Null,
            FieldPatch::Merge(fields) => {
                if !target.is_object() {
                    *target = Value::Object(Map::new());
                }
                let map = target.as_object_mut().unwrap();
                for (key, patch) in fields {
                    match patch {
                        FieldPatch::Delete => {
                            map.remove(&key);
                        }
                        FieldPatch::Set(value) => {
                            map.insert(key, value);
                        }
                        merge @ FieldPatch::Merge(_) => {
                            let slot = map.entry(key).or_insert_with(|| Value::Object(Map::new()));
                            merge.apply(slot);
                        }
                    }
                }
            }
        }
    }
}

/// Deep-merge `patch` into `base`: objects merge recursively, `null` leaves
/// delete their field, arrays and scalars replace.
pub fn deep_merge(base: &mut Value, patch: Value) {
    FieldPatch::from_value(patch).apply(base);
}
