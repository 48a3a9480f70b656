//! Server configuration rendering.
//!
//! The config builder init container receives a single JSON document. It is produced by overlaying
//! the user supplied `spec.config` blob on top of the model values generated by the operator.

use std::hash::Hasher;

use serde_json::{json, Map, Value};

use crate::error::AppError;

/// Build the model values which every datacenter's config starts from.
///
/// The given seed hosts are joined into the seed list. Datacenters pass their seed service name,
/// which resolves to whichever pods currently carry the seed label, so the rendered config never
/// changes when seeds move.
pub fn model_values(seeds: &[String], cluster_name: &str, dc_name: &str) -> Value {
    json!({
        "cluster-info": {
            "name": cluster_name,
            "seeds": seeds.join(","),
        },
        "datacenter-info": {
            "name": dc_name,
        },
    })
}

/// Deep merge `overlay` into `base`.
///
/// - Objects are merged key by key, recursively.
/// - Any other overlay value (scalars, arrays, null) replaces the base value wholesale.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => merge_maps(base_map, overlay_map),
        (base, overlay) => *base = overlay.clone(),
    }
}

fn merge_maps(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, overlay_val) in overlay {
        match base.get_mut(key) {
            Some(base_val) => deep_merge(base_val, overlay_val),
            None => {
                base.insert(key.clone(), overlay_val.clone());
            }
        }
    }
}

/// Render the full config document from the model values and the optional user config.
///
/// The user config must be a JSON object, as it is merged into the model at the top level.
pub fn render_config(model: Value, user_config: Option<&Value>) -> Result<Value, AppError> {
    let mut rendered = model;
    match user_config {
        None | Some(Value::Null) => (),
        Some(overlay @ Value::Object(_)) => deep_merge(&mut rendered, overlay),
        Some(other) => {
            return Err(AppError::InvalidConfig(format!(
                "expected a JSON object at the top level of spec.config, got {}",
                json_kind(other)
            )))
        }
    }
    Ok(rendered)
}

/// Produce a stable hex hash of the given config document and image.
///
/// `serde_json` keeps object keys sorted, so equal documents always serialize identically.
pub fn config_hash(config: &Value, image: &str) -> String {
    let mut hasher = seahash::SeaHasher::new();
    hasher.write(config.to_string().as_bytes());
    hasher.write(image.as_bytes());
    format!("{:016x}", hasher.finish())
}

/// Search for a nested object under the given key at any depth.
pub fn search_object<'a>(value: &'a Value, key: &str) -> Option<&'a Map<String, Value>> {
    let map = value.as_object()?;
    if let Some(found) = map.get(key).and_then(Value::as_object) {
        return Some(found);
    }
    map.values().find_map(|val| search_object(val, key))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
