//! Canonical hashing of specs and children.
//!
//! Hashes are SHA-256 over canonical JSON: object keys sorted
//! lexicographically at every level, no insignificant whitespace, strings
//! and numbers in serde_json's standard encoding. Any implementation that
//! follows these rules produces the same digest.

use kube::core::DynamicObject;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::planner::ChildDescriptor;

/// Serialize `v` with sorted keys and no whitespace.
pub fn canonical_json(v: &Value) -> String {
    let mut out = String::new();
    write_canonical(v, &mut out);
    out
}

fn write_canonical(v: &Value, out: &mut String) {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(&map[k], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn hash_value(v: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(v).as_bytes()))
}

/// Hash of a declared spec.
pub fn spec_hash<S: Serialize>(spec: &S) -> Result<String, serde_json::Error> {
    Ok(hash_value(&serde_json::to_value(spec)?))
}

/// The fields of a child this controller owns: the body plus our labels
/// and annotations.
pub fn desired_fields(desired: &ChildDescriptor) -> Value {
    let mut out = Map::new();
    for (k, v) in &desired.body {
        out.insert(k.clone(), v.clone());
    }
    out.insert("labels".into(), serde_json::to_value(&desired.labels).unwrap_or_default());
    out.insert(
        "annotations".into(),
        serde_json::to_value(&desired.annotations).unwrap_or_default(),
    );
    Value::Object(out)
}

/// Project `live` onto the shape of `shape`: objects keep only keys that
/// `shape` has, arrays of equal length are projected element-wise, anything
/// else is taken from `live` as-is. Fields the platform adds (defaults,
/// status, extra annotations) therefore never count as drift.
fn project(live: &Value, shape: &Value) -> Value {
    match (live, shape) {
        (Value::Object(l), Value::Object(s)) => Value::Object(
            s.iter()
                .map(|(k, sv)| (k.clone(), l.get(k).map(|lv| project(lv, sv)).unwrap_or(Value::Null)))
                .collect(),
        ),
        (Value::Array(l), Value::Array(s)) if l.len() == s.len() => {
            Value::Array(l.iter().zip(s).map(|(lv, sv)| project(lv, sv)).collect())
        }
        (l, _) => l.clone(),
    }
}

/// The same fields as [`desired_fields`], read from a live object.
pub fn live_fields(desired: &ChildDescriptor, live: &DynamicObject) -> Value {
    let shape = desired_fields(desired);
    let mut live_doc = match &live.data {
        Value::Object(m) => m.clone(),
        _ => Map::new(),
    };
    live_doc.insert(
        "labels".into(),
        serde_json::to_value(live.metadata.labels.clone().unwrap_or_default()).unwrap_or_default(),
    );
    live_doc.insert(
        "annotations".into(),
        serde_json::to_value(live.metadata.annotations.clone().unwrap_or_default()).unwrap_or_default(),
    );
    project(&Value::Object(live_doc), &shape)
}

pub fn desired_hash(desired: &ChildDescriptor) -> String {
    hash_value(&desired_fields(desired))
}

pub fn live_hash(desired: &ChildDescriptor, live: &DynamicObject) -> String {
    hash_value(&live_fields(desired, live))
}

/// Whether `live` diverges from `desired` on any field we own.
pub fn child_drifted(desired: &ChildDescriptor, live: &DynamicObject) -> bool {
    desired_hash(desired) != live_hash(desired, live)
}

/// Overwrite the owned fields of `live` with the desired ones, keeping
/// everything else (resourceVersion included) intact.
pub fn overwrite_owned(desired: &ChildDescriptor, live: &DynamicObject) -> DynamicObject {
    let mut next = live.clone();
    if !next.data.is_object() {
        next.data = Value::Object(Map::new());
    }
    if let Some(map) = next.data.as_object_mut() {
        for (k, v) in &desired.body {
            map.insert(k.clone(), v.clone());
        }
    }
    let labels = next.metadata.labels.get_or_insert_with(Default::default);
    labels.extend(desired.labels.clone());
    if !desired.annotations.is_empty() {
        let ann = next.metadata.annotations.get_or_insert_with(Default::default);
        ann.extend(desired.annotations.clone());
    }
    next
}
