//!
//! # Field ownership sets
//!
//! Server side apply tracks which manager owns which fields. Ownership is
//! recorded as a fieldsV1 style tree: `f:<name>` for object fields and
//! `k:<json key>` for keyed list members, with empty objects as leaves.
//!
use serde_json::Map;
use serde_json::Value;

use apix_schema::ListType;
use apix_schema::Structural;

/// compute the field set an applied document claims, guided by the
/// schema's list-type hints. Scalars, atomic lists and set lists are
/// leaves; keyed list members are owned individually.
pub fn extract_field_set(schema: Option<&Structural>, value: &Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut set = Map::new();
            for (name, child) in fields {
                let child_schema =
                    schema.and_then(|s| s.property(name).or_else(|| s.map_values()));
                set.insert(
                    format!("f:{name}"),
                    extract_field_set(child_schema, child),
                );
            }
            Value::Object(set)
        }
        Value::Array(items) => {
            let keyed = schema
                .map(|s| s.list_type() == ListType::Map && !s.extensions.list_map_keys.is_empty())
                .unwrap_or(false);
            if !keyed {
                return Value::Object(Map::new());
            }
            let schema = schema.unwrap();
            let keys = &schema.extensions.list_map_keys;
            let item_schema = schema.items.as_deref();
            let mut set = Map::new();
            for item in items {
                let mut key_object = Map::new();
                for key in keys {
                    key_object.insert(key.clone(), item.get(key).cloned().unwrap_or(Value::Null));
                }
                let rendered = serde_json::to_string(&Value::Object(key_object))
                    .unwrap_or_default();
                set.insert(format!("k:{rendered}"), extract_field_set(item_schema, item));
            }
            Value::Object(set)
        }
        _ => Value::Object(Map::new()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldConflict {
    pub manager: String,
    pub path: String,
}

/// fields the incoming apply would change while another manager owns them
pub fn field_conflicts(
    applied_set: &Value,
    applied_doc: &Value,
    live_doc: &Value,
    owner: &str,
    owned_set: &Value,
) -> Vec<FieldConflict> {
    let mut conflicts = vec![];
    walk_conflicts(
        applied_set,
        Some(applied_doc),
        Some(live_doc),
        owner,
        owned_set,
        String::new(),
        &mut conflicts,
    );
    conflicts
}

fn walk_conflicts(
    applied_set: &Value,
    applied_doc: Option<&Value>,
    live_doc: Option<&Value>,
    owner: &str,
    owned_set: &Value,
    path: String,
    conflicts: &mut Vec<FieldConflict>,
) {
    let (Some(applied_fields), Some(owned_fields)) =
        (applied_set.as_object(), owned_set.as_object())
    else {
        return;
    };
    for (segment, applied_child) in applied_fields {
        let Some(owned_child) = owned_fields.get(segment) else {
            continue;
        };
        let child_path = render_path(&path, segment);
        let applied_value = applied_doc.and_then(|doc| lookup(doc, segment));
        let live_value = live_doc.and_then(|doc| lookup(doc, segment));

        let applied_leaf = applied_child.as_object().map(Map::is_empty).unwrap_or(true);
        let owned_leaf = owned_child.as_object().map(Map::is_empty).unwrap_or(true);
        if applied_leaf || owned_leaf {
            // ownership meets here; same value means shared ownership,
            // a differing value is a conflict
            if applied_value != live_value {
                conflicts.push(FieldConflict {
                    manager: owner.to_owned(),
                    path: child_path,
                });
            }
            continue;
        }
        walk_conflicts(
            applied_child,
            applied_value,
            live_value,
            owner,
            owned_child,
            child_path,
            conflicts,
        );
    }
}

/// remove fields the manager owned before but no longer applies
pub fn remove_abandoned_fields(old_set: &Value, new_set: &Value, doc: &mut Value) {
    let (Some(old_fields), new_fields) = (old_set.as_object(), new_set.as_object()) else {
        return;
    };
    let empty = Map::new();
    let new_fields = new_fields.unwrap_or(&empty);
    for (segment, old_child) in old_fields {
        match new_fields.get(segment) {
            None => remove_segment(doc, segment),
            Some(new_child) => {
                let leaf = old_child.as_object().map(Map::is_empty).unwrap_or(true);
                if !leaf {
                    if let Some(target) = lookup_mut(doc, segment) {
                        remove_abandoned_fields(old_child, new_child, target);
                    }
                }
            }
        }
    }
}

fn render_path(parent: &str, segment: &str) -> String {
    if let Some(name) = segment.strip_prefix("f:") {
        if parent.is_empty() {
            name.to_owned()
        } else {
            format!("{parent}.{name}")
        }
    } else if let Some(key) = segment.strip_prefix("k:") {
        format!("{parent}[{key}]")
    } else {
        format!("{parent}.{segment}")
    }
}

fn lookup<'a>(doc: &'a Value, segment: &str) -> Option<&'a Value> {
    if let Some(name) = segment.strip_prefix("f:") {
        doc.get(name)
    } else if let Some(key) = segment.strip_prefix("k:") {
        let key: Map<String, Value> = serde_json::from_str(key).ok()?;
        doc.as_array()?
            .iter()
            .find(|item| key.iter().all(|(k, v)| item.get(k) == Some(v)))
    } else {
        None
    }
}

fn lookup_mut<'a>(doc: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    if let Some(name) = segment.strip_prefix("f:") {
        doc.get_mut(name)
    } else if let Some(key) = segment.strip_prefix("k:") {
        let key: Map<String, Value> = serde_json::from_str(key).ok()?;
        doc.as_array_mut()?
            .iter_mut()
            .find(|item| key.iter().all(|(k, v)| item.get(k) == Some(v)))
    } else {
        None
    }
}

fn remove_segment(doc: &mut Value, segment: &str) {
    if let Some(name) = segment.strip_prefix("f:") {
        if let Some(fields) = doc.as_object_mut() {
            fields.remove(name);
        }
    } else if let Some(key) = segment.strip_prefix("k:") {
        if let Ok(key) = serde_json::from_str::<Map<String, Value>>(key) {
            if let Some(items) = doc.as_array_mut() {
                items.retain(|item| !key.iter().all(|(k, v)| item.get(k) == Some(v)));
            }
        }
    }
}
