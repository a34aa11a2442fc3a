use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use apix_schema::ListType;
use apix_schema::Structural;

use crate::PatchError;

/// RFC 7386 merge patch: objects merge recursively, null deletes, anything
/// else replaces
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    let fields = target.as_object_mut().unwrap();
    for (name, patch_value) in patch_fields {
        if patch_value.is_null() {
            fields.remove(name);
        } else {
            let entry = fields.entry(name.clone()).or_insert(Value::Null);
            apply_merge_patch(entry, patch_value);
        }
    }
}

/// one RFC 6902 operation
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "lowercase", tag = "op")]
pub enum PatchOperation {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

pub fn apply_json_patch(target: &mut Value, operations: &[PatchOperation]) -> Result<(), PatchError> {
    for operation in operations {
        match operation {
            PatchOperation::Add { path, value } => insert(target, path, value.clone(), true)?,
            PatchOperation::Remove { path } => {
                remove(target, path)?;
            }
            PatchOperation::Replace { path, value } => {
                if target.pointer(path).is_none() {
                    return Err(PatchError::BadPointer(path.clone()));
                }
                insert(target, path, value.clone(), false)?;
            }
            PatchOperation::Move { from, path } => {
                let value = remove(target, from)?;
                insert(target, path, value, true)?;
            }
            PatchOperation::Copy { from, path } => {
                let value = target
                    .pointer(from)
                    .cloned()
                    .ok_or_else(|| PatchError::BadPointer(from.clone()))?;
                insert(target, path, value, true)?;
            }
            PatchOperation::Test { path, value } => {
                let found = target
                    .pointer(path)
                    .ok_or_else(|| PatchError::BadPointer(path.clone()))?;
                if found != value {
                    return Err(PatchError::TestFailed(path.clone()));
                }
            }
        }
    }
    Ok(())
}

fn split_pointer(pointer: &str) -> Result<(String, String), PatchError> {
    if !pointer.starts_with('/') {
        return Err(PatchError::bad(format!(
            "pointer \"{pointer}\" must start with '/'"
        )));
    }
    match pointer.rsplit_once('/') {
        Some((parent, token)) => Ok((parent.to_owned(), unescape(token))),
        None => Err(PatchError::BadPointer(pointer.to_owned())),
    }
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn insert(target: &mut Value, pointer: &str, value: Value, add: bool) -> Result<(), PatchError> {
    let (parent_pointer, token) = split_pointer(pointer)?;
    let parent = target
        .pointer_mut(&parent_pointer)
        .ok_or_else(|| PatchError::BadPointer(pointer.to_owned()))?;
    match parent {
        Value::Object(fields) => {
            fields.insert(token, value);
            Ok(())
        }
        Value::Array(items) => {
            if token == "-" {
                items.push(value);
                return Ok(());
            }
            let index: usize = token
                .parse()
                .map_err(|_| PatchError::BadPointer(pointer.to_owned()))?;
            if add {
                if index > items.len() {
                    return Err(PatchError::BadPointer(pointer.to_owned()));
                }
                items.insert(index, value);
            } else {
                let slot = items
                    .get_mut(index)
                    .ok_or_else(|| PatchError::BadPointer(pointer.to_owned()))?;
                *slot = value;
            }
            Ok(())
        }
        _ => Err(PatchError::BadPointer(pointer.to_owned())),
    }
}

fn remove(target: &mut Value, pointer: &str) -> Result<Value, PatchError> {
    let (parent_pointer, token) = split_pointer(pointer)?;
    let parent = target
        .pointer_mut(&parent_pointer)
        .ok_or_else(|| PatchError::BadPointer(pointer.to_owned()))?;
    match parent {
        Value::Object(fields) => fields
            .remove(&token)
            .ok_or_else(|| PatchError::BadPointer(pointer.to_owned())),
        Value::Array(items) => {
            let index: usize = token
                .parse()
                .map_err(|_| PatchError::BadPointer(pointer.to_owned()))?;
            if index >= items.len() {
                return Err(PatchError::BadPointer(pointer.to_owned()));
            }
            Ok(items.remove(index))
        }
        _ => Err(PatchError::BadPointer(pointer.to_owned())),
    }
}

/// strategic merge: object fields merge recursively, null deletes, and
/// arrays follow the schema's list-type hint. Without a schema the merge
/// degrades to the plain merge-patch semantics.
pub fn strategic_merge(schema: Option<&Structural>, target: &mut Value, patch: &Value) {
    let Value::Object(patch_fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    let fields = target.as_object_mut().unwrap();
    for (name, patch_value) in patch_fields {
        if patch_value.is_null() {
            fields.remove(name);
            continue;
        }
        let child_schema = schema.and_then(|s| s.property(name).or_else(|| s.map_values()));
        let entry = fields.entry(name.clone()).or_insert(Value::Null);
        merge_value(child_schema, entry, patch_value);
    }
}

fn merge_value(schema: Option<&Structural>, target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(_) => strategic_merge(schema, target, patch),
        Value::Array(patch_items) => {
            let list_type = schema.map(|s| s.list_type()).unwrap_or(ListType::Atomic);
            match list_type {
                ListType::Atomic => *target = patch.clone(),
                ListType::Set => {
                    let Some(items) = target.as_array_mut() else {
                        *target = patch.clone();
                        return;
                    };
                    for patch_item in patch_items {
                        if !items.contains(patch_item) {
                            items.push(patch_item.clone());
                        }
                    }
                }
                ListType::Map => {
                    let keys = schema
                        .map(|s| s.extensions.list_map_keys.clone())
                        .unwrap_or_default();
                    let item_schema = schema.and_then(|s| s.items.as_deref());
                    let Some(items) = target.as_array_mut() else {
                        *target = patch.clone();
                        return;
                    };
                    for patch_item in patch_items {
                        let key: Vec<Option<&Value>> =
                            keys.iter().map(|k| patch_item.get(k)).collect();
                        let existing = items.iter_mut().find(|item| {
                            keys.iter().map(|k| item.get(k)).collect::<Vec<_>>() == key
                        });
                        match existing {
                            Some(item) => merge_value(item_schema, item, patch_item),
                            None => items.push(patch_item.clone()),
                        }
                    }
                }
            }
        }
        _ => *target = patch.clone(),
    }
}
