//!
//! # Fixed object metadata schema
//!
//! Object metadata has one hard coded structural form, overlaid on the
//! root of every instance and on every embedded resource position. Strict
//! metadata validation is independent of whatever the definition's schema
//! says about the `metadata` property.
//!
use std::sync::OnceLock;

use serde_json::json;
use serde_json::Value;

use apix_types::names;

use crate::path::FieldPath;
use crate::structural::Structural;
use crate::validation::FailureKind;
use crate::validation::ValidationFailure;

static METADATA_SCHEMA: OnceLock<Structural> = OnceLock::new();

/// the fixed structural form of object metadata
pub fn metadata_schema() -> &'static Structural {
    METADATA_SCHEMA.get_or_init(|| {
        let doc = json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "generateName": { "type": "string" },
                "namespace": { "type": "string" },
                "uid": { "type": "string" },
                "resourceVersion": { "type": "string" },
                "generation": { "type": "integer" },
                "creationTimestamp": { "type": "string" },
                "deletionTimestamp": { "type": "string" },
                "deletionGracePeriodSeconds": { "type": "integer" },
                "labels": { "type": "object", "additionalProperties": { "type": "string" } },
                "annotations": { "type": "object", "additionalProperties": { "type": "string" } },
                "finalizers": { "type": "array", "items": { "type": "string" } },
                "ownerReferences": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "apiVersion": { "type": "string" },
                            "kind": { "type": "string" },
                            "name": { "type": "string" },
                            "uid": { "type": "string" },
                            "controller": { "type": "boolean" },
                            "blockOwnerDeletion": { "type": "boolean" }
                        },
                        "required": ["apiVersion", "kind", "name", "uid"]
                    }
                },
                "managedFields": {
                    "type": "array",
                    "items": { "type": "object", "x-kubernetes-preserve-unknown-fields": true }
                }
            }
        });
        let parsed = Structural::parse(&doc).expect("metadata schema parses");
        debug_assert!(parsed.is_structural());
        parsed.schema
    })
}

const MAX_LABEL_LEN: usize = 63;
const MAX_ANNOTATION_BYTES: usize = 256 * 1024;

/// strict validation of the metadata subtree of an instance
pub fn validate_metadata(instance: &Value, namespaced: bool) -> Vec<ValidationFailure> {
    let mut failures = vec![];
    let path = FieldPath::field("metadata");

    let Some(metadata) = instance.get("metadata") else {
        failures.push(ValidationFailure::new(
            path,
            FailureKind::Required,
            "required value",
        ));
        return failures;
    };
    let Some(fields) = metadata.as_object() else {
        failures.push(ValidationFailure::new(
            path,
            FailureKind::TypeInvalid,
            "must be of type object",
        ));
        return failures;
    };

    let name = fields.get("name").and_then(Value::as_str).unwrap_or("");
    let generate_name = fields
        .get("generateName")
        .and_then(Value::as_str)
        .unwrap_or("");
    if name.is_empty() && generate_name.is_empty() {
        failures.push(ValidationFailure::new(
            path.child("name"),
            FailureKind::Required,
            "name or generateName is required",
        ));
    }
    if !name.is_empty() && !names::is_dns1123_subdomain(name) {
        failures.push(ValidationFailure::new(
            path.child("name"),
            FailureKind::Invalid,
            names::dns1123_subdomain_error("name", name),
        ));
    }

    match fields.get("namespace").and_then(Value::as_str) {
        Some(ns) if !ns.is_empty() => {
            if !namespaced {
                failures.push(ValidationFailure::new(
                    path.child("namespace"),
                    FailureKind::Forbidden,
                    "namespace is not allowed on cluster scoped objects",
                ));
            } else if !names::is_dns1123_label(ns) {
                failures.push(ValidationFailure::new(
                    path.child("namespace"),
                    FailureKind::Invalid,
                    names::dns1123_label_error("namespace", ns),
                ));
            }
        }
        _ => {
            if namespaced {
                failures.push(ValidationFailure::new(
                    path.child("namespace"),
                    FailureKind::Required,
                    "required value",
                ));
            }
        }
    }

    if let Some(labels) = fields.get("labels") {
        match labels.as_object() {
            Some(labels) => {
                for (key, value) in labels {
                    let label_path = path.child("labels").child(key);
                    if !is_qualified_name(key) {
                        failures.push(ValidationFailure::new(
                            label_path.clone(),
                            FailureKind::Invalid,
                            format!("invalid label key \"{key}\""),
                        ));
                    }
                    match value.as_str() {
                        Some(text) => {
                            if text.len() > MAX_LABEL_LEN {
                                failures.push(ValidationFailure::new(
                                    label_path,
                                    FailureKind::TooLong,
                                    format!("may not be longer than {MAX_LABEL_LEN} characters"),
                                ));
                            }
                        }
                        None => failures.push(ValidationFailure::new(
                            label_path,
                            FailureKind::TypeInvalid,
                            "label values must be strings",
                        )),
                    }
                }
            }
            None => failures.push(ValidationFailure::new(
                path.child("labels"),
                FailureKind::TypeInvalid,
                "must be of type object",
            )),
        }
    }

    if let Some(annotations) = fields.get("annotations").and_then(Value::as_object) {
        let total: usize = annotations
            .iter()
            .map(|(k, v)| k.len() + v.as_str().map(str::len).unwrap_or(0))
            .sum();
        if total > MAX_ANNOTATION_BYTES {
            failures.push(ValidationFailure::new(
                path.child("annotations"),
                FailureKind::TooLong,
                format!("must have at most {MAX_ANNOTATION_BYTES} bytes in total"),
            ));
        }
        for (key, value) in annotations {
            if !value.is_string() {
                failures.push(ValidationFailure::new(
                    path.child("annotations").child(key),
                    FailureKind::TypeInvalid,
                    "annotation values must be strings",
                ));
            }
        }
    }

    if let Some(finalizers) = fields.get("finalizers") {
        match finalizers.as_array() {
            Some(list) => {
                for (idx, entry) in list.iter().enumerate() {
                    if !entry.is_string() {
                        failures.push(ValidationFailure::new(
                            path.child("finalizers").index(idx),
                            FailureKind::TypeInvalid,
                            "finalizers must be strings",
                        ));
                    }
                }
            }
            None => failures.push(ValidationFailure::new(
                path.child("finalizers"),
                FailureKind::TypeInvalid,
                "must be of type array",
            )),
        }
    }

    failures
}

/// label/annotation keys: optional DNS prefix, then a short name part
fn is_qualified_name(key: &str) -> bool {
    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            if !names::is_dns1123_subdomain(prefix) {
                return false;
            }
            name
        }
        None => key,
    };
    if name.is_empty() || name.len() > MAX_LABEL_LEN {
        return false;
    }
    let bytes = name.as_bytes();
    let alnum = |c: u8| c.is_ascii_alphanumeric();
    alnum(bytes[0])
        && alnum(bytes[bytes.len() - 1])
        && bytes
            .iter()
            .all(|&c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_' || c == b'.')
}

#[cfg(test)]
mod test {

    use serde_json::json;

    use super::*;

    #[test]
    fn test_valid_metadata() {
        let instance = json!({
            "metadata": {
                "name": "widget-a",
                "namespace": "default",
                "labels": { "app": "demo", "example.com/tier": "web" }
            }
        });
        assert!(validate_metadata(&instance, true).is_empty());
    }

    #[test]
    fn test_missing_name() {
        let instance = json!({ "metadata": { "namespace": "default" } });
        let failures = validate_metadata(&instance, true);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path.to_string(), "metadata.name");
    }

    #[test]
    fn test_namespace_scope_rules() {
        let namespaced = json!({ "metadata": { "name": "a" } });
        assert_eq!(validate_metadata(&namespaced, true).len(), 1);

        let clustered = json!({ "metadata": { "name": "a", "namespace": "default" } });
        let failures = validate_metadata(&clustered, false);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::Forbidden);
    }

    #[test]
    fn test_bad_label_key() {
        let instance = json!({
            "metadata": { "name": "a", "labels": { "-bad-": "x" } }
        });
        let failures = validate_metadata(&instance, false);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::Invalid);
    }

    #[test]
    fn test_metadata_schema_is_structural() {
        assert!(metadata_schema().is_object());
    }
}
