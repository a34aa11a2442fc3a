//! unknown field pruning: a post-order walk that removes object fields
//! not declared by the schema, honoring the preserve-unknown-fields and
//! embedded-resource escapes.

use serde_json::Value;

use crate::metaschema;
use crate::structural::AdditionalProperties;
use crate::structural::Structural;

/// fields an embedded resource keeps even when its schema says nothing
const EMBEDDED_ENVELOPE: [&str; 3] = ["apiVersion", "kind", "metadata"];

pub fn prune(schema: &Structural, instance: &mut Value) {
    prune_node(Some(schema), instance, false);
}

fn prune_node(schema: Option<&Structural>, instance: &mut Value, preserved: bool) {
    let preserve_here = preserved
        || schema
            .map(|s| s.extensions.preserve_unknown_fields)
            .unwrap_or(false);

    match instance {
        Value::Object(fields) => {
            let embedded = schema.map(|s| s.extensions.embedded_resource).unwrap_or(false);
            if embedded {
                if let Some(metadata) = fields.get_mut("metadata") {
                    prune_node(Some(metaschema::metadata_schema()), metadata, false);
                }
            }

            let mut to_remove = vec![];
            for (name, child_value) in fields.iter_mut() {
                if embedded && EMBEDDED_ENVELOPE.contains(&name.as_str()) {
                    // metadata was already pruned by the fixed schema above
                    continue;
                }
                let child_schema = schema.and_then(|s| {
                    s.property(name).or_else(|| s.map_values())
                });
                match child_schema {
                    Some(child) => prune_node(Some(child), child_value, preserve_here),
                    None => {
                        let allowed = preserve_here
                            || schema
                                .map(|s| {
                                    matches!(
                                        s.additional_properties,
                                        Some(AdditionalProperties::Allowed)
                                    )
                                })
                                .unwrap_or(false);
                        if allowed {
                            prune_node(None, child_value, true);
                        } else {
                            to_remove.push(name.clone());
                        }
                    }
                }
            }
            for name in to_remove {
                fields.remove(&name);
            }
        }
        Value::Array(items) => {
            let item_schema = schema.and_then(|s| s.items.as_deref());
            for item in items {
                prune_node(item_schema, item, preserve_here);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod test {

    use serde_json::json;

    use super::prune;
    use crate::structural::Structural;

    fn schema(doc: serde_json::Value) -> Structural {
        Structural::parse(&doc).expect("schema").schema
    }

    #[test]
    fn test_unknown_fields_removed() {
        let schema = schema(json!({
            "type": "object",
            "properties": {
                "spec": {
                    "type": "object",
                    "properties": { "replicas": { "type": "integer" } }
                }
            }
        }));
        let mut instance = json!({
            "spec": { "replicas": 2, "unknown": true },
            "stray": "x"
        });
        prune(&schema, &mut instance);
        assert_eq!(instance, json!({ "spec": { "replicas": 2 } }));
    }

    #[test]
    fn test_preserve_unknown_subtree() {
        let schema = schema(json!({
            "type": "object",
            "properties": {
                "config": {
                    "type": "object",
                    "x-kubernetes-preserve-unknown-fields": true
                }
            }
        }));
        let mut instance = json!({ "config": { "anything": { "nested": 1 } } });
        let expected = instance.clone();
        prune(&schema, &mut instance);
        assert_eq!(instance, expected);
    }

    #[test]
    fn test_embedded_resource_envelope_kept() {
        let schema = schema(json!({
            "type": "object",
            "properties": {
                "template": {
                    "type": "object",
                    "x-kubernetes-embedded-resource": true,
                    "x-kubernetes-preserve-unknown-fields": true
                }
            }
        }));
        let mut instance = json!({
            "template": {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": { "name": "p", "bogus": 1 },
                "spec": { "whatever": true }
            }
        });
        prune(&schema, &mut instance);
        assert_eq!(instance.pointer("/template/apiVersion").unwrap(), "v1");
        assert_eq!(instance.pointer("/template/metadata/name").unwrap(), "p");
        assert!(instance.pointer("/template/metadata/bogus").is_none());
        assert!(instance.pointer("/template/spec").is_some());
    }

    #[test]
    fn test_pruning_idempotent() {
        let schema = schema(json!({
            "type": "object",
            "properties": {
                "spec": {
                    "type": "object",
                    "properties": { "a": { "type": "string" } }
                }
            }
        }));
        let mut instance = json!({ "spec": { "a": "x", "b": "y" }, "junk": [] });
        prune(&schema, &mut instance);
        let once = instance.clone();
        prune(&schema, &mut instance);
        assert_eq!(instance, once);
    }

    #[test]
    fn test_map_values_kept() {
        let schema = schema(json!({
            "type": "object",
            "properties": {
                "labels": {
                    "type": "object",
                    "additionalProperties": { "type": "string" }
                }
            }
        }));
        let mut instance = json!({ "labels": { "a": "1", "b": "2" } });
        let expected = instance.clone();
        prune(&schema, &mut instance);
        assert_eq!(instance, expected);
    }
}
