//! schema driven defaulting: a pre-order walk that injects declared
//! defaults for absent object properties. User supplied values are never
//! overwritten, explicit zero and empty values included.

use serde_json::Value;

use crate::structural::Structural;

pub fn apply_defaults(schema: &Structural, instance: &mut Value) {
    match instance {
        Value::Object(fields) => {
            for (name, child_schema) in &schema.properties {
                if !fields.contains_key(name) {
                    if let Some(default) = &child_schema.default {
                        fields.insert(name.clone(), default.clone());
                    }
                }
                if let Some(child_value) = fields.get_mut(name) {
                    apply_defaults(child_schema, child_value);
                }
            }
            if let Some(value_schema) = schema.map_values() {
                for child_value in fields.values_mut() {
                    apply_defaults(value_schema, child_value);
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = &schema.items {
                for item in items {
                    apply_defaults(item_schema, item);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod test {

    use serde_json::json;

    use super::apply_defaults;
    use crate::structural::Structural;

    fn schema(doc: serde_json::Value) -> Structural {
        Structural::parse(&doc).expect("schema").schema
    }

    #[test]
    fn test_defaults_injected() {
        let schema = schema(json!({
            "type": "object",
            "properties": {
                "spec": {
                    "type": "object",
                    "default": {},
                    "properties": {
                        "replicas": { "type": "integer", "default": 1 },
                        "paused": { "type": "boolean", "default": false }
                    }
                }
            }
        }));
        let mut instance = json!({});
        apply_defaults(&schema, &mut instance);
        assert_eq!(instance, json!({ "spec": { "replicas": 1, "paused": false } }));
    }

    #[test]
    fn test_defaults_do_not_overwrite() {
        let schema = schema(json!({
            "type": "object",
            "properties": {
                "replicas": { "type": "integer", "default": 1 }
            }
        }));
        let mut instance = json!({ "replicas": 0 });
        apply_defaults(&schema, &mut instance);
        assert_eq!(instance, json!({ "replicas": 0 }));
    }

    #[test]
    fn test_defaults_inside_array_items() {
        let schema = schema(json!({
            "type": "array",
            "items": {
                "type": "object",
                "properties": { "weight": { "type": "integer", "default": 10 } }
            }
        }));
        let mut instance = json!([{}, { "weight": 1 }]);
        apply_defaults(&schema, &mut instance);
        assert_eq!(instance, json!([{ "weight": 10 }, { "weight": 1 }]));
    }

    #[test]
    fn test_defaulting_idempotent() {
        let schema = schema(json!({
            "type": "object",
            "properties": {
                "spec": {
                    "type": "object",
                    "default": { "mode": "auto" },
                    "properties": { "mode": { "type": "string", "default": "auto" } }
                }
            }
        }));
        let mut once = json!({});
        apply_defaults(&schema, &mut once);
        let mut twice = once.clone();
        apply_defaults(&schema, &mut twice);
        assert_eq!(once, twice);
    }
}
