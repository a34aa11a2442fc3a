//!
//! # Instance validation
//!
//! Walks an instance against a structural schema and accumulates every
//! failure; nothing stops at the first error. The failure set is a pure
//! function of the schema and the instance.
//!
use serde_json::Value;

use apix_types::Cause;

use crate::format::check_format;
use crate::path::FieldPath;
use crate::structural::AdditionalProperties;
use crate::structural::ListType;
use crate::structural::SchemaType;
use crate::structural::Structural;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Required,
    Invalid,
    TooLong,
    TooShort,
    TooMany,
    TooFew,
    Duplicate,
    NotSupported,
    Forbidden,
    TypeInvalid,
}

impl FailureKind {
    pub fn cause_reason(&self) -> &'static str {
        match self {
            Self::Required => "FieldValueRequired",
            Self::Invalid => "FieldValueInvalid",
            Self::TooLong => "FieldValueTooLong",
            Self::TooShort => "FieldValueInvalid",
            Self::TooMany => "FieldValueTooMany",
            Self::TooFew => "FieldValueInvalid",
            Self::Duplicate => "FieldValueDuplicate",
            Self::NotSupported => "FieldValueNotSupported",
            Self::Forbidden => "FieldValueForbidden",
            Self::TypeInvalid => "FieldValueTypeInvalid",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    pub path: FieldPath,
    pub kind: FailureKind,
    pub detail: String,
}

impl ValidationFailure {
    pub fn new(path: FieldPath, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            path,
            kind,
            detail: detail.into(),
        }
    }

    pub fn to_cause(&self) -> Cause {
        Cause::new(
            self.kind.cause_reason(),
            self.detail.clone(),
            self.path.to_string(),
        )
    }
}

pub fn validate(schema: &Structural, instance: &Value) -> Vec<ValidationFailure> {
    let mut failures = vec![];
    validate_node(schema, instance, &FieldPath::root(), &mut failures);
    failures
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn validate_node(
    schema: &Structural,
    value: &Value,
    path: &FieldPath,
    failures: &mut Vec<ValidationFailure>,
) {
    if value.is_null() {
        if !schema.nullable && schema.schema_type.is_some() {
            failures.push(ValidationFailure::new(
                path.clone(),
                FailureKind::TypeInvalid,
                "must not be null",
            ));
        }
        return;
    }

    if !check_type(schema, value, path, failures) {
        // a mistyped subtree produces no further noise
        return;
    }

    if let (Some(format), Value::String(text)) = (&schema.validation.format, value) {
        if let Some(detail) = check_format(format, text) {
            failures.push(ValidationFailure::new(
                path.clone(),
                FailureKind::Invalid,
                detail,
            ));
        }
    }

    check_constraints(schema, value, path, failures);

    if !schema.validation.enum_values.is_empty()
        && !schema.validation.enum_values.contains(value)
    {
        let supported: Vec<String> = schema
            .validation
            .enum_values
            .iter()
            .map(|v| v.to_string())
            .collect();
        failures.push(ValidationFailure::new(
            path.clone(),
            FailureKind::NotSupported,
            format!("supported values: {}", supported.join(", ")),
        ));
    }

    match value {
        Value::Object(fields) => validate_object(schema, fields, path, failures),
        Value::Array(items) => validate_array(schema, items, path, failures),
        _ => {}
    }
}

/// returns false when the declared and observed types disagree
fn check_type(
    schema: &Structural,
    value: &Value,
    path: &FieldPath,
    failures: &mut Vec<ValidationFailure>,
) -> bool {
    if schema.extensions.int_or_string {
        let ok = value.is_string() || value.is_i64() || value.is_u64();
        if !ok {
            failures.push(ValidationFailure::new(
                path.clone(),
                FailureKind::TypeInvalid,
                format!("must be an integer or a string, found {}", value_type_name(value)),
            ));
        }
        return ok;
    }

    let Some(declared) = schema.schema_type else {
        return true;
    };

    let ok = match declared {
        SchemaType::Object => value.is_object(),
        SchemaType::Array => value.is_array(),
        SchemaType::String => value.is_string(),
        SchemaType::Integer => value.is_i64() || value.is_u64(),
        SchemaType::Number => value.is_number(),
        SchemaType::Boolean => value.is_boolean(),
    };
    if !ok {
        failures.push(ValidationFailure::new(
            path.clone(),
            FailureKind::TypeInvalid,
            format!(
                "must be of type {}, found {}",
                declared.name(),
                value_type_name(value)
            ),
        ));
    }
    ok
}

fn check_constraints(
    schema: &Structural,
    value: &Value,
    path: &FieldPath,
    failures: &mut Vec<ValidationFailure>,
) {
    let validation = &schema.validation;

    if let Some(number) = value.as_f64() {
        if let Some(max) = validation.maximum {
            let over = if validation.exclusive_maximum {
                number >= max
            } else {
                number > max
            };
            if over {
                failures.push(ValidationFailure::new(
                    path.clone(),
                    FailureKind::Invalid,
                    format!("must be less than or equal to {max}"),
                ));
            }
        }
        if let Some(min) = validation.minimum {
            let under = if validation.exclusive_minimum {
                number <= min
            } else {
                number < min
            };
            if under {
                failures.push(ValidationFailure::new(
                    path.clone(),
                    FailureKind::Invalid,
                    format!("must be greater than or equal to {min}"),
                ));
            }
        }
        if let Some(multiple) = validation.multiple_of {
            if multiple != 0.0 {
                let ratio = number / multiple;
                if (ratio - ratio.round()).abs() > 1e-9 {
                    failures.push(ValidationFailure::new(
                        path.clone(),
                        FailureKind::Invalid,
                        format!("must be a multiple of {multiple}"),
                    ));
                }
            }
        }
    }

    if let Value::String(text) = value {
        let length = text.chars().count() as u64;
        if let Some(max) = validation.max_length {
            if length > max {
                failures.push(ValidationFailure::new(
                    path.clone(),
                    FailureKind::TooLong,
                    format!("may not be longer than {max} characters"),
                ));
            }
        }
        if let Some(min) = validation.min_length {
            if length < min {
                failures.push(ValidationFailure::new(
                    path.clone(),
                    FailureKind::TooShort,
                    format!("may not be shorter than {min} characters"),
                ));
            }
        }
        if let Some(pattern) = &validation.pattern {
            if !pattern.is_match(text) {
                failures.push(ValidationFailure::new(
                    path.clone(),
                    FailureKind::Invalid,
                    format!("must match pattern {}", pattern.as_str()),
                ));
            }
        }
    }
}

fn validate_object(
    schema: &Structural,
    fields: &serde_json::Map<String, Value>,
    path: &FieldPath,
    failures: &mut Vec<ValidationFailure>,
) {
    for required in &schema.validation.required {
        if !fields.contains_key(required) {
            failures.push(ValidationFailure::new(
                path.child(required),
                FailureKind::Required,
                "required value",
            ));
        }
    }

    let count = fields.len() as u64;
    if let Some(max) = schema.validation.max_properties {
        if count > max {
            failures.push(ValidationFailure::new(
                path.clone(),
                FailureKind::TooMany,
                format!("may not have more than {max} properties"),
            ));
        }
    }
    if let Some(min) = schema.validation.min_properties {
        if count < min {
            failures.push(ValidationFailure::new(
                path.clone(),
                FailureKind::TooFew,
                format!("may not have fewer than {min} properties"),
            ));
        }
    }

    for (name, child_value) in fields {
        let child_path = path.child(name);
        if let Some(child_schema) = schema.property(name) {
            validate_node(child_schema, child_value, &child_path, failures);
        } else if let Some(value_schema) = schema.map_values() {
            validate_node(value_schema, child_value, &child_path, failures);
        } else if schema.extensions.preserve_unknown_fields
            || matches!(schema.additional_properties, Some(AdditionalProperties::Allowed))
            || schema.extensions.embedded_resource
            || schema.schema_type.is_none()
        {
            // untyped escape hatch: accepted without descent
        } else if !schema.properties.is_empty() {
            failures.push(ValidationFailure::new(
                child_path,
                FailureKind::Forbidden,
                "field is not declared in the schema",
            ));
        }
    }
}

fn validate_array(
    schema: &Structural,
    items: &[Value],
    path: &FieldPath,
    failures: &mut Vec<ValidationFailure>,
) {
    let count = items.len() as u64;
    if let Some(max) = schema.validation.max_items {
        if count > max {
            failures.push(ValidationFailure::new(
                path.clone(),
                FailureKind::TooMany,
                format!("may not have more than {max} items"),
            ));
        }
    }
    if let Some(min) = schema.validation.min_items {
        if count < min {
            failures.push(ValidationFailure::new(
                path.clone(),
                FailureKind::TooFew,
                format!("may not have fewer than {min} items"),
            ));
        }
    }

    let unique = schema.validation.unique_items || schema.list_type() == ListType::Set;
    if unique {
        for (idx, item) in items.iter().enumerate() {
            if items[..idx].contains(item) {
                failures.push(ValidationFailure::new(
                    path.index(idx),
                    FailureKind::Duplicate,
                    "duplicate entries are not allowed in a set",
                ));
            }
        }
    }

    if schema.list_type() == ListType::Map && !schema.extensions.list_map_keys.is_empty() {
        let keys = &schema.extensions.list_map_keys;
        let mut seen: Vec<Vec<Option<&Value>>> = vec![];
        for (idx, item) in items.iter().enumerate() {
            let key: Vec<Option<&Value>> = keys.iter().map(|k| item.get(k)).collect();
            if seen.contains(&key) {
                failures.push(ValidationFailure::new(
                    path.index(idx),
                    FailureKind::Duplicate,
                    format!("duplicate map key ({})", keys.join(",")),
                ));
            }
            seen.push(key);
        }
    }

    if let Some(item_schema) = &schema.items {
        for (idx, item) in items.iter().enumerate() {
            validate_node(item_schema, item, &path.index(idx), failures);
        }
    }
}

#[cfg(test)]
mod test {

    use serde_json::json;

    use super::*;
    use crate::structural::Structural;

    fn schema(doc: serde_json::Value) -> Structural {
        let parsed = Structural::parse(&doc).expect("schema");
        assert!(parsed.is_structural(), "{:?}", parsed.violations);
        parsed.schema
    }

    #[test]
    fn test_type_and_bounds() {
        let schema = schema(json!({
            "type": "object",
            "properties": {
                "replicas": { "type": "integer", "minimum": 0, "maximum": 10 },
                "name": { "type": "string", "maxLength": 5 }
            },
            "required": ["replicas"]
        }));

        let failures = validate(&schema, &json!({ "replicas": -1, "name": "toolong" }));
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].path.to_string(), "replicas");
        assert_eq!(failures[0].kind, FailureKind::Invalid);
        assert_eq!(failures[1].kind, FailureKind::TooLong);

        let failures = validate(&schema, &json!({ "name": "ok" }));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::Required);
        assert_eq!(failures[0].path.to_string(), "replicas");
    }

    #[test]
    fn test_type_mismatch_stops_descent() {
        let schema = schema(json!({
            "type": "object",
            "properties": {
                "spec": {
                    "type": "object",
                    "properties": { "a": { "type": "string" } },
                    "required": ["a"]
                }
            }
        }));
        let failures = validate(&schema, &json!({ "spec": [1, 2] }));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::TypeInvalid);
    }

    #[test]
    fn test_set_uniqueness() {
        let schema = schema(json!({
            "type": "array",
            "items": { "type": "string" },
            "x-kubernetes-list-type": "set"
        }));
        let failures = validate(&schema, &json!(["a", "b", "a"]));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::Duplicate);
        assert_eq!(failures[0].path.to_string(), "[2]");
    }

    #[test]
    fn test_list_map_key_uniqueness() {
        let schema = schema(json!({
            "type": "array",
            "items": {
                "type": "object",
                "properties": { "name": { "type": "string" }, "value": { "type": "string" } }
            },
            "x-kubernetes-list-type": "map",
            "x-kubernetes-list-map-keys": ["name"]
        }));
        let failures = validate(
            &schema,
            &json!([ { "name": "a", "value": "1" }, { "name": "a", "value": "2" } ]),
        );
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::Duplicate);
    }

    #[test]
    fn test_unknown_field_rejected_without_escape() {
        let schema = schema(json!({
            "type": "object",
            "properties": { "known": { "type": "string" } }
        }));
        let failures = validate(&schema, &json!({ "known": "x", "other": 1 }));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::Forbidden);
        assert_eq!(failures[0].path.to_string(), "other");
    }

    #[test]
    fn test_preserve_unknown_allows_extra() {
        let schema = schema(json!({
            "type": "object",
            "properties": { "known": { "type": "string" } },
            "x-kubernetes-preserve-unknown-fields": true
        }));
        let failures = validate(&schema, &json!({ "known": "x", "other": 1 }));
        assert!(failures.is_empty());
    }

    #[test]
    fn test_int_or_string() {
        let schema = schema(json!({
            "type": "object",
            "properties": { "port": { "x-kubernetes-int-or-string": true } }
        }));
        assert!(validate(&schema, &json!({ "port": 80 })).is_empty());
        assert!(validate(&schema, &json!({ "port": "http" })).is_empty());
        assert_eq!(validate(&schema, &json!({ "port": true })).len(), 1);
    }

    #[test]
    fn test_failures_independent_of_key_order() {
        let schema = schema(json!({
            "type": "object",
            "properties": {
                "a": { "type": "integer", "minimum": 0 },
                "b": { "type": "string", "maxLength": 1 }
            }
        }));
        let one: serde_json::Value =
            serde_json::from_str(r#"{ "a": -1, "b": "xx" }"#).unwrap();
        let two: serde_json::Value =
            serde_json::from_str(r#"{ "b": "xx", "a": -1 }"#).unwrap();
        let mut f1 = validate(&schema, &one);
        let mut f2 = validate(&schema, &two);
        let key = |f: &ValidationFailure| (f.path.to_string(), f.detail.clone());
        f1.sort_by_key(key);
        f2.sort_by_key(key);
        assert_eq!(f1, f2);
    }

    #[test]
    fn test_enum_membership() {
        let schema = schema(json!({
            "type": "string",
            "enum": ["Always", "Never"]
        }));
        assert!(validate(&schema, &json!("Always")).is_empty());
        let failures = validate(&schema, &json!("Sometimes"));
        assert_eq!(failures[0].kind, FailureKind::NotSupported);
    }
}
