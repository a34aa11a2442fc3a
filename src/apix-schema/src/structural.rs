//!
//! # Structural schema model
//!
//! Canonical, fully typed representation of a definition version's schema
//! document. Construction walks the raw document depth first, building the
//! best effort tree and collecting every structural violation anchored by
//! a JSON pointer; a schema with no violations is structural.
//!
use std::collections::BTreeMap;

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("schema document must be an object, found {0}")]
    NotAnObject(String),
}

/// a structural rule violation, anchored inside the schema document
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub pointer: String,
    pub message: String,
}

impl Violation {
    fn new(pointer: &str, message: impl Into<String>) -> Self {
        Self {
            pointer: pointer.to_owned(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.pointer.is_empty() {
            write!(f, "root: {}", self.message)
        } else {
            write!(f, "{}: {}", self.pointer, self.message)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaType {
    Object,
    Array,
    String,
    Integer,
    Number,
    Boolean,
}

impl SchemaType {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            "string" => Some(Self::String),
            "integer" => Some(Self::Integer),
            "number" => Some(Self::Number),
            "boolean" => Some(Self::Boolean),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListType {
    Atomic,
    Set,
    Map,
}

/// per array/map/object Kubernetes extensions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extensions {
    pub preserve_unknown_fields: bool,
    pub embedded_resource: bool,
    pub int_or_string: bool,
    pub list_type: Option<ListType>,
    pub list_map_keys: Vec<String>,
}

/// a custom expression rule attached to a schema node
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationRule {
    pub rule: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_expression: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub field_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub optional_old_self: bool,
}

/// value constraints checked by the validator
#[derive(Debug, Clone, Default)]
pub struct ValueValidation {
    pub format: Option<String>,
    pub maximum: Option<f64>,
    pub exclusive_maximum: bool,
    pub minimum: Option<f64>,
    pub exclusive_minimum: bool,
    pub multiple_of: Option<f64>,
    pub max_length: Option<u64>,
    pub min_length: Option<u64>,
    pub pattern: Option<Regex>,
    pub max_items: Option<u64>,
    pub min_items: Option<u64>,
    pub unique_items: bool,
    pub max_properties: Option<u64>,
    pub min_properties: Option<u64>,
    pub required: Vec<String>,
    pub enum_values: Vec<Value>,
}

#[derive(Debug, Clone)]
pub enum AdditionalProperties {
    /// `additionalProperties: true`
    Allowed,
    /// map shape with a value schema
    Schema(Box<Structural>),
}

#[derive(Debug, Clone, Default)]
pub struct Structural {
    pub schema_type: Option<SchemaType>,
    pub nullable: bool,
    pub properties: BTreeMap<String, Structural>,
    pub additional_properties: Option<AdditionalProperties>,
    pub items: Option<Box<Structural>>,
    pub validation: ValueValidation,
    pub extensions: Extensions,
    pub default: Option<Value>,
    pub rules: Vec<ValidationRule>,
}

/// construction result: the tree plus the violation list. An empty list
/// means the schema is structural.
#[derive(Debug, Clone)]
pub struct ParsedSchema {
    pub schema: Structural,
    pub violations: Vec<Violation>,
}

impl ParsedSchema {
    pub fn is_structural(&self) -> bool {
        self.violations.is_empty()
    }
}

impl Structural {
    pub fn parse(document: &Value) -> Result<ParsedSchema, SchemaError> {
        let map = document
            .as_object()
            .ok_or_else(|| SchemaError::NotAnObject(type_name(document).to_owned()))?;
        let mut violations = vec![];
        let schema = parse_node(map, "", &mut violations);
        Ok(ParsedSchema { schema, violations })
    }

    pub fn is_object(&self) -> bool {
        self.schema_type == Some(SchemaType::Object)
    }

    pub fn is_array(&self) -> bool {
        self.schema_type == Some(SchemaType::Array)
    }

    /// map shape: object with a value schema for arbitrary keys
    pub fn map_values(&self) -> Option<&Structural> {
        match &self.additional_properties {
            Some(AdditionalProperties::Schema(schema)) => Some(schema),
            _ => None,
        }
    }

    pub fn property(&self, name: &str) -> Option<&Structural> {
        self.properties.get(name)
    }

    pub fn list_type(&self) -> ListType {
        self.extensions.list_type.unwrap_or(ListType::Atomic)
    }

    /// navigate by instance field path segments ("spec", "replicas");
    /// arrays are traversed through their single item schema
    pub fn at_path<'a, I>(&self, segments: I) -> Option<&Structural>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut current = self;
        for segment in segments {
            current = if let Some(items) = &current.items {
                // stepping through an array position
                if segment.chars().all(|c| c.is_ascii_digit()) {
                    items
                } else {
                    return None;
                }
            } else if let Some(child) = current.property(segment) {
                child
            } else if let Some(values) = current.map_values() {
                values
            } else {
                return None;
            };
        }
        Some(current)
    }
}

fn type_name(value: &Value) -> &'static str {
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

fn bool_field(map: &serde_json::Map<String, Value>, key: &str) -> bool {
    map.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn f64_field(map: &serde_json::Map<String, Value>, key: &str) -> Option<f64> {
    map.get(key).and_then(Value::as_f64)
}

fn u64_field(map: &serde_json::Map<String, Value>, key: &str) -> Option<u64> {
    map.get(key).and_then(Value::as_u64)
}

const POLYMORPHIC_KEYS: [&str; 4] = ["oneOf", "anyOf", "allOf", "not"];
const REFERENCE_KEYS: [&str; 2] = ["$ref", "definitions"];

fn parse_node(
    map: &serde_json::Map<String, Value>,
    pointer: &str,
    violations: &mut Vec<Violation>,
) -> Structural {
    let mut node = Structural::default();

    for key in POLYMORPHIC_KEYS {
        if map.contains_key(key) {
            violations.push(Violation::new(
                pointer,
                format!("{key} is not allowed at a structural position"),
            ));
        }
    }
    for key in REFERENCE_KEYS {
        if map.contains_key(key) {
            violations.push(Violation::new(
                pointer,
                format!("{key} is not supported; all type information must be local"),
            ));
        }
    }

    node.nullable = bool_field(map, "nullable");
    node.extensions.preserve_unknown_fields =
        bool_field(map, "x-kubernetes-preserve-unknown-fields");
    node.extensions.embedded_resource = bool_field(map, "x-kubernetes-embedded-resource");
    node.extensions.int_or_string = bool_field(map, "x-kubernetes-int-or-string");

    match map.get("type") {
        Some(Value::String(name)) => match SchemaType::parse(name) {
            Some(schema_type) => node.schema_type = Some(schema_type),
            None => violations.push(Violation::new(pointer, format!("unknown type \"{name}\""))),
        },
        Some(other) => violations.push(Violation::new(
            pointer,
            format!("type must be a string, found {}", type_name(other)),
        )),
        None => {
            if !node.extensions.int_or_string && !node.extensions.preserve_unknown_fields {
                violations.push(Violation::new(
                    pointer,
                    "type is required at every structural position",
                ));
            }
        }
    }

    if node.extensions.int_or_string && node.schema_type.is_some() {
        violations.push(Violation::new(
            pointer,
            "x-kubernetes-int-or-string must not carry a type",
        ));
    }

    match map.get("x-kubernetes-list-type").and_then(Value::as_str) {
        Some("atomic") => node.extensions.list_type = Some(ListType::Atomic),
        Some("set") => node.extensions.list_type = Some(ListType::Set),
        Some("map") => node.extensions.list_type = Some(ListType::Map),
        Some(other) => violations.push(Violation::new(
            pointer,
            format!("unknown x-kubernetes-list-type \"{other}\""),
        )),
        None => {}
    }
    if let Some(keys) = map.get("x-kubernetes-list-map-keys").and_then(Value::as_array) {
        node.extensions.list_map_keys = keys
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect();
    }
    if node.extensions.list_type == Some(ListType::Map) && node.extensions.list_map_keys.is_empty()
    {
        violations.push(Violation::new(
            pointer,
            "x-kubernetes-list-type=map requires x-kubernetes-list-map-keys",
        ));
    }

    if let Some(properties) = map.get("properties") {
        match properties.as_object() {
            Some(props) => {
                for (name, child) in props {
                    let child_pointer = format!("{pointer}/properties/{name}");
                    match child.as_object() {
                        Some(child_map) => {
                            let parsed = parse_node(child_map, &child_pointer, violations);
                            node.properties.insert(name.clone(), parsed);
                        }
                        None => violations.push(Violation::new(
                            &child_pointer,
                            "property schema must be an object",
                        )),
                    }
                }
            }
            None => violations.push(Violation::new(pointer, "properties must be an object")),
        }
    }

    match map.get("additionalProperties") {
        Some(Value::Bool(true)) => {
            node.additional_properties = Some(AdditionalProperties::Allowed);
        }
        Some(Value::Bool(false)) => violations.push(Violation::new(
            pointer,
            "additionalProperties: false is not allowed; omit it instead",
        )),
        Some(Value::Object(child_map)) => {
            let child_pointer = format!("{pointer}/additionalProperties");
            let parsed = parse_node(child_map, &child_pointer, violations);
            node.additional_properties = Some(AdditionalProperties::Schema(Box::new(parsed)));
        }
        Some(_) => violations.push(Violation::new(
            pointer,
            "additionalProperties must be a boolean or a schema",
        )),
        None => {}
    }

    if node.additional_properties.is_some() && !node.properties.is_empty() {
        violations.push(Violation::new(
            pointer,
            "properties and additionalProperties are mutually exclusive",
        ));
    }

    match map.get("items") {
        Some(Value::Object(child_map)) => {
            let child_pointer = format!("{pointer}/items");
            let parsed = parse_node(child_map, &child_pointer, violations);
            node.items = Some(Box::new(parsed));
        }
        Some(Value::Array(_)) => violations.push(Violation::new(
            pointer,
            "items must be a single schema, not a tuple",
        )),
        Some(_) => violations.push(Violation::new(pointer, "items must be a schema")),
        None => {
            if node.schema_type == Some(SchemaType::Array) {
                violations.push(Violation::new(pointer, "array type requires items"));
            }
        }
    }

    node.default = map.get("default").cloned();

    node.validation = parse_validation(map, pointer, violations);

    if let Some(rules) = map.get("x-kubernetes-validations") {
        match serde_json::from_value::<Vec<ValidationRule>>(rules.clone()) {
            Ok(parsed) => node.rules = parsed,
            Err(err) => violations.push(Violation::new(
                pointer,
                format!("malformed x-kubernetes-validations: {err}"),
            )),
        }
    }

    node
}

fn parse_validation(
    map: &serde_json::Map<String, Value>,
    pointer: &str,
    violations: &mut Vec<Violation>,
) -> ValueValidation {
    let mut validation = ValueValidation {
        format: map.get("format").and_then(Value::as_str).map(str::to_owned),
        maximum: f64_field(map, "maximum"),
        exclusive_maximum: bool_field(map, "exclusiveMaximum"),
        minimum: f64_field(map, "minimum"),
        exclusive_minimum: bool_field(map, "exclusiveMinimum"),
        multiple_of: f64_field(map, "multipleOf"),
        max_length: u64_field(map, "maxLength"),
        min_length: u64_field(map, "minLength"),
        pattern: None,
        max_items: u64_field(map, "maxItems"),
        min_items: u64_field(map, "minItems"),
        unique_items: bool_field(map, "uniqueItems"),
        max_properties: u64_field(map, "maxProperties"),
        min_properties: u64_field(map, "minProperties"),
        required: map
            .get("required")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default(),
        enum_values: map
            .get("enum")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
    };

    if let Some(pattern) = map.get("pattern").and_then(Value::as_str) {
        match Regex::new(pattern) {
            Ok(regex) => validation.pattern = Some(regex),
            Err(err) => violations.push(Violation::new(
                pointer,
                format!("invalid pattern \"{pattern}\": {err}"),
            )),
        }
    }

    validation
}
