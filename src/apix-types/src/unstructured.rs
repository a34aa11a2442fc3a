use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Value;

use crate::metadata::ListMeta;
use crate::status::Status;

/// a custom resource instance: a semi structured document whose shape is
/// only known through the definition's schema. Typed accessors cover the
/// standard metadata; everything else is reached through the raw tree.
#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(transparent)]
pub struct Unstructured(pub Value);

impl Unstructured {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    fn str_field(&self, pointer: &str) -> &str {
        self.0.pointer(pointer).and_then(Value::as_str).unwrap_or("")
    }

    pub fn api_version(&self) -> &str {
        self.str_field("/apiVersion")
    }

    pub fn kind(&self) -> &str {
        self.str_field("/kind")
    }

    pub fn name(&self) -> &str {
        self.str_field("/metadata/name")
    }

    pub fn generate_name(&self) -> &str {
        self.str_field("/metadata/generateName")
    }

    pub fn namespace(&self) -> &str {
        self.str_field("/metadata/namespace")
    }

    pub fn uid(&self) -> &str {
        self.str_field("/metadata/uid")
    }

    pub fn resource_version(&self) -> &str {
        self.str_field("/metadata/resourceVersion")
    }

    pub fn generation(&self) -> i64 {
        self.0
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    pub fn creation_timestamp(&self) -> &str {
        self.str_field("/metadata/creationTimestamp")
    }

    pub fn deletion_timestamp(&self) -> Option<&str> {
        self.0
            .pointer("/metadata/deletionTimestamp")
            .and_then(Value::as_str)
    }

    pub fn finalizers(&self) -> Vec<&str> {
        self.0
            .pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn labels(&self) -> Option<&serde_json::Map<String, Value>> {
        self.0.pointer("/metadata/labels").and_then(Value::as_object)
    }

    pub fn managed_fields(&self) -> Option<&Value> {
        self.0.pointer("/metadata/managedFields")
    }

    /// metadata object, created on demand so setters always have a target
    pub fn metadata_mut(&mut self) -> &mut serde_json::Map<String, Value> {
        if !self.0.is_object() {
            self.0 = json!({});
        }
        let root = self.0.as_object_mut().unwrap();
        let entry = root
            .entry("metadata".to_owned())
            .or_insert_with(|| json!({}));
        if !entry.is_object() {
            *entry = json!({});
        }
        entry.as_object_mut().unwrap()
    }

    pub fn set_api_version(&mut self, api_version: &str) {
        if let Some(root) = self.0.as_object_mut() {
            root.insert("apiVersion".to_owned(), json!(api_version));
        }
    }

    pub fn set_kind(&mut self, kind: &str) {
        if let Some(root) = self.0.as_object_mut() {
            root.insert("kind".to_owned(), json!(kind));
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.metadata_mut().insert("name".to_owned(), json!(name));
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.metadata_mut()
            .insert("namespace".to_owned(), json!(namespace));
    }

    pub fn set_uid(&mut self, uid: &str) {
        self.metadata_mut().insert("uid".to_owned(), json!(uid));
    }

    pub fn set_resource_version(&mut self, version: &str) {
        self.metadata_mut()
            .insert("resourceVersion".to_owned(), json!(version));
    }

    pub fn set_generation(&mut self, generation: i64) {
        self.metadata_mut()
            .insert("generation".to_owned(), json!(generation));
    }

    pub fn set_creation_timestamp(&mut self, stamp: &str) {
        self.metadata_mut()
            .insert("creationTimestamp".to_owned(), json!(stamp));
    }

    pub fn set_deletion_timestamp(&mut self, stamp: &str) {
        self.metadata_mut()
            .insert("deletionTimestamp".to_owned(), json!(stamp));
    }

    pub fn set_finalizers(&mut self, finalizers: Vec<String>) {
        self.metadata_mut()
            .insert("finalizers".to_owned(), json!(finalizers));
    }

    pub fn set_managed_fields(&mut self, fields: Value) {
        self.metadata_mut()
            .insert("managedFields".to_owned(), fields);
    }
}

impl From<Value> for Unstructured {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// list envelope for dynamic objects
#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UnstructuredList {
    pub api_version: String,
    pub kind: String,
    pub metadata: ListMeta,
    pub items: Vec<Unstructured>,
}

impl UnstructuredList {
    pub fn new(api_version: &str, list_kind: &str) -> Self {
        Self {
            api_version: api_version.to_owned(),
            kind: list_kind.to_owned(),
            metadata: ListMeta::default(),
            items: vec![],
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(tag = "type", content = "object")]
pub enum WatchEvent {
    #[serde(rename = "ADDED")]
    Added(Unstructured),
    #[serde(rename = "MODIFIED")]
    Modified(Unstructured),
    #[serde(rename = "DELETED")]
    Deleted(Unstructured),
    #[serde(rename = "BOOKMARK")]
    Bookmark(Unstructured),
    #[serde(rename = "ERROR")]
    Error(Status),
}

impl WatchEvent {
    pub fn object(&self) -> Option<&Unstructured> {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) | Self::Bookmark(obj) => {
                Some(obj)
            }
            Self::Error(_) => None,
        }
    }

    pub fn map_object(self, f: impl FnOnce(Unstructured) -> Unstructured) -> Self {
        match self {
            Self::Added(obj) => Self::Added(f(obj)),
            Self::Modified(obj) => Self::Modified(f(obj)),
            Self::Deleted(obj) => Self::Deleted(f(obj)),
            Self::Bookmark(obj) => Self::Bookmark(f(obj)),
            other => other,
        }
    }
}

#[cfg(test)]
mod test {

    use serde_json::json;

    use super::Unstructured;
    use super::WatchEvent;

    #[test]
    fn test_accessors() {
        let obj = Unstructured::new(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": { "name": "a", "namespace": "default", "generation": 3 },
            "spec": { "replicas": 2 }
        }));
        assert_eq!(obj.api_version(), "example.com/v1");
        assert_eq!(obj.kind(), "Widget");
        assert_eq!(obj.name(), "a");
        assert_eq!(obj.namespace(), "default");
        assert_eq!(obj.generation(), 3);
        assert!(obj.deletion_timestamp().is_none());
    }

    #[test]
    fn test_setters_create_metadata() {
        let mut obj = Unstructured::new(json!({"apiVersion": "example.com/v1"}));
        obj.set_name("b");
        obj.set_uid("123");
        assert_eq!(obj.name(), "b");
        assert_eq!(obj.uid(), "123");
    }

    #[test]
    fn test_watch_event_wire_format() {
        let obj = Unstructured::new(json!({"metadata": {"name": "a"}}));
        let event = WatchEvent::Added(obj);
        let wire = serde_json::to_value(&event).expect("serialize");
        assert_eq!(wire["type"], "ADDED");
        assert_eq!(wire["object"]["metadata"]["name"], "a");
    }
}
