//!
//! # OpenAPI publication
//!
//! Translates the schemas of established definitions into one global v2
//! document and per group-version v3 documents. Kubernetes extensions in
//! the declared schemas pass through verbatim. Documents are regenerated
//! on any change and swapped atomically.
//!
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::StatusCode;
use serde_json::json;
use serde_json::Value;

use apix_types::CustomResourceDefinition;

use crate::request::ApiRequest;
use crate::request::ApiResponse;

pub struct OpenApiPublisher {
    v2: ArcSwap<Value>,
    v3: ArcSwap<HashMap<String, Value>>,
}

impl Default for OpenApiPublisher {
    fn default() -> Self {
        Self {
            v2: ArcSwap::from_pointee(empty_v2()),
            v3: ArcSwap::from_pointee(HashMap::new()),
        }
    }
}

fn empty_v2() -> Value {
    json!({
        "swagger": "2.0",
        "info": { "title": "Apix extension API", "version": "v1" },
        "paths": {},
        "definitions": {},
    })
}

impl OpenApiPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rebuild(&self, crds: &[Arc<CustomResourceDefinition>]) {
        let mut paths = BTreeMap::new();
        let mut definitions = BTreeMap::new();
        let mut v3_docs: HashMap<String, Value> = HashMap::new();

        for crd in crds {
            let names = if crd.status.accepted_names.plural.is_empty() {
                &crd.spec.names
            } else {
                &crd.status.accepted_names
            };
            for version in crd.served_versions() {
                let definition_name =
                    format!("{}.{}.{}", crd.spec.group, version.name, names.kind);
                let schema = object_schema(crd, &version.name, &names.kind);
                definitions.insert(definition_name.clone(), schema.clone());

                let reference = format!("#/definitions/{definition_name}");
                for (path, operations) in
                    resource_paths(crd, &version.name, &names.plural, &reference)
                {
                    paths.insert(path, operations);
                }

                let mut v3_paths = BTreeMap::new();
                let v3_reference =
                    format!("#/components/schemas/{definition_name}");
                for (path, operations) in
                    resource_paths(crd, &version.name, &names.plural, &v3_reference)
                {
                    v3_paths.insert(path, operations);
                }
                v3_docs.insert(
                    format!("{}/{}", crd.spec.group, version.name),
                    json!({
                        "openapi": "3.0.0",
                        "info": {
                            "title": "Apix extension API",
                            "version": version.name,
                        },
                        "paths": v3_paths,
                        "components": { "schemas": { definition_name: schema } },
                    }),
                );
            }
        }

        self.v2.store(Arc::new(json!({
            "swagger": "2.0",
            "info": { "title": "Apix extension API", "version": "v1" },
            "paths": paths,
            "definitions": definitions,
        })));
        self.v3.store(Arc::new(v3_docs));
    }

    pub fn handle(&self, request: &ApiRequest) -> Option<ApiResponse> {
        let path = request.path.trim_end_matches('/');
        if path == "/openapi/v2" {
            let doc = self.v2.load_full();
            return Some(ApiResponse::json(
                StatusCode::OK,
                serde_json::to_vec(&doc).unwrap_or_default(),
            ));
        }
        let rest = path.strip_prefix("/openapi/v3/apis/")?;
        let docs = self.v3.load();
        let doc = docs.get(rest)?;
        Some(ApiResponse::json(
            StatusCode::OK,
            serde_json::to_vec(doc).unwrap_or_default(),
        ))
    }
}

/// the declared schema with the envelope fields attached; extensions in
/// the declared part are preserved untouched
fn object_schema(crd: &CustomResourceDefinition, version: &str, kind: &str) -> Value {
    let declared = crd
        .version(version)
        .and_then(|v| v.schema.as_ref())
        .and_then(|s| s.open_api_v3_schema.clone())
        .unwrap_or_else(|| json!({ "type": "object" }));

    let mut schema = declared;
    if let Some(root) = schema.as_object_mut() {
        root.insert(
            "x-kubernetes-group-version-kind".to_owned(),
            json!([{ "group": crd.spec.group, "version": version, "kind": kind }]),
        );
        let properties = root
            .entry("properties".to_owned())
            .or_insert_with(|| json!({}));
        if let Some(properties) = properties.as_object_mut() {
            properties
                .entry("apiVersion".to_owned())
                .or_insert_with(|| json!({ "type": "string" }));
            properties
                .entry("kind".to_owned())
                .or_insert_with(|| json!({ "type": "string" }));
            properties
                .entry("metadata".to_owned())
                .or_insert_with(|| json!({ "type": "object" }));
        }
    }
    schema
}

fn operation(verb: &str, reference: &str) -> Value {
    json!({
        "description": verb,
        "responses": {
            "200": {
                "description": "OK",
                "schema": { "$ref": reference }
            }
        }
    })
}

/// the standard path templates for the eight verbs and the subresource
/// variants
fn resource_paths(
    crd: &CustomResourceDefinition,
    version: &str,
    plural: &str,
    reference: &str,
) -> Vec<(String, Value)> {
    let group = &crd.spec.group;
    let base = if crd.spec.scope.is_namespaced() {
        format!("/apis/{group}/{version}/namespaces/{{namespace}}/{plural}")
    } else {
        format!("/apis/{group}/{version}/{plural}")
    };
    let item = format!("{base}/{{name}}");

    let mut paths = vec![
        (
            base,
            json!({
                "get": operation("list", reference),
                "post": operation("create", reference),
                "delete": operation("deletecollection", reference),
            }),
        ),
        (
            item.clone(),
            json!({
                "get": operation("read", reference),
                "put": operation("replace", reference),
                "patch": operation("patch", reference),
                "delete": operation("delete", reference),
            }),
        ),
    ];

    if let Some(subresources) = crd.version(version).and_then(|v| v.subresources.as_ref()) {
        if subresources.status.is_some() {
            paths.push((
                format!("{item}/status"),
                json!({
                    "get": operation("read status", reference),
                    "put": operation("replace status", reference),
                    "patch": operation("patch status", reference),
                }),
            ));
        }
        if subresources.scale.is_some() {
            paths.push((
                format!("{item}/scale"),
                json!({
                    "get": operation("read scale", reference),
                    "put": operation("replace scale", reference),
                }),
            ));
        }
    }
    paths
}

#[cfg(test)]
mod test {

    use http::Method;
    use serde_json::json;

    use super::*;

    fn crd() -> Arc<CustomResourceDefinition> {
        Arc::new(
            serde_json::from_value(json!({
                "metadata": { "name": "widgets.example.com" },
                "spec": {
                    "group": "example.com",
                    "scope": "Namespaced",
                    "names": { "plural": "widgets", "singular": "widget", "kind": "Widget" },
                    "versions": [
                        {
                            "name": "v1", "served": true, "storage": true,
                            "schema": { "openAPIV3Schema": {
                                "type": "object",
                                "properties": {
                                    "spec": {
                                        "type": "object",
                                        "x-kubernetes-preserve-unknown-fields": true
                                    }
                                }
                            } },
                            "subresources": { "status": {} }
                        }
                    ]
                }
            }))
            .expect("crd"),
        )
    }

    #[test]
    fn test_v2_document() {
        let publisher = OpenApiPublisher::new();
        publisher.rebuild(&[crd()]);

        let request = ApiRequest::new(Method::GET, "/openapi/v2");
        let response = publisher.handle(&request).expect("v2");
        let doc: Value = serde_json::from_slice(response.bytes()).expect("json");

        assert_eq!(doc["swagger"], "2.0");
        let definition = &doc["definitions"]["example.com.v1.Widget"];
        // declared extensions pass through verbatim
        assert_eq!(
            definition["properties"]["spec"]["x-kubernetes-preserve-unknown-fields"],
            true
        );
        assert_eq!(
            definition["x-kubernetes-group-version-kind"][0]["kind"],
            "Widget"
        );
        assert!(doc["paths"]
            .get("/apis/example.com/v1/namespaces/{namespace}/widgets")
            .is_some());
        assert!(doc["paths"]
            .get("/apis/example.com/v1/namespaces/{namespace}/widgets/{name}/status")
            .is_some());
    }

    #[test]
    fn test_v3_document_per_group_version() {
        let publisher = OpenApiPublisher::new();
        publisher.rebuild(&[crd()]);

        let request = ApiRequest::new(Method::GET, "/openapi/v3/apis/example.com/v1");
        let response = publisher.handle(&request).expect("v3");
        let doc: Value = serde_json::from_slice(response.bytes()).expect("json");
        assert_eq!(doc["openapi"], "3.0.0");
        assert!(doc["components"]["schemas"]["example.com.v1.Widget"].is_object());

        let missing = ApiRequest::new(Method::GET, "/openapi/v3/apis/other.io/v1");
        assert!(publisher.handle(&missing).is_none());
    }
}
