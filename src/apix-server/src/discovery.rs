//!
//! # Discovery publication
//!
//! The externally visible type catalog: group list, per group
//! descriptors, per version resource lists, and the aggregated document.
//! Each is a single atomically swapped value, rebuilt whenever the set of
//! established definitions changes.
//!
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Value;

use apix_types::CustomResourceDefinition;

use crate::request::ApiRequest;
use crate::request::ApiResponse;
use crate::version::compare_versions;
use crate::version::storage_version_hash;

/// accepted media type parameter set for the aggregated document
const AGGREGATED_MARKER: &str = "as=APIGroupDiscoveryList";

const MAIN_VERBS: [&str; 8] = [
    "create",
    "delete",
    "deletecollection",
    "get",
    "list",
    "patch",
    "update",
    "watch",
];

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersion {
    pub group_version: String,
    pub version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiGroup {
    pub name: String,
    pub versions: Vec<GroupVersion>,
    pub preferred_version: GroupVersion,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiResource {
    pub name: String,
    pub singular_name: String,
    pub namespaced: bool,
    pub kind: String,
    pub verbs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub short_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_version_hash: Option<String>,
}

pub struct DiscoveryPublisher {
    group_list: ArcSwap<Value>,
    groups: ArcSwap<HashMap<String, Value>>,
    resource_lists: ArcSwap<HashMap<String, Value>>,
    aggregated: ArcSwap<Value>,
}

impl Default for DiscoveryPublisher {
    fn default() -> Self {
        Self {
            group_list: ArcSwap::from_pointee(
                json!({ "kind": "APIGroupList", "apiVersion": "v1", "groups": [] }),
            ),
            groups: ArcSwap::from_pointee(HashMap::new()),
            resource_lists: ArcSwap::from_pointee(HashMap::new()),
            aggregated: ArcSwap::from_pointee(json!({
                "kind": "APIGroupDiscoveryList",
                "apiVersion": "apidiscovery.k8s.io/v2",
                "items": []
            })),
        }
    }
}

impl DiscoveryPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// rebuild every document from the established definitions and swap
    /// them in
    pub fn rebuild(&self, crds: &[Arc<CustomResourceDefinition>]) {
        let mut by_group: BTreeMap<String, Vec<&Arc<CustomResourceDefinition>>> = BTreeMap::new();
        for crd in crds {
            by_group.entry(crd.spec.group.clone()).or_default().push(crd);
        }

        let mut group_docs = HashMap::new();
        let mut resource_docs = HashMap::new();
        let mut groups = vec![];
        let mut aggregated_items = vec![];

        for (group_name, members) in &by_group {
            let mut versions: Vec<String> = vec![];
            for crd in members {
                for version in crd.served_versions() {
                    if !versions.iter().any(|v| v == &version.name) {
                        versions.push(version.name.clone());
                    }
                }
            }
            versions.sort_by(|a, b| compare_versions(a, b));
            if versions.is_empty() {
                continue;
            }
            let preferred = preferred_version(members, &versions);

            let group = ApiGroup {
                name: group_name.clone(),
                versions: versions
                    .iter()
                    .map(|v| GroupVersion {
                        group_version: format!("{group_name}/{v}"),
                        version: v.clone(),
                    })
                    .collect(),
                preferred_version: GroupVersion {
                    group_version: format!("{group_name}/{preferred}"),
                    version: preferred.clone(),
                },
            };
            let group_value = serde_json::to_value(&group).unwrap_or_default();
            groups.push(group_value.clone());

            let mut group_doc = json!({ "kind": "APIGroup", "apiVersion": "v1" });
            merge_objects(&mut group_doc, &group_value);
            group_docs.insert(group_name.clone(), group_doc);

            let mut aggregated_versions = vec![];
            for version in &versions {
                let resources = version_resources(members, version);
                let list = json!({
                    "kind": "APIResourceList",
                    "apiVersion": "v1",
                    "groupVersion": format!("{group_name}/{version}"),
                    "resources": resources,
                });
                resource_docs.insert(format!("{group_name}/{version}"), list);
                aggregated_versions.push(json!({
                    "version": version,
                    "resources": version_resources(members, version),
                }));
            }
            aggregated_items.push(json!({
                "metadata": { "name": group_name },
                "versions": aggregated_versions,
            }));
        }

        self.group_list.store(Arc::new(json!({
            "kind": "APIGroupList",
            "apiVersion": "v1",
            "groups": groups,
        })));
        self.groups.store(Arc::new(group_docs));
        self.resource_lists.store(Arc::new(resource_docs));
        self.aggregated.store(Arc::new(json!({
            "kind": "APIGroupDiscoveryList",
            "apiVersion": "apidiscovery.k8s.io/v2",
            "items": aggregated_items,
        })));
    }

    /// answer the three discovery endpoints; None when the path is not a
    /// discovery path
    pub fn handle(&self, request: &ApiRequest) -> Option<ApiResponse> {
        let path = request.path.trim_end_matches('/');
        if path == "/apis" {
            if request.accept().contains(AGGREGATED_MARKER) {
                let doc = self.aggregated.load_full();
                return Some(json_response(&doc));
            }
            let doc = self.group_list.load_full();
            return Some(json_response(&doc));
        }
        let rest = path.strip_prefix("/apis/")?;
        match rest.split('/').collect::<Vec<_>>().as_slice() {
            [group] => {
                let groups = self.groups.load();
                let doc = groups.get(*group)?;
                Some(json_response(doc))
            }
            [group, version] => {
                let lists = self.resource_lists.load();
                let doc = lists.get(&format!("{group}/{version}"))?;
                Some(json_response(doc))
            }
            _ => None,
        }
    }
}

fn json_response(doc: &Value) -> ApiResponse {
    ApiResponse::json(
        StatusCode::OK,
        serde_json::to_vec(doc).unwrap_or_default(),
    )
}

/// the storage version if some member serves it, else the highest
/// priority served version
fn preferred_version(
    members: &[&Arc<CustomResourceDefinition>],
    sorted_versions: &[String],
) -> String {
    let mut storage_candidates: Vec<String> = members
        .iter()
        .filter_map(|crd| crd.storage_version())
        .filter(|v| v.served)
        .map(|v| v.name.clone())
        .collect();
    storage_candidates.sort_by(|a, b| compare_versions(a, b));
    storage_candidates
        .into_iter()
        .next()
        .unwrap_or_else(|| sorted_versions[0].clone())
}

fn version_resources(
    members: &[&Arc<CustomResourceDefinition>],
    version: &str,
) -> Vec<Value> {
    let mut resources = vec![];
    for crd in members {
        let Some(served) = crd.version(version).filter(|v| v.served) else {
            continue;
        };
        let names = if crd.status.accepted_names.plural.is_empty() {
            &crd.spec.names
        } else {
            &crd.status.accepted_names
        };
        let storage_hash = crd
            .storage_version()
            .map(|sv| storage_version_hash(&crd.spec.group, &sv.name, &names.plural));
        let main = ApiResource {
            name: names.plural.clone(),
            singular_name: names.singular.clone(),
            namespaced: crd.spec.scope.is_namespaced(),
            kind: names.kind.clone(),
            verbs: MAIN_VERBS.iter().map(|v| (*v).to_owned()).collect(),
            short_names: names.short_names.clone(),
            categories: names.categories.clone(),
            group: None,
            version: None,
            storage_version_hash: storage_hash,
        };
        resources.push(serde_json::to_value(&main).unwrap_or_default());

        if let Some(subresources) = &served.subresources {
            if subresources.status.is_some() {
                resources.push(
                    serde_json::to_value(&ApiResource {
                        name: format!("{}/status", names.plural),
                        singular_name: String::new(),
                        namespaced: crd.spec.scope.is_namespaced(),
                        kind: names.kind.clone(),
                        verbs: vec!["get".to_owned(), "patch".to_owned(), "update".to_owned()],
                        ..Default::default()
                    })
                    .unwrap_or_default(),
                );
            }
            if subresources.scale.is_some() {
                resources.push(
                    serde_json::to_value(&ApiResource {
                        name: format!("{}/scale", names.plural),
                        singular_name: String::new(),
                        namespaced: crd.spec.scope.is_namespaced(),
                        kind: "Scale".to_owned(),
                        verbs: vec!["get".to_owned(), "patch".to_owned(), "update".to_owned()],
                        group: Some("autoscaling".to_owned()),
                        version: Some("v1".to_owned()),
                        ..Default::default()
                    })
                    .unwrap_or_default(),
                );
            }
        }
    }
    resources
}

fn merge_objects(target: &mut Value, extra: &Value) {
    if let (Some(target), Some(extra)) = (target.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            target.insert(key.clone(), value.clone());
        }
    }
}
