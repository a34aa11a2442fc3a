//!
//! # Serving info
//!
//! The immutable per-definition bundle the dispatcher serves requests
//! from: compiled validators and expression programs per version, one
//! shared storage handle, the converter, and the in-flight counter used
//! for graceful teardown. Updates are whole snapshot swaps; readers never
//! lock.
//!
use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use tracing::warn;

use apix_cel::CostEstimator;
use apix_cel::RuleSet;
use apix_conversion::Converter;
use apix_schema::Structural;
use apix_store::KeyValueStore;
use apix_store::ResourceStore;
use apix_types::ApiError;
use apix_types::CustomResourceDefinition;
use apix_types::Subresources;

use crate::config::ServerConfig;

/// how long a replaced entry lingers after its last request drains
const TEARDOWN_LINGER: Duration = Duration::from_secs(10);
const DRAIN_POLL: Duration = Duration::from_millis(250);

pub struct CompiledVersion {
    pub name: String,
    pub api_version: String,
    pub schema: Option<Arc<Structural>>,
    /// false when the schema carries structural violations; such versions
    /// serve without defaulting, pruning or rules
    pub structural: bool,
    pub rules: Arc<RuleSet>,
    pub subresources: Subresources,
    pub selectable: Vec<String>,
    pub deprecated: bool,
    pub deprecation_warning: Option<String>,
}

pub struct ServingInfo {
    pub crd: Arc<CustomResourceDefinition>,
    pub kind: String,
    pub list_kind: String,
    pub plural: String,
    pub group: String,
    pub namespaced: bool,
    pub storage_version: String,
    versions: HashMap<String, Arc<CompiledVersion>>,
    pub store: Arc<ResourceStore>,
    pub converter: Arc<Converter>,
    inflight: Arc<AtomicI64>,
}

impl ServingInfo {
    /// compile the serving bundle for a definition. The storage handle is
    /// reused across rebuilds when the (group, resource) is unchanged so
    /// open watches survive spec updates.
    pub fn build(
        crd: Arc<CustomResourceDefinition>,
        kv: Arc<dyn KeyValueStore>,
        config: &ServerConfig,
        reuse_store: Option<Arc<ResourceStore>>,
    ) -> Result<Arc<Self>, ApiError> {
        let names = if crd.status.accepted_names.plural.is_empty() {
            &crd.spec.names
        } else {
            &crd.status.accepted_names
        };
        let storage_version = crd
            .storage_version()
            .map(|v| v.name.clone())
            .ok_or_else(|| ApiError::internal("definition has no storage version"))?;
        let namespaced = crd.spec.scope.is_namespaced();

        let estimator = CostEstimator::new(config.max_request_body_bytes);
        let mut versions = HashMap::new();
        for version in crd.served_versions() {
            let mut schema = None;
            let mut structural = false;
            let mut rules = Arc::new(RuleSet::default());
            if let Some(document) = version
                .schema
                .as_ref()
                .and_then(|s| s.open_api_v3_schema.as_ref())
            {
                let parsed = Structural::parse(document).map_err(|err| {
                    ApiError::internal(format!(
                        "schema for version {}: {err}",
                        version.name
                    ))
                })?;
                structural = parsed.is_structural();
                let mut root = parsed.schema;
                // the root is an embedded resource position: pruning and
                // validation keep the envelope and treat metadata by the
                // fixed schema
                root.extensions.embedded_resource = true;
                if structural {
                    let compilation = apix_cel::compile(&root, &estimator);
                    if !compilation.errors.is_empty() {
                        // already reported on conditions; serve the rules
                        // that did compile
                        warn!(
                            crd = %crd.metadata.name,
                            version = version.name,
                            errors = compilation.errors.len(),
                            "serving with partially compiled rules"
                        );
                    }
                    rules = Arc::new(compilation.rules);
                }
                schema = Some(Arc::new(root));
            }

            versions.insert(
                version.name.clone(),
                Arc::new(CompiledVersion {
                    name: version.name.clone(),
                    api_version: format!("{}/{}", crd.spec.group, version.name),
                    schema,
                    structural,
                    rules,
                    subresources: version.subresources.clone().unwrap_or_default(),
                    selectable: version
                        .selectable_fields
                        .iter()
                        .map(|f| f.json_path.trim_start_matches('.').to_owned())
                        .collect(),
                    deprecated: version.deprecated,
                    deprecation_warning: version.deprecation_warning.clone(),
                }),
            );
        }

        let store = match reuse_store {
            Some(store) => store,
            None => Arc::new(ResourceStore::new(
                kv,
                &crd.spec.group,
                &names.plural,
                namespaced,
            )),
        };

        let converter = Converter::from_crd(
            crd.spec.conversion.as_ref(),
            config.service_resolver.as_ref(),
            config.auth_info_resolver.clone(),
            config.clamp_webhook_timeout(None),
        )
        .map_err(|err| ApiError::internal(format!("conversion setup: {err}")))?;

        Ok(Arc::new(Self {
            kind: names.kind.clone(),
            list_kind: names.list_kind.clone(),
            plural: names.plural.clone(),
            group: crd.spec.group.clone(),
            namespaced,
            storage_version,
            versions,
            store,
            converter: Arc::new(converter),
            inflight: Arc::new(AtomicI64::new(0)),
            crd,
        }))
    }

    pub fn version(&self, name: &str) -> Option<Arc<CompiledVersion>> {
        self.versions.get(name).cloned()
    }

    pub fn version_names(&self) -> impl Iterator<Item = &String> {
        self.versions.keys()
    }

    pub fn storage(&self) -> Option<Arc<CompiledVersion>> {
        self.version(&self.storage_version)
    }

    /// tracks one request against this entry for teardown draining
    pub fn guard(&self) -> RequestGuard {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        RequestGuard {
            counter: self.inflight.clone(),
        }
    }

    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::SeqCst)
    }
}

pub struct RequestGuard {
    counter: Arc<AtomicI64>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// the atomically published map from definition UID to serving info
pub type Snapshot = HashMap<String, Arc<ServingInfo>>;

/// hold a replaced entry until its in-flight requests drain, then a short
/// linger, then release
pub fn retire(info: Arc<ServingInfo>) {
    tokio::spawn(async move {
        loop {
            if info.inflight() == 0 {
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        tokio::time::sleep(TEARDOWN_LINGER).await;
        debug!(crd = %info.crd.metadata.name, "serving info released");
        drop(info);
    });
}

#[cfg(test)]
mod test {

    use serde_json::json;

    use super::*;
    use apix_store::MemoryStore;

    fn crd() -> Arc<CustomResourceDefinition> {
        Arc::new(
            serde_json::from_value(json!({
                "metadata": { "name": "widgets.example.com", "uid": "u1" },
                "spec": {
                    "group": "example.com",
                    "scope": "Namespaced",
                    "names": {
                        "plural": "widgets", "singular": "widget",
                        "kind": "Widget", "listKind": "WidgetList"
                    },
                    "versions": [
                        {
                            "name": "v1", "served": true, "storage": true,
                            "schema": { "openAPIV3Schema": {
                                "type": "object",
                                "properties": {
                                    "spec": {
                                        "type": "object",
                                        "properties": {
                                            "replicas": {
                                                "type": "integer",
                                                "x-kubernetes-validations": [
                                                    { "rule": "self >= 0" }
                                                ]
                                            }
                                        }
                                    }
                                }
                            } }
                        },
                        { "name": "v2alpha1", "served": false, "storage": false }
                    ]
                }
            }))
            .expect("crd"),
        )
    }

    #[tokio::test]
    async fn test_build_compiles_served_versions() {
        let info = ServingInfo::build(
            crd(),
            MemoryStore::shared(),
            &ServerConfig::default(),
            None,
        )
        .expect("build");

        let v1 = info.version("v1").expect("v1");
        assert!(v1.structural);
        assert_eq!(v1.rules.len(), 1);
        assert_eq!(v1.api_version, "example.com/v1");
        // unserved versions get no serving state
        assert!(info.version("v2alpha1").is_none());
        assert_eq!(info.storage_version, "v1");
    }

    #[tokio::test]
    async fn test_guard_counts_inflight() {
        let info = ServingInfo::build(
            crd(),
            MemoryStore::shared(),
            &ServerConfig::default(),
            None,
        )
        .expect("build");
        assert_eq!(info.inflight(), 0);
        let guard = info.guard();
        let second = info.guard();
        assert_eq!(info.inflight(), 2);
        drop(guard);
        drop(second);
        assert_eq!(info.inflight(), 0);
    }
}
