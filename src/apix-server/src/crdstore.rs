//!
//! # Definition registry
//!
//! Typed storage for the definitions themselves, over the same key value
//! contract the instances use, plus the informer cache every controller
//! and the dispatcher read from.
//!
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::error;

use apix_store::KeyValueStore;
use apix_store::ResourceStore;
use apix_types::names;
use apix_types::options::DeleteOptions;
use apix_types::options::ListOptions;
use apix_types::ApiError;
use apix_types::Cause;
use apix_types::ConversionStrategy;
use apix_types::CrdSpec;
use apix_types::CustomResourceDefinition;
use apix_types::Unstructured;
use apix_types::WatchEvent;
use apix_types::API_GROUP;
use apix_types::CLEANUP_FINALIZER;
use apix_types::CRD_KIND;
use apix_types::CRD_PLURAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrdEventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct CrdEvent {
    pub kind: CrdEventKind,
    pub name: String,
}

type Cache = Arc<RwLock<HashMap<String, Arc<CustomResourceDefinition>>>>;

pub struct CrdStore {
    resources: ResourceStore,
    cache: Cache,
    events: broadcast::Sender<CrdEvent>,
}

impl CrdStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            resources: ResourceStore::new(kv, API_GROUP, CRD_PLURAL, false),
            cache: Arc::new(RwLock::new(HashMap::new())),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CrdEvent> {
        self.events.subscribe()
    }

    /// run the informer: populate the cache from the store watch and fan
    /// events out to subscribers
    pub async fn run_informer(self: Arc<Self>) {
        let options = ListOptions {
            resource_version: Some("0".to_owned()),
            ..Default::default()
        };
        let mut watch = match self.resources.watch(None, &options, &[]).await {
            Ok(watch) => watch,
            Err(err) => {
                error!(%err, "definition informer failed to start");
                return;
            }
        };
        while let Some(event) = watch.next().await {
            let (kind, object) = match event {
                WatchEvent::Added(object) => (CrdEventKind::Added, object),
                WatchEvent::Modified(object) => (CrdEventKind::Modified, object),
                WatchEvent::Deleted(object) => (CrdEventKind::Deleted, object),
                _ => continue,
            };
            let name = object.name().to_owned();
            match kind {
                CrdEventKind::Deleted => {
                    self.cache.write().expect("cache lock").remove(&name);
                }
                _ => match decode(object.into_value()) {
                    Ok(crd) => {
                        self.cache
                            .write()
                            .expect("cache lock")
                            .insert(name.clone(), Arc::new(crd));
                    }
                    Err(err) => {
                        error!(%err, name, "malformed stored definition");
                        continue;
                    }
                },
            }
            let _ = self.events.send(CrdEvent { kind, name });
        }
    }

    pub fn cached(&self, name: &str) -> Option<Arc<CustomResourceDefinition>> {
        self.cache.read().expect("cache lock").get(name).cloned()
    }

    pub fn cached_all(&self) -> Vec<Arc<CustomResourceDefinition>> {
        self.cache
            .read()
            .expect("cache lock")
            .values()
            .cloned()
            .collect()
    }

    /// resolve a (group, plural) pair through accepted names first, the
    /// spec names as a fallback for not yet named definitions
    pub fn cached_by_resource(
        &self,
        group: &str,
        resource: &str,
    ) -> Option<Arc<CustomResourceDefinition>> {
        self.cache
            .read()
            .expect("cache lock")
            .values()
            .find(|crd| {
                crd.spec.group == group
                    && (crd.status.accepted_names.plural == resource
                        || crd.spec.names.plural == resource)
            })
            .cloned()
    }

    pub async fn get(&self, name: &str) -> Result<CustomResourceDefinition, ApiError> {
        let object = self.resources.get(None, name).await?;
        decode(object.into_value())
    }

    pub async fn list(&self) -> Result<Vec<CustomResourceDefinition>, ApiError> {
        let list = self
            .resources
            .list(None, &ListOptions::default(), &[])
            .await?;
        list.items
            .into_iter()
            .map(|object| decode(object.into_value()))
            .collect()
    }

    /// create clears any client supplied status, seeds storedVersions
    /// with the storage version and attaches the cleanup finalizer
    pub async fn create(
        &self,
        mut crd: CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition, ApiError> {
        crd.spec.names.canonicalize();
        let causes = validate_spec(&crd);
        if !causes.is_empty() {
            return Err(ApiError::invalid(CRD_KIND, &crd.metadata.name, causes));
        }

        crd.status = Default::default();
        if let Some(storage) = crd.storage_version() {
            crd.status.stored_versions = vec![storage.name.clone()];
        }
        crd.metadata.add_finalizer(CLEANUP_FINALIZER);
        crd.api_version = apix_types::API_VERSION.to_owned();
        crd.kind = CRD_KIND.to_owned();

        let created = self.resources.create(None, encode(&crd)?).await?;
        decode(created.into_value())
    }

    /// spec update; status is carried over from the stored object
    pub async fn update(
        &self,
        mut crd: CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition, ApiError> {
        let existing = self.get(&crd.metadata.name).await?;
        crd.spec.names.canonicalize();

        let mut causes = validate_spec(&crd);
        if crd.spec.names.plural != existing.spec.names.plural {
            causes.push(Cause::new(
                "FieldValueInvalid",
                "plural name cannot be changed",
                "spec.names.plural",
            ));
        }
        if crd.spec.group != existing.spec.group {
            causes.push(Cause::new(
                "FieldValueInvalid",
                "group cannot be changed",
                "spec.group",
            ));
        }
        if crd.spec.scope != existing.spec.scope {
            causes.push(Cause::new(
                "FieldValueInvalid",
                "scope cannot be changed",
                "spec.scope",
            ));
        }
        for stored in &existing.status.stored_versions {
            if crd.version(stored).is_none() {
                causes.push(Cause::new(
                    "FieldValueInvalid",
                    format!("version \"{stored}\" is still listed in status.storedVersions"),
                    "spec.versions",
                ));
            }
        }
        if !causes.is_empty() {
            return Err(ApiError::invalid(CRD_KIND, &crd.metadata.name, causes));
        }

        crd.status = existing.status.clone();
        if crd.spec != existing.spec {
            crd.metadata.generation = Some(existing.metadata.generation.unwrap_or(1) + 1);
        }
        let expected = crd.metadata.resource_version.clone();
        let (updated, _) = self
            .resources
            .update(None, &existing.metadata.name, encode(&crd)?, &expected)
            .await?;
        decode(updated.into_value())
    }

    /// status subresource update; the spec is carried over unchanged
    pub async fn update_status(
        &self,
        crd: CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition, ApiError> {
        let existing = self.get(&crd.metadata.name).await?;
        let mut merged = existing.clone();
        merged.status = crd.status;
        merged.metadata.finalizers = crd.metadata.finalizers;
        let expected = if crd.metadata.resource_version.is_empty() {
            existing.metadata.resource_version.clone()
        } else {
            crd.metadata.resource_version.clone()
        };
        merged.metadata.resource_version = expected.clone();
        let (updated, _) = self
            .resources
            .update(None, &existing.metadata.name, encode(&merged)?, &expected)
            .await?;
        decode(updated.into_value())
    }

    /// record that instances have been written in `version`
    pub async fn ensure_stored_version(&self, name: &str, version: &str) -> Result<(), ApiError> {
        for _ in 0..3 {
            let mut crd = self.get(name).await?;
            if crd.status.stored_versions.iter().any(|v| v == version) {
                return Ok(());
            }
            crd.status.stored_versions.push(version.to_owned());
            debug!(name, version, "appending stored version");
            match self.update_status(crd).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(ApiError::conflict(CRD_PLURAL, name, "stored version update"))
    }

    pub async fn delete(
        &self,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(CustomResourceDefinition, bool), ApiError> {
        let (object, pending) = self.resources.delete(None, name, options).await?;
        Ok((decode(object.into_value())?, pending))
    }

    /// remove the cleanup finalizer once instance purging is complete;
    /// the storage layer turns this into the actual deletion
    pub async fn release_finalizer(&self, name: &str) -> Result<(), ApiError> {
        for _ in 0..3 {
            let mut crd = match self.get(name).await {
                Ok(crd) => crd,
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err),
            };
            if !crd.metadata.remove_finalizer(CLEANUP_FINALIZER) {
                return Ok(());
            }
            match self.update_status(crd).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_conflict() => continue,
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        Err(ApiError::conflict(CRD_PLURAL, name, "finalizer removal"))
    }

    pub async fn watch_objects(
        &self,
        options: &ListOptions,
    ) -> Result<futures_util::stream::BoxStream<'static, WatchEvent>, ApiError> {
        self.resources.watch(None, options, &[]).await
    }

    pub async fn list_objects(
        &self,
        options: &ListOptions,
    ) -> Result<apix_types::UnstructuredList, ApiError> {
        self.resources.list(None, options, &[]).await
    }
}

fn encode(crd: &CustomResourceDefinition) -> Result<Unstructured, ApiError> {
    let value = serde_json::to_value(crd)
        .map_err(|err| ApiError::internal(format!("definition encode: {err}")))?;
    Ok(Unstructured::new(value))
}

fn decode(value: Value) -> Result<CustomResourceDefinition, ApiError> {
    serde_json::from_value(value)
        .map_err(|err| ApiError::bad_request(format!("malformed definition: {err}")))
}

/// the definition level invariants enforced on every write
pub fn validate_spec(crd: &CustomResourceDefinition) -> Vec<Cause> {
    let mut causes = vec![];
    let spec: &CrdSpec = &crd.spec;

    if !names::is_dns1123_subdomain(&spec.group) {
        causes.push(Cause::new(
            "FieldValueInvalid",
            names::dns1123_subdomain_error("group", &spec.group),
            "spec.group",
        ));
    }
    if !names::is_dns1123_label(&spec.names.plural) {
        causes.push(Cause::new(
            "FieldValueInvalid",
            names::dns1123_label_error("plural", &spec.names.plural),
            "spec.names.plural",
        ));
    }
    if !names::is_kind_name(&spec.names.kind) {
        causes.push(Cause::new(
            "FieldValueInvalid",
            format!("kind \"{}\" must be CamelCase", spec.names.kind),
            "spec.names.kind",
        ));
    }
    let expected_name = crd.qualified_name();
    if crd.metadata.name != expected_name {
        causes.push(Cause::new(
            "FieldValueInvalid",
            format!("name must be \"{expected_name}\""),
            "metadata.name",
        ));
    }

    if spec.versions.is_empty() {
        causes.push(Cause::new(
            "FieldValueRequired",
            "at least one version is required",
            "spec.versions",
        ));
    }
    let mut seen = vec![];
    for (idx, version) in spec.versions.iter().enumerate() {
        if seen.contains(&&version.name) {
            causes.push(Cause::new(
                "FieldValueDuplicate",
                format!("duplicate version \"{}\"", version.name),
                format!("spec.versions[{idx}].name"),
            ));
        }
        seen.push(&version.name);
    }
    let storage: Vec<&apix_types::CrdVersion> =
        spec.versions.iter().filter(|v| v.storage).collect();
    match storage.len() {
        0 => causes.push(Cause::new(
            "FieldValueInvalid",
            "exactly one version must have storage=true",
            "spec.versions",
        )),
        1 => {
            if !storage[0].served {
                causes.push(Cause::new(
                    "FieldValueInvalid",
                    format!("storage version \"{}\" must be served", storage[0].name),
                    "spec.versions",
                ));
            }
        }
        _ => causes.push(Cause::new(
            "FieldValueInvalid",
            "only one version may have storage=true",
            "spec.versions",
        )),
    }
    if !spec.versions.iter().any(|v| v.served) {
        causes.push(Cause::new(
            "FieldValueInvalid",
            "at least one version must be served",
            "spec.versions",
        ));
    }

    if let Some(conversion) = &spec.conversion {
        if conversion.strategy == ConversionStrategy::Webhook {
            let config_ok = conversion
                .webhook
                .as_ref()
                .map(|w| {
                    w.client_config.url.is_some() || w.client_config.service.is_some()
                })
                .unwrap_or(false);
            if !config_ok {
                causes.push(Cause::new(
                    "FieldValueRequired",
                    "webhook conversion requires clientConfig.url or clientConfig.service",
                    "spec.conversion.webhook",
                ));
            }
        }
    }

    causes
}
