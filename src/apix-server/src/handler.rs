//!
//! # Dynamic request dispatcher
//!
//! Routes every request for a registered type through decoding,
//! defaulting, admission, validation, conversion and storage. Per-type
//! serving state is resolved from an atomically published snapshot; a
//! request that misses the snapshot falls through to the delegate.
//!
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use futures_util::StreamExt;
use http::Method;
use http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing::info;
use tracing::warn;

use apix_patch::PatchOperation;
use apix_schema::metaschema;
use apix_store::scale as scale_project;
use apix_store::KeyValueStore;
use apix_types::now_timestamp;
use apix_types::options::DeleteOptions;
use apix_types::options::ListOptions;
use apix_types::options::PatchOptions;
use apix_types::options::PatchType;
use apix_types::ApiError;
use apix_types::Cause;
use apix_types::Status;
use apix_types::Unstructured;
use apix_types::WatchEvent;

use crate::config::AdmissionAttributes;
use crate::config::AdmissionOperation;
use crate::config::ServerConfig;
use crate::crdstore::CrdStore;
use crate::request::ApiRequest;
use crate::request::ApiResponse;
use crate::request::RequestInfo;
use crate::serving::retire;
use crate::serving::CompiledVersion;
use crate::serving::ServingInfo;
use crate::serving::Snapshot;

const SUBRESOURCE_STATUS: &str = "status";
const SUBRESOURCE_SCALE: &str = "scale";

enum Encoding {
    Json,
    Yaml,
}

pub struct CrdDispatcher {
    crds: Arc<CrdStore>,
    kv: Arc<dyn KeyValueStore>,
    config: ServerConfig,
    snapshot: ArcSwap<Snapshot>,
}

impl CrdDispatcher {
    pub fn new(crds: Arc<CrdStore>, kv: Arc<dyn KeyValueStore>, config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            crds,
            kv,
            config,
            snapshot: ArcSwap::from_pointee(Snapshot::new()),
        })
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// recompute the snapshot from the definition cache and publish it
    /// with one atomic store. Unaffected entries are carried over as-is;
    /// replaced entries are retired once their requests drain. Only the
    /// reconfiguration observer calls this.
    pub fn rebuild(&self) {
        let current = self.snapshot.load_full();
        let mut next = Snapshot::new();
        for crd in self.crds.cached_all() {
            if !crd.names_accepted() {
                continue;
            }
            let uid = crd.metadata.uid.clone();
            if let Some(existing) = current.get(&uid) {
                if existing.crd.metadata.resource_version == crd.metadata.resource_version {
                    next.insert(uid, existing.clone());
                    continue;
                }
            }
            let reuse = current.get(&uid).and_then(|existing| {
                let same_resource = existing.group == crd.spec.group
                    && existing.plural
                        == if crd.status.accepted_names.plural.is_empty() {
                            crd.spec.names.plural.clone()
                        } else {
                            crd.status.accepted_names.plural.clone()
                        };
                same_resource.then(|| existing.store.clone())
            });
            match ServingInfo::build(crd.clone(), self.kv.clone(), &self.config, reuse) {
                Ok(info) => {
                    info!(crd = %crd.metadata.name, "serving info installed");
                    next.insert(uid, info);
                }
                Err(err) => {
                    warn!(crd = %crd.metadata.name, %err, "serving info build failed");
                }
            }
        }
        for (uid, old) in current.iter() {
            let replaced = match next.get(uid) {
                Some(new) => !Arc::ptr_eq(new, old),
                None => true,
            };
            if replaced {
                retire(old.clone());
            }
        }
        self.snapshot.store(Arc::new(next));
    }

    pub async fn handle(&self, request: ApiRequest) -> ApiResponse {
        let Some(info) = RequestInfo::parse(&request.path) else {
            return self.config.delegate.handle(request).await;
        };
        let Some(crd) = self.crds.cached_by_resource(&info.group, &info.resource) else {
            return self.config.delegate.handle(request).await;
        };
        let snapshot = self.snapshot.load();
        let Some(serving) = snapshot.get(crd.uid()).cloned() else {
            return self.config.delegate.handle(request).await;
        };
        drop(snapshot);

        let _guard = serving.guard();
        let Some(version) = serving.version(&info.version) else {
            return ApiResponse::error(&ApiError::not_found(&info.resource, &info.version));
        };

        let warning = version.deprecated.then(|| {
            version.deprecation_warning.clone().unwrap_or_else(|| {
                format!("{} {} is deprecated", version.api_version, serving.kind)
            })
        });

        let is_watch = request.method == Method::GET
            && info.name.is_none()
            && request
                .options::<ListOptions>()
                .map(|o| o.is_watch())
                .unwrap_or(false);

        let result = if is_watch {
            self.watch(&serving, &version, &info, &request).await
        } else {
            let work = self.dispatch(&serving, &version, &info, &request);
            match tokio::time::timeout(self.config.request_timeout, work).await {
                Ok(result) => result,
                Err(_) => Err(ApiError::timeout("request deadline exceeded")),
            }
        };

        match result {
            Ok(response) => response.with_warning(warning),
            Err(err) => ApiResponse::error(&err).with_warning(warning),
        }
    }

    async fn dispatch(
        &self,
        serving: &ServingInfo,
        version: &CompiledVersion,
        info: &RequestInfo,
        request: &ApiRequest,
    ) -> Result<ApiResponse, ApiError> {
        if serving.namespaced {
            if info.namespace.is_none() && info.name.is_some() {
                return Err(ApiError::not_found(&serving.plural, "namespace required"));
            }
        } else if info.namespace.is_some() {
            return Err(ApiError::not_found(
                &serving.plural,
                info.name.as_deref().unwrap_or(""),
            ));
        }
        let subresource = info.subresource();
        if !matches!(subresource, "" | SUBRESOURCE_STATUS | SUBRESOURCE_SCALE) {
            return Err(ApiError::not_found("subresource", subresource));
        }
        if subresource == SUBRESOURCE_STATUS && version.subresources.status.is_none() {
            return Err(ApiError::not_found("subresource", subresource));
        }
        if subresource == SUBRESOURCE_SCALE && version.subresources.scale.is_none() {
            return Err(ApiError::not_found("subresource", subresource));
        }

        let method = &request.method;
        let name = info.name.as_deref();
        if *method == Method::GET {
            return match name {
                Some(name) => self.get(serving, version, info, request, name).await,
                None => self.list(serving, version, info, request).await,
            };
        }
        if *method == Method::POST && name.is_none() && subresource.is_empty() {
            return self.create(serving, version, info, request).await;
        }
        if *method == Method::PUT {
            if let Some(name) = name {
                return self.update(serving, version, info, request, name).await;
            }
        }
        if *method == Method::PATCH && subresource != SUBRESOURCE_SCALE {
            if let Some(name) = name {
                return self.patch(serving, version, info, request, name).await;
            }
        }
        if *method == Method::DELETE {
            return match name {
                Some(name) if subresource.is_empty() => {
                    self.delete(serving, version, info, request, name).await
                }
                None if subresource.is_empty() => {
                    self.delete_collection(serving, version, info, request).await
                }
                _ => Err(ApiError::bad_request(
                    "delete is not supported on subresources",
                )),
            };
        }
        Err(ApiError::bad_request(format!(
            "method {} is not supported on this path",
            request.method
        )))
    }

    async fn create(
        &self,
        serving: &ServingInfo,
        version: &CompiledVersion,
        info: &RequestInfo,
        request: &ApiRequest,
    ) -> Result<ApiResponse, ApiError> {
        if serving.namespaced && info.namespace.is_none() {
            return Err(ApiError::bad_request(format!(
                "{} is namespaced; create requests must name a namespace",
                serving.plural
            )));
        }
        let mut object = self.decode_body(request)?;
        if !object.kind().is_empty() && object.kind() != serving.kind {
            return Err(ApiError::bad_request(format!(
                "kind \"{}\" does not match expected \"{}\"",
                object.kind(),
                serving.kind
            )));
        }
        object.set_api_version(&version.api_version);
        object.set_kind(&serving.kind);
        if let Some(namespace) = &info.namespace {
            object.set_namespace(namespace);
        }
        if version.subresources.status.is_some() {
            if let Some(root) = object.value_mut().as_object_mut() {
                root.remove("status");
            }
        }

        self.default_and_admit(
            serving,
            version,
            info,
            AdmissionOperation::Create,
            &mut object,
            None,
        )
        .await?;
        self.validate(serving, version, &object, None)?;
        self.config
            .admission
            .validate(
                &self.attributes(info, AdmissionOperation::Create, object.name()),
                &object,
                None,
            )
            .await?;

        let stored = self.to_storage(serving, object).await?;
        let created = serving
            .store
            .create(info.namespace.as_deref(), stored)
            .await?;
        self.record_stored_version(serving).await;

        let response = serving
            .converter
            .convert_one(created, &version.api_version)
            .await?;
        self.encode(request, StatusCode::CREATED, response.value())
    }

    async fn get(
        &self,
        serving: &ServingInfo,
        version: &CompiledVersion,
        info: &RequestInfo,
        request: &ApiRequest,
        name: &str,
    ) -> Result<ApiResponse, ApiError> {
        let stored = serving.store.get(info.namespace.as_deref(), name).await?;
        let object = serving
            .converter
            .convert_one(stored, &version.api_version)
            .await?;
        if info.subresource() == SUBRESOURCE_SCALE {
            let scale = version
                .subresources
                .scale
                .as_ref()
                .expect("scale subresource checked");
            return self.encode(request, StatusCode::OK, &scale_project::read_scale(&object, scale));
        }
        self.encode(request, StatusCode::OK, object.value())
    }

    async fn list(
        &self,
        serving: &ServingInfo,
        version: &CompiledVersion,
        info: &RequestInfo,
        request: &ApiRequest,
    ) -> Result<ApiResponse, ApiError> {
        let options: ListOptions = request.options()?;
        let mut list = serving
            .store
            .list(info.namespace.as_deref(), &options, &version.selectable)
            .await?;
        list.items = serving
            .converter
            .convert(list.items, &version.api_version)
            .await?;
        list.api_version = version.api_version.clone();
        list.kind = serving.list_kind.clone();
        self.encode(request, StatusCode::OK, &list)
    }

    async fn watch(
        &self,
        serving: &ServingInfo,
        version: &CompiledVersion,
        info: &RequestInfo,
        request: &ApiRequest,
    ) -> Result<ApiResponse, ApiError> {
        let options: ListOptions = request.options()?;
        let events = serving
            .store
            .watch(info.namespace.as_deref(), &options, &version.selectable)
            .await?;

        let converter = serving.converter.clone();
        let target = version.api_version.clone();
        let kind = serving.kind.clone();
        let guard = serving.guard();
        let frames = events
            .then(move |event| {
                let converter = converter.clone();
                let target = target.clone();
                let kind = kind.clone();
                let _hold = &guard;
                async move {
                    match event {
                        WatchEvent::Added(object) => convert_event(
                            &converter, object, &target, WatchEvent::Added,
                        )
                        .await,
                        WatchEvent::Modified(object) => convert_event(
                            &converter, object, &target, WatchEvent::Modified,
                        )
                        .await,
                        WatchEvent::Deleted(object) => convert_event(
                            &converter, object, &target, WatchEvent::Deleted,
                        )
                        .await,
                        WatchEvent::Bookmark(mut object) => {
                            object.set_api_version(&target);
                            object.set_kind(&kind);
                            WatchEvent::Bookmark(object)
                        }
                        error => error,
                    }
                }
            })
            .map(|event| {
                let mut frame = serde_json::to_vec(&event).unwrap_or_default();
                frame.push(b'\n');
                Bytes::from(frame)
            })
            // watches are open ended up to the server-wide floor; clients
            // reconnect with the last seen resourceVersion
            .take_until(tokio::time::sleep(self.config.min_request_timeout))
            .boxed();

        Ok(ApiResponse::stream("application/json", frames))
    }

    async fn update(
        &self,
        serving: &ServingInfo,
        version: &CompiledVersion,
        info: &RequestInfo,
        request: &ApiRequest,
        name: &str,
    ) -> Result<ApiResponse, ApiError> {
        let incoming = self.decode_body(request)?;
        if !incoming.name().is_empty() && incoming.name() != name {
            return Err(ApiError::bad_request(format!(
                "name \"{}\" does not match the request path",
                incoming.name()
            )));
        }

        let stored_old = serving.store.get(info.namespace.as_deref(), name).await?;
        let old = serving
            .converter
            .convert_one(stored_old, &version.api_version)
            .await?;

        let (mut object, expected_version) = match info.subresource() {
            SUBRESOURCE_STATUS => {
                let mut merged = old.clone();
                match incoming.value().get("status") {
                    Some(status) => {
                        merged
                            .value_mut()
                            .as_object_mut()
                            .ok_or_else(|| ApiError::internal("stored object is not an object"))?
                            .insert("status".to_owned(), status.clone());
                    }
                    None => {
                        if let Some(root) = merged.value_mut().as_object_mut() {
                            root.remove("status");
                        }
                    }
                }
                let expected = incoming.resource_version().to_owned();
                (merged, expected)
            }
            SUBRESOURCE_SCALE => {
                let scale = version
                    .subresources
                    .scale
                    .as_ref()
                    .expect("scale subresource checked");
                let mut merged = old.clone();
                scale_project::apply_scale(&mut merged, scale, incoming.value())?;
                let expected = incoming.resource_version().to_owned();
                (merged, expected)
            }
            _ => {
                let mut object = incoming;
                self.rebase_metadata(&old, &mut object);
                if version.subresources.status.is_some() {
                    let old_status = old.value().get("status").cloned();
                    let root = object
                        .value_mut()
                        .as_object_mut()
                        .ok_or_else(|| ApiError::bad_request("body must be an object"))?;
                    match old_status {
                        Some(status) => {
                            root.insert("status".to_owned(), status);
                        }
                        None => {
                            root.remove("status");
                        }
                    }
                }
                let expected = object.resource_version().to_owned();
                (object, expected)
            }
        };
        object.set_api_version(&version.api_version);
        object.set_kind(&serving.kind);

        self.write_through(
            serving, version, info, request, name, object, &old, expected_version,
        )
        .await
    }

    async fn patch(
        &self,
        serving: &ServingInfo,
        version: &CompiledVersion,
        info: &RequestInfo,
        request: &ApiRequest,
        name: &str,
    ) -> Result<ApiResponse, ApiError> {
        let patch_type = PatchType::from_content_type(request.content_type())
            .ok_or_else(|| {
                ApiError::bad_request(format!(
                    "unsupported patch content type \"{}\"",
                    request.content_type()
                ))
            })?;

        let existing = match serving.store.get(info.namespace.as_deref(), name).await {
            Ok(stored) => Some(
                serving
                    .converter
                    .convert_one(stored, &version.api_version)
                    .await?,
            ),
            Err(err) if err.is_not_found() && patch_type == PatchType::Apply => None,
            Err(err) => return Err(err),
        };

        let Some(old) = existing else {
            // apply against a missing object creates it, with the manager
            // owning everything it sent
            let options: PatchOptions = request.options()?;
            let manager = options
                .field_manager
                .filter(|m| !m.is_empty())
                .ok_or_else(|| ApiError::bad_request("fieldManager is required for apply"))?;
            let mut applied = self.decode_body(request)?;
            let applied_set =
                apix_patch::extract_field_set(version.schema.as_deref(), applied.value());
            applied.set_managed_fields(serde_json::json!([{
                "manager": manager,
                "operation": "Apply",
                "apiVersion": version.api_version,
                "time": now_timestamp(),
                "fieldsV1": applied_set,
            }]));
            let mut request = request.clone();
            request.body = Bytes::from(serde_json::to_vec(applied.value()).unwrap_or_default());
            let mut created = self.create(serving, version, info, &request).await?;
            created.status = StatusCode::CREATED;
            return Ok(created);
        };

        let mut object = old.clone();
        match patch_type {
            PatchType::Json => {
                let operations: Vec<PatchOperation> = serde_json::from_slice(&request.body)
                    .map_err(|err| ApiError::bad_request(format!("invalid json patch: {err}")))?;
                apix_patch::apply_json_patch(object.value_mut(), &operations)
                    .map_err(|err| ApiError::bad_request(err.to_string()))?;
            }
            PatchType::Merge => {
                let patch = self.decode_body(request)?;
                apix_patch::apply_merge_patch(object.value_mut(), patch.value());
            }
            PatchType::StrategicMerge => {
                let patch = self.decode_body(request)?;
                apix_patch::strategic_merge(
                    version.schema.as_deref(),
                    object.value_mut(),
                    patch.value(),
                );
            }
            PatchType::Apply => {
                object = self.server_side_apply(serving, version, request, &old)?;
            }
        }

        self.rebase_metadata(&old, &mut object);
        if info.subresource() == SUBRESOURCE_STATUS {
            // a status patch only moves the status subtree
            let mut merged = old.clone();
            let status = object.value().get("status").cloned();
            if let Some(root) = merged.value_mut().as_object_mut() {
                match status {
                    Some(status) => {
                        root.insert("status".to_owned(), status);
                    }
                    None => {
                        root.remove("status");
                    }
                }
            }
            object = merged;
        } else if version.subresources.status.is_some() {
            let old_status = old.value().get("status").cloned();
            if let Some(root) = object.value_mut().as_object_mut() {
                match old_status {
                    Some(status) => {
                        root.insert("status".to_owned(), status);
                    }
                    None => {
                        root.remove("status");
                    }
                }
            }
        }
        object.set_api_version(&version.api_version);
        object.set_kind(&serving.kind);

        let expected = old.resource_version().to_owned();
        self.write_through(serving, version, info, request, name, object, &old, expected)
            .await
    }

    /// shared tail of every write: defaults, admission, validation with
    /// the pre-image bound, conversion to the storage version, and the
    /// compare-and-swap write
    #[allow(clippy::too_many_arguments)]
    async fn write_through(
        &self,
        serving: &ServingInfo,
        version: &CompiledVersion,
        info: &RequestInfo,
        request: &ApiRequest,
        name: &str,
        mut object: Unstructured,
        old: &Unstructured,
        expected_version: String,
    ) -> Result<ApiResponse, ApiError> {
        let is_main_scope = info.subresource().is_empty();

        self.default_and_admit(
            serving,
            version,
            info,
            AdmissionOperation::Update,
            &mut object,
            Some(old),
        )
        .await?;
        self.validate(serving, version, &object, Some(old))?;
        self.config
            .admission
            .validate(
                &self.attributes(info, AdmissionOperation::Update, name),
                &object,
                Some(old),
            )
            .await?;

        if is_main_scope && spec_changed(old.value(), object.value()) {
            object.set_generation(old.generation() + 1);
        } else {
            object.set_generation(old.generation());
        }

        let stored = self.to_storage(serving, object).await?;
        let (written, _deleted) = serving
            .store
            .update(info.namespace.as_deref(), name, stored, &expected_version)
            .await?;
        self.record_stored_version(serving).await;

        let response = serving
            .converter
            .convert_one(written, &version.api_version)
            .await?;
        self.encode(request, StatusCode::OK, response.value())
    }

    fn server_side_apply(
        &self,
        serving: &ServingInfo,
        version: &CompiledVersion,
        request: &ApiRequest,
        old: &Unstructured,
    ) -> Result<Unstructured, ApiError> {
        if !version.structural {
            return Err(ApiError::bad_request(
                "server side apply requires a structural schema",
            ));
        }
        let options: PatchOptions = request.options()?;
        let manager = options
            .field_manager
            .clone()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ApiError::bad_request("fieldManager is required for apply"))?;
        let force = options.force.unwrap_or(false);
        let applied = self.decode_body(request)?;
        let schema = version.schema.as_deref();

        let applied_set = apix_patch::extract_field_set(schema, applied.value());
        let managed = old
            .managed_fields()
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if !force {
            let mut conflicts = vec![];
            for entry in &managed {
                let owner = entry.get("manager").and_then(Value::as_str).unwrap_or("");
                if owner == manager || owner.is_empty() {
                    continue;
                }
                if let Some(owned) = entry.get("fieldsV1") {
                    conflicts.extend(apix_patch::field_conflicts(
                        &applied_set,
                        applied.value(),
                        old.value(),
                        owner,
                        owned,
                    ));
                }
            }
            if !conflicts.is_empty() {
                let detail: Vec<String> = conflicts
                    .iter()
                    .map(|c| format!("{} (owned by {})", c.path, c.manager))
                    .collect();
                return Err(ApiError::conflict(
                    &serving.plural,
                    old.name(),
                    format!("apply conflicts: {}", detail.join(", ")),
                ));
            }
        }

        let own_previous = managed
            .iter()
            .find(|entry| entry.get("manager").and_then(Value::as_str) == Some(manager.as_str()))
            .and_then(|entry| entry.get("fieldsV1"))
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        let mut object = old.clone();
        apix_patch::strategic_merge(schema, object.value_mut(), applied.value());
        apix_patch::remove_abandoned_fields(&own_previous, &applied_set, object.value_mut());

        let mut entries: Vec<Value> = managed
            .into_iter()
            .filter(|entry| {
                entry.get("manager").and_then(Value::as_str) != Some(manager.as_str())
            })
            .collect();
        entries.push(serde_json::json!({
            "manager": manager,
            "operation": "Apply",
            "apiVersion": version.api_version,
            "time": now_timestamp(),
            "fieldsV1": applied_set,
        }));
        object.set_managed_fields(Value::Array(entries));
        Ok(object)
    }

    async fn delete(
        &self,
        serving: &ServingInfo,
        version: &CompiledVersion,
        info: &RequestInfo,
        request: &ApiRequest,
        name: &str,
    ) -> Result<ApiResponse, ApiError> {
        let options = delete_options(request)?;

        let existing = serving.store.get(info.namespace.as_deref(), name).await?;
        self.config
            .admission
            .validate(
                &self.attributes(info, AdmissionOperation::Delete, name),
                &existing,
                Some(&existing),
            )
            .await?;

        let (object, pending) = serving
            .store
            .delete(info.namespace.as_deref(), name, &options)
            .await?;
        if pending {
            let converted = serving
                .converter
                .convert_one(object, &version.api_version)
                .await?;
            return self.encode(request, StatusCode::OK, converted.value());
        }
        debug!(name, resource = %serving.plural, "object deleted");
        self.encode(request, StatusCode::OK, &Status::success())
    }

    async fn delete_collection(
        &self,
        serving: &ServingInfo,
        version: &CompiledVersion,
        info: &RequestInfo,
        request: &ApiRequest,
    ) -> Result<ApiResponse, ApiError> {
        let options: ListOptions = request.options()?;
        let delete_options = delete_options(request)?;
        let list = serving
            .store
            .list(info.namespace.as_deref(), &options, &version.selectable)
            .await?;
        for item in &list.items {
            let namespace = if item.namespace().is_empty() {
                None
            } else {
                Some(item.namespace())
            };
            match serving
                .store
                .delete(namespace, item.name(), &delete_options)
                .await
            {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        self.encode(request, StatusCode::OK, &Status::success())
    }

    async fn default_and_admit(
        &self,
        _serving: &ServingInfo,
        version: &CompiledVersion,
        info: &RequestInfo,
        operation: AdmissionOperation,
        object: &mut Unstructured,
        old: Option<&Unstructured>,
    ) -> Result<(), ApiError> {
        if version.structural {
            if let Some(schema) = &version.schema {
                apix_schema::apply_defaults(schema, object.value_mut());
            }
        }
        let object_name = object.name().to_string();
        self.config
            .admission
            .mutate(
                &self.attributes(info, operation, &object_name),
                object,
                old,
            )
            .await?;
        if version.structural {
            if let Some(schema) = &version.schema {
                apix_schema::prune(schema, object.value_mut());
            }
        }
        Ok(())
    }

    /// schema, metadata and expression validation; every failure is
    /// reported, none short-circuits
    fn validate(
        &self,
        serving: &ServingInfo,
        version: &CompiledVersion,
        object: &Unstructured,
        old: Option<&Unstructured>,
    ) -> Result<(), ApiError> {
        let mut causes: Vec<Cause> = vec![];
        for failure in metaschema::validate_metadata(object.value(), serving.namespaced) {
            causes.push(failure.to_cause());
        }
        if let Some(schema) = &version.schema {
            for failure in apix_schema::validate(schema, object.value()) {
                causes.push(failure.to_cause());
            }
            if version.structural {
                for failure in apix_cel::evaluate(
                    &version.rules,
                    schema,
                    object.value(),
                    old.map(Unstructured::value),
                ) {
                    causes.push(failure.to_cause());
                }
            }
        }
        if causes.is_empty() {
            Ok(())
        } else {
            Err(ApiError::invalid(&serving.kind, object.name(), causes))
        }
    }

    /// keep server owned identity fields from the stored object
    fn rebase_metadata(&self, old: &Unstructured, object: &mut Unstructured) {
        let uid = old.uid().to_owned();
        let created = old.creation_timestamp().to_owned();
        let old_managed = old.managed_fields().cloned();
        let metadata = object.metadata_mut();
        metadata.insert("uid".to_owned(), serde_json::json!(uid));
        metadata.insert("creationTimestamp".to_owned(), serde_json::json!(created));
        if !metadata.contains_key("managedFields") {
            if let Some(managed) = old_managed {
                metadata.insert("managedFields".to_owned(), managed);
            }
        }
        if !metadata.contains_key("resourceVersion") {
            metadata.insert(
                "resourceVersion".to_owned(),
                serde_json::json!(old.resource_version()),
            );
        }
        if let Some(stamp) = old.deletion_timestamp() {
            metadata.insert("deletionTimestamp".to_owned(), serde_json::json!(stamp));
        }
    }

    async fn to_storage(
        &self,
        serving: &ServingInfo,
        object: Unstructured,
    ) -> Result<Unstructured, ApiError> {
        let storage_api_version = format!("{}/{}", serving.group, serving.storage_version);
        serving.converter.convert_one(object, &storage_api_version).await
    }

    /// storedVersions is append-only and best effort on the write path
    async fn record_stored_version(&self, serving: &ServingInfo) {
        let name = serving.crd.metadata.name.clone();
        if serving
            .crd
            .status
            .stored_versions
            .iter()
            .any(|v| v == &serving.storage_version)
        {
            return;
        }
        if let Err(err) = self
            .crds
            .ensure_stored_version(&name, &serving.storage_version)
            .await
        {
            warn!(crd = %name, %err, "failed to record stored version");
        }
    }

    fn attributes<'a>(
        &self,
        info: &'a RequestInfo,
        operation: AdmissionOperation,
        name: &'a str,
    ) -> AdmissionAttributes<'a> {
        AdmissionAttributes {
            operation,
            group: &info.group,
            version: &info.version,
            resource: &info.resource,
            subresource: info.subresource(),
            namespace: info.namespace.as_deref().unwrap_or(""),
            name,
        }
    }

    fn decode_body(&self, request: &ApiRequest) -> Result<Unstructured, ApiError> {
        if request.body.len() as u64 > self.config.max_request_body_bytes {
            return Err(ApiError::bad_request(format!(
                "request body exceeds the {} byte limit",
                self.config.max_request_body_bytes
            )));
        }
        if request.body.is_empty() {
            return Err(ApiError::bad_request("request body is required"));
        }
        let content_type = request.content_type();
        let value: Value = if content_type.contains("yaml") {
            serde_yaml::from_slice(&request.body)
                .map_err(|err| ApiError::bad_request(format!("malformed yaml body: {err}")))?
        } else {
            serde_json::from_slice(&request.body)
                .map_err(|err| ApiError::bad_request(format!("malformed json body: {err}")))?
        };
        if !value.is_object() {
            return Err(ApiError::bad_request("body must be a json object"));
        }
        Ok(Unstructured::new(value))
    }

    fn encode<T: Serialize>(
        &self,
        request: &ApiRequest,
        status: StatusCode,
        body: &T,
    ) -> Result<ApiResponse, ApiError> {
        match negotiate(request.accept())? {
            Encoding::Yaml => {
                let text = serde_yaml::to_string(body)
                    .map_err(|err| ApiError::internal(format!("yaml encode: {err}")))?;
                Ok(ApiResponse::full(status, "application/yaml", text))
            }
            Encoding::Json => {
                let bytes = serde_json::to_vec(body)
                    .map_err(|err| ApiError::internal(format!("json encode: {err}")))?;
                Ok(ApiResponse::json(status, bytes))
            }
        }
    }
}

fn delete_options(request: &ApiRequest) -> Result<DeleteOptions, ApiError> {
    if request.body.is_empty() {
        return Ok(DeleteOptions::default());
    }
    serde_json::from_slice(&request.body)
        .map_err(|err| ApiError::bad_request(format!("invalid delete options: {err}")))
}

async fn convert_event(
    converter: &apix_conversion::Converter,
    object: Unstructured,
    target: &str,
    wrap: fn(Unstructured) -> WatchEvent,
) -> WatchEvent {
    match converter.convert_one(object, target).await {
        Ok(converted) => wrap(converted),
        Err(err) => WatchEvent::Error(err.to_status()),
    }
}

/// the protobuf and cbor bindings are not carried; a request insisting on
/// them is not satisfiable
fn negotiate(accept: &str) -> Result<Encoding, ApiError> {
    let mut saw_unsupported = false;
    for candidate in accept.split(',') {
        let media = candidate.split(';').next().unwrap_or("").trim();
        match media {
            "" | "*/*" | "application/*" | "application/json" => return Ok(Encoding::Json),
            "application/yaml" => return Ok(Encoding::Yaml),
            _ => saw_unsupported = true,
        }
    }
    if saw_unsupported {
        return Err(ApiError::bad_request(format!(
            "none of the requested media types ({accept}) are supported; \
             use application/json or application/yaml"
        )));
    }
    Ok(Encoding::Json)
}

/// anything outside metadata and status counts as spec for generation
/// accounting
fn spec_changed(old: &Value, new: &Value) -> bool {
    let strip = |value: &Value| -> Value {
        let mut clone = value.clone();
        if let Some(root) = clone.as_object_mut() {
            root.remove("metadata");
            root.remove("status");
        }
        clone
    };
    strip(old) != strip(new)
}
