//!
//! # Per-type storage
//!
//! Thin adapter between the dispatcher and the key value contract: one
//! key prefix per (group, resource), storage version documents as values,
//! optimistic concurrency on the store revision, finalizer aware deletes
//! and revision ordered watches.
//!
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use tracing::debug;

use apix_types::now_timestamp;
use apix_types::timestamp_after;
use apix_types::options::DeleteOptions;
use apix_types::options::ListOptions;
use apix_types::ApiError;
use apix_types::Unstructured;
use apix_types::UnstructuredList;
use apix_types::WatchEvent;

use crate::kv::KeyValueStore;
use crate::kv::KvEvent;
use crate::kv::StoreError;
use crate::selector::FieldSelector;
use crate::selector::LabelSelector;

const BOOKMARK_INTERVAL: Duration = Duration::from_secs(60);

/// storage handle for one (group, resource); shared by every served
/// version of the owning definition
pub struct ResourceStore {
    kv: Arc<dyn KeyValueStore>,
    prefix: String,
    namespaced: bool,
    resource: String,
}

impl ResourceStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, group: &str, plural: &str, namespaced: bool) -> Self {
        Self {
            kv,
            prefix: format!("/{group}/{plural}"),
            namespaced,
            resource: plural.to_owned(),
        }
    }

    pub fn namespaced(&self) -> bool {
        self.namespaced
    }

    fn key(&self, namespace: Option<&str>, name: &str) -> String {
        match (self.namespaced, namespace) {
            (true, Some(ns)) => format!("{}/{}/{}", self.prefix, ns, name),
            _ => format!("{}/{}", self.prefix, name),
        }
    }

    fn scope_prefix(&self, namespace: Option<&str>) -> String {
        match (self.namespaced, namespace) {
            (true, Some(ns)) => format!("{}/{}/", self.prefix, ns),
            _ => format!("{}/", self.prefix),
        }
    }

    fn store_error(&self, error: StoreError, name: &str) -> ApiError {
        match error {
            StoreError::NotFound => ApiError::not_found(&self.resource, name),
            StoreError::AlreadyExists => ApiError::already_exists(&self.resource, name),
            StoreError::Conflict { .. } => ApiError::conflict(
                &self.resource,
                name,
                "the object has been modified; please apply your changes to the latest version and try again",
            ),
            StoreError::Expired(revision) => {
                ApiError::expired(format!("resource version {revision} is too old"))
            }
            StoreError::Internal(message) => ApiError::internal(message),
        }
    }

    pub async fn create(
        &self,
        namespace: Option<&str>,
        mut object: Unstructured,
    ) -> Result<Unstructured, ApiError> {
        if object.name().is_empty() {
            let base = object.generate_name().to_owned();
            if base.is_empty() {
                return Err(ApiError::bad_request("name or generateName is required"));
            }
            object.set_name(&format!("{base}{}", random_suffix()));
        }
        if let Some(ns) = namespace {
            object.set_namespace(ns);
        }
        object.set_uid(&generate_uid());
        object.set_creation_timestamp(&now_timestamp());
        object.set_generation(1);
        object.metadata_mut().remove("deletionTimestamp");

        let name = object.name().to_owned();
        let key = self.key(namespace, &name);
        debug!(key, "creating object");
        let pair = self
            .kv
            .insert(&key, object.into_value())
            .await
            .map_err(|err| self.store_error(err, &name))?;
        Ok(Unstructured::new(pair.value))
    }

    pub async fn get(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Unstructured, ApiError> {
        let key = self.key(namespace, name);
        match self.kv.get(&key).await {
            Ok(Some(pair)) => Ok(Unstructured::new(pair.value)),
            Ok(None) => Err(ApiError::not_found(&self.resource, name)),
            Err(err) => Err(self.store_error(err, name)),
        }
    }

    /// compare-and-swap write. When the incoming object carries no
    /// resource version the current one is used. A write that ends with a
    /// deletion timestamp and no finalizers deletes the object in the
    /// same call; the flag in the result reports that.
    pub async fn update(
        &self,
        namespace: Option<&str>,
        name: &str,
        object: Unstructured,
        expected_version: &str,
    ) -> Result<(Unstructured, bool), ApiError> {
        let key = self.key(namespace, name);
        let expected = if expected_version.is_empty() {
            match self.kv.get(&key).await {
                Ok(Some(pair)) => pair.revision,
                Ok(None) => return Err(ApiError::not_found(&self.resource, name)),
                Err(err) => return Err(self.store_error(err, name)),
            }
        } else {
            parse_revision(expected_version)?
        };

        let removable = object.deletion_timestamp().is_some() && object.finalizers().is_empty();
        let pair = self
            .kv
            .update(&key, object.into_value(), expected)
            .await
            .map_err(|err| self.store_error(err, name))?;

        if removable {
            debug!(key, "final finalizer removed, deleting");
            let deleted = self
                .kv
                .delete(&key, Some(pair.revision))
                .await
                .map_err(|err| self.store_error(err, name))?;
            return Ok((Unstructured::new(deleted.value), true));
        }
        Ok((Unstructured::new(pair.value), false))
    }

    /// finalizer aware delete: with finalizers present the object is
    /// written back carrying a deletion timestamp instead of being
    /// removed. The flag in the result reports whether deletion is
    /// pending on finalizers.
    pub async fn delete(
        &self,
        namespace: Option<&str>,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(Unstructured, bool), ApiError> {
        let key = self.key(namespace, name);
        let pair = match self.kv.get(&key).await {
            Ok(Some(pair)) => pair,
            Ok(None) => return Err(ApiError::not_found(&self.resource, name)),
            Err(err) => return Err(self.store_error(err, name)),
        };
        let mut object = Unstructured::new(pair.value.clone());

        if let Some(preconditions) = &options.preconditions {
            if let Some(uid) = &preconditions.uid {
                if object.uid() != uid {
                    return Err(ApiError::conflict(
                        &self.resource,
                        name,
                        format!("the UID in the precondition ({uid}) does not match"),
                    ));
                }
            }
            if let Some(version) = &preconditions.resource_version {
                if object.resource_version() != version {
                    return Err(ApiError::conflict(
                        &self.resource,
                        name,
                        format!("the resourceVersion in the precondition ({version}) does not match"),
                    ));
                }
            }
        }

        // the requested propagation policy rides along as the matching
        // finalizer so the external collector can observe it
        if object.deletion_timestamp().is_none() {
            if let Some(finalizer) = options.propagation_policy.and_then(|p| p.finalizer()) {
                if !object.finalizers().iter().any(|f| *f == finalizer) {
                    let mut finalizers: Vec<String> =
                        object.finalizers().iter().map(|f| (*f).to_owned()).collect();
                    finalizers.push(finalizer.to_owned());
                    object.set_finalizers(finalizers);
                }
            }
        }

        if !object.finalizers().is_empty() {
            if object.deletion_timestamp().is_none() {
                let stamp = match options.grace_period_seconds {
                    Some(grace) => timestamp_after(grace),
                    None => now_timestamp(),
                };
                object.set_deletion_timestamp(&stamp);
                if let Some(grace) = options.grace_period_seconds {
                    object
                        .metadata_mut()
                        .insert("deletionGracePeriodSeconds".to_owned(), json!(grace));
                }
                let updated = self
                    .kv
                    .update(&key, object.into_value(), pair.revision)
                    .await
                    .map_err(|err| self.store_error(err, name))?;
                return Ok((Unstructured::new(updated.value), true));
            }
            return Ok((object, true));
        }

        let deleted = self
            .kv
            .delete(&key, Some(pair.revision))
            .await
            .map_err(|err| self.store_error(err, name))?;
        Ok((Unstructured::new(deleted.value), false))
    }

    pub async fn list(
        &self,
        namespace: Option<&str>,
        options: &ListOptions,
        selectable: &[String],
    ) -> Result<UnstructuredList, ApiError> {
        let (label_selector, field_selector) = parse_selectors(options)?;
        let prefix = self.scope_prefix(namespace);
        let (pairs, revision) = self
            .kv
            .list(&prefix)
            .await
            .map_err(|err| self.store_error(err, ""))?;

        let mut list = UnstructuredList::default();
        list.metadata.resource_version = revision.to_string();

        let continue_after = options.continue_token.as_deref().unwrap_or("");
        let limit = options.limit.unwrap_or(0) as usize;
        let mut skipped_remainder = 0i64;

        for pair in pairs {
            if !continue_after.is_empty() && pair.key.as_str() <= continue_after {
                continue;
            }
            let object = Unstructured::new(pair.value);
            if !label_selector.matches(object.labels()) {
                continue;
            }
            if !field_selector.matches(&object, selectable)? {
                continue;
            }
            if limit > 0 && list.items.len() == limit {
                skipped_remainder += 1;
                if list.metadata.continue_token.is_none() {
                    list.metadata.continue_token =
                        Some(list.items.last().map(|o| self.key(namespace_of(o), o.name())).unwrap_or_default());
                }
                continue;
            }
            list.items.push(object);
        }
        if skipped_remainder > 0 {
            list.metadata.remaining_item_count = Some(skipped_remainder);
        } else {
            list.metadata.continue_token = None;
        }
        Ok(list)
    }

    /// storage level watch: revision ordered events for the scope,
    /// filtered by the request selectors
    pub async fn watch(
        &self,
        namespace: Option<&str>,
        options: &ListOptions,
        selectable: &[String],
    ) -> Result<BoxStream<'static, WatchEvent>, ApiError> {
        let (label_selector, field_selector) = parse_selectors(options)?;
        let selectable = selectable.to_vec();
        let from = match options.resource_version.as_deref() {
            None | Some("") => self.kv.current_revision().await,
            Some(version) => parse_revision(version)?,
        };
        let prefix = self.scope_prefix(namespace);
        let events = self
            .kv
            .watch_prefix(&prefix, from)
            .map_err(|err| self.store_error(err, ""))?;

        let bookmarks = options.allow_watch_bookmarks.unwrap_or(false);
        let mut interval = tokio::time::interval(BOOKMARK_INTERVAL);
        interval.tick().await; // the first tick is immediate

        let state = WatchState {
            events,
            interval,
            bookmarks,
            last_revision: from,
            label_selector,
            field_selector,
            selectable,
        };
        Ok(futures_util::stream::unfold(state, next_watch_event).boxed())
    }
}

struct WatchState {
    events: BoxStream<'static, KvEvent>,
    interval: tokio::time::Interval,
    bookmarks: bool,
    last_revision: u64,
    label_selector: LabelSelector,
    field_selector: FieldSelector,
    selectable: Vec<String>,
}

async fn next_watch_event(mut state: WatchState) -> Option<(WatchEvent, WatchState)> {
    loop {
        tokio::select! {
            event = state.events.next() => {
                let event = event?;
                state.last_revision = event.revision();
                let (object, watch_event) = match event {
                    KvEvent::Put { pair, created: true } => {
                        let object = Unstructured::new(pair.value);
                        (object.clone(), WatchEvent::Added(object))
                    }
                    KvEvent::Put { pair, created: false } => {
                        let object = Unstructured::new(pair.value);
                        (object.clone(), WatchEvent::Modified(object))
                    }
                    KvEvent::Delete { pair } => {
                        let mut object = Unstructured::new(pair.value);
                        object.set_resource_version(&pair.revision.to_string());
                        (object.clone(), WatchEvent::Deleted(object))
                    }
                };
                if !state.label_selector.matches(object.labels()) {
                    continue;
                }
                if !state
                    .field_selector
                    .matches(&object, &state.selectable)
                    .unwrap_or(false)
                {
                    continue;
                }
                return Some((watch_event, state));
            }
            _ = state.interval.tick(), if state.bookmarks => {
                let bookmark = Unstructured::new(json!({
                    "metadata": { "resourceVersion": state.last_revision.to_string() }
                }));
                return Some((WatchEvent::Bookmark(bookmark), state));
            }
        }
    }
}

fn parse_selectors(options: &ListOptions) -> Result<(LabelSelector, FieldSelector), ApiError> {
    let label_selector = match options.label_selector.as_deref() {
        Some(raw) => LabelSelector::parse(raw)?,
        None => LabelSelector::default(),
    };
    let field_selector = match options.field_selector.as_deref() {
        Some(raw) => FieldSelector::parse(raw)?,
        None => FieldSelector::default(),
    };
    Ok((label_selector, field_selector))
}

fn parse_revision(version: &str) -> Result<u64, ApiError> {
    version.parse().map_err(|_| {
        ApiError::bad_request(format!("invalid resourceVersion \"{version}\""))
    })
}

fn namespace_of(object: &Unstructured) -> Option<&str> {
    let namespace = object.namespace();
    if namespace.is_empty() {
        None
    } else {
        Some(namespace)
    }
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .take(5)
        .collect()
}

/// version independent identity assigned at create
fn generate_uid() -> String {
    let mut rng = rand::thread_rng();
    let hex: String = (0..32)
        .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
        .collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod test {

    use serde_json::json;

    use super::*;
    use crate::kv::MemoryStore;

    fn store() -> ResourceStore {
        ResourceStore::new(MemoryStore::shared(), "example.com", "widgets", true)
    }

    fn widget(name: &str) -> Unstructured {
        Unstructured::new(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": { "name": name },
            "spec": { "replicas": 1 }
        }))
    }

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let store = store();
        let created = store
            .create(Some("default"), widget("a"))
            .await
            .expect("create");
        assert_eq!(created.name(), "a");
        assert_eq!(created.namespace(), "default");
        assert!(!created.uid().is_empty());
        assert!(!created.resource_version().is_empty());
        assert_eq!(created.generation(), 1);

        let err = store.create(Some("default"), widget("a")).await.unwrap_err();
        assert_eq!(err.kind, apix_types::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_generate_name() {
        let store = store();
        let mut object = widget("");
        object.metadata_mut().remove("name");
        object
            .metadata_mut()
            .insert("generateName".to_owned(), json!("widget-"));
        let created = store.create(Some("default"), object).await.expect("create");
        assert!(created.name().starts_with("widget-"));
        assert_eq!(created.name().len(), "widget-".len() + 5);
    }

    #[tokio::test]
    async fn test_optimistic_concurrency() {
        let store = store();
        let created = store.create(Some("default"), widget("a")).await.unwrap();
        let version = created.resource_version().to_owned();

        let mut first = created.clone();
        first.value_mut()["spec"]["replicas"] = json!(2);
        let (updated, _) = store
            .update(Some("default"), "a", first, &version)
            .await
            .expect("first update");
        assert_ne!(updated.resource_version(), version);

        let mut second = created.clone();
        second.value_mut()["spec"]["replicas"] = json!(3);
        let err = store
            .update(Some("default"), "a", second, &version)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_finalizer_delete_flow() {
        let store = store();
        let mut object = widget("a");
        object.set_finalizers(vec!["example.com/protect".to_owned()]);
        let created = store.create(Some("default"), object).await.unwrap();

        let (terminating, pending) = store
            .delete(Some("default"), "a", &DeleteOptions::default())
            .await
            .expect("delete");
        assert!(pending);
        assert!(terminating.deletion_timestamp().is_some());

        // still present until the finalizer clears
        assert!(store.get(Some("default"), "a").await.is_ok());

        let mut cleared = terminating.clone();
        cleared.set_finalizers(vec![]);
        let version = cleared.resource_version().to_owned();
        let (_, deleted) = store
            .update(Some("default"), "a", cleared, &version)
            .await
            .expect("finalizer removal");
        assert!(deleted);
        assert!(store.get(Some("default"), "a").await.unwrap_err().is_not_found());
        let _ = created;
    }

    #[tokio::test]
    async fn test_grace_period_sets_deadline() {
        let store = store();
        let mut object = widget("a");
        object.set_finalizers(vec!["example.com/protect".to_owned()]);
        store.create(Some("default"), object).await.unwrap();

        let options = DeleteOptions {
            grace_period_seconds: Some(30),
            ..Default::default()
        };
        let (terminating, pending) = store
            .delete(Some("default"), "a", &options)
            .await
            .expect("delete");
        assert!(pending);
        assert_eq!(
            terminating
                .value()
                .pointer("/metadata/deletionGracePeriodSeconds"),
            Some(&json!(30))
        );
        let deadline = terminating.deletion_timestamp().expect("deadline");
        assert!(deadline > apix_types::now_timestamp().as_str());
    }

    #[tokio::test]
    async fn test_foreground_policy_rides_as_finalizer() {
        let store1 = store();
        store1.create(Some("default"), widget("a")).await.unwrap();

        let options = DeleteOptions {
            propagation_policy: Some(apix_types::options::PropagationPolicy::Foreground),
            ..Default::default()
        };
        // no finalizers of its own, but the policy keeps it pending for
        // the collector
        let (terminating, pending) = store1
            .delete(Some("default"), "a", &options)
            .await
            .expect("delete");
        assert!(pending);
        assert_eq!(terminating.finalizers(), vec!["foregroundDeletion"]);
        assert!(terminating.deletion_timestamp().is_some());

        // background deletes immediately when nothing else blocks
        let store2 = store();
        store2.create(Some("default"), widget("b")).await.unwrap();
        let options = DeleteOptions {
            propagation_policy: Some(apix_types::options::PropagationPolicy::Background),
            ..Default::default()
        };
        let (_, pending) = store2
            .delete(Some("default"), "b", &options)
            .await
            .expect("delete");
        assert!(!pending);
    }

    #[tokio::test]
    async fn test_list_with_selector_and_pagination() {
        let store = store();
        for (name, app) in [("a", "web"), ("b", "web"), ("c", "db")] {
            let mut object = widget(name);
            object.value_mut()["metadata"]["labels"] = json!({ "app": app });
            store.create(Some("default"), object).await.unwrap();
        }

        let options = ListOptions {
            label_selector: Some("app=web".to_owned()),
            limit: Some(1),
            ..Default::default()
        };
        let page = store.list(Some("default"), &options, &[]).await.expect("list");
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].name(), "a");
        let token = page.metadata.continue_token.clone().expect("continue");

        let options = ListOptions {
            label_selector: Some("app=web".to_owned()),
            continue_token: Some(token),
            ..Default::default()
        };
        let rest = store.list(Some("default"), &options, &[]).await.expect("list");
        assert_eq!(rest.items.len(), 1);
        assert_eq!(rest.items[0].name(), "b");
    }

    #[tokio::test]
    async fn test_watch_revision_ordering() {
        let store = store();
        let options = ListOptions {
            resource_version: Some("0".to_owned()),
            ..Default::default()
        };
        let mut watch = store
            .watch(Some("default"), &options, &[])
            .await
            .expect("watch");

        let created = store.create(Some("default"), widget("a")).await.unwrap();
        let version = created.resource_version().to_owned();
        let mut updated = created.clone();
        updated.value_mut()["spec"]["replicas"] = json!(5);
        store
            .update(Some("default"), "a", updated, &version)
            .await
            .unwrap();

        let mut revisions = vec![];
        for _ in 0..2 {
            let event = watch.next().await.expect("event");
            let object = event.object().expect("object").clone();
            revisions.push(object.resource_version().parse::<u64>().unwrap());
        }
        assert!(revisions[0] < revisions[1]);
    }
}
